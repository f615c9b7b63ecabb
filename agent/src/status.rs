use crate::error::AgentError;
use crate::network::HubLink;
use log::{debug, warn};
use shared::Packet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

/// Where the current player count comes from
#[derive(Debug, Clone)]
pub enum CountSource {
    Fixed(u32),
    /// A file the backend rewrites with its player count
    File(PathBuf),
}

impl CountSource {
    pub async fn read(&self) -> Result<u32, AgentError> {
        match self {
            CountSource::Fixed(count) => Ok(*count),
            CountSource::File(path) => {
                let raw = tokio::fs::read_to_string(path).await?;
                raw.trim()
                    .parse()
                    .map_err(|_| AgentError::Count(format!("'{}' in {}", raw.trim(), path.display())))
            }
        }
    }
}

/// Pushes the backend's occupancy to the hub
pub struct StatusReporter {
    link: HubLink,
    server: String,
    max_count: u32,
    source: CountSource,
}

impl StatusReporter {
    pub fn new(link: HubLink, server: &str, max_count: u32, source: CountSource) -> Self {
        Self {
            link,
            server: server.to_string(),
            max_count,
            source,
        }
    }

    pub async fn report(&self, current_count: u32) -> Result<(), AgentError> {
        self.link
            .send(&Packet::StatusReport {
                server: self.server.clone(),
                current_count,
                max_count: self.max_count,
            })
            .await
    }

    /// Reads the count and reports it once
    pub async fn report_once(&self) -> Result<u32, AgentError> {
        let current_count = self.source.read().await?;
        self.report(current_count).await?;
        debug!(
            "Reported {}: {}/{}",
            self.server, current_count, self.max_count
        );
        Ok(current_count)
    }

    /// Reports every `period` until the process stops
    ///
    /// A count that cannot be read skips the report; the hub then ages the
    /// backend out like any other silent one.
    pub async fn run(&self, period: Duration) -> Result<(), AgentError> {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.report_once().await {
                Ok(_) => {}
                Err(AgentError::Io(e)) if e.kind() != std::io::ErrorKind::NotFound => {
                    return Err(AgentError::Io(e))
                }
                Err(e) => warn!("Skipping status report for {}: {}", self.server, e),
            }
        }
    }
}
