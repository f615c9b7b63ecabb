//! Backend side of restart coordination
//!
//! A backend asks the hub for the restart slot before going down, waits
//! politely while another backend holds it, and reports back once it is up
//! again so the next backend in line can go.

use crate::error::AgentError;
use crate::network::HubLink;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{now_millis, Packet, RestartDecision, RestartState};
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Requests sent before giving up on getting the slot
    pub max_attempts: u32,
    /// Upper bound of the random delay added to every wait, so backends
    /// told the same retry time do not all ask at once
    pub max_jitter: Duration,
    /// Floor for the wait between two requests
    pub min_wait: Duration,
    pub reply_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 120,
            max_jitter: Duration::from_secs(3),
            min_wait: Duration::from_secs(1),
            reply_timeout: Duration::from_secs(5),
        }
    }
}

/// How long to sleep before asking again
pub fn wait_delay(retry_after: u64, now: u64, min_wait: Duration, jitter: Duration) -> Duration {
    Duration::from_millis(retry_after.saturating_sub(now)).max(min_wait) + jitter
}

pub struct RestartAgent {
    link: HubLink,
    server: String,
    retry: RetryPolicy,
    rng: StdRng,
}

impl RestartAgent {
    pub fn new(link: HubLink, server: &str, retry: RetryPolicy) -> Self {
        Self {
            link,
            server: server.to_string(),
            retry,
            rng: StdRng::from_entropy(),
        }
    }

    /// Replaces the jitter source, for reproducible waits
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    fn jitter(&mut self) -> Duration {
        let max_ms = self.retry.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.rng.gen_range(0..=max_ms))
    }

    /// Sends a single restart request and returns the hub's decision
    pub async fn request_once(&self) -> Result<RestartDecision, AgentError> {
        let request = Packet::RestartRequest {
            server: self.server.clone(),
        };

        match self.link.request(&request, self.retry.reply_timeout).await? {
            Packet::RestartResponse { server, decision } if server == self.server => Ok(decision),
            other => Err(AgentError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    /// Asks for the restart slot until it is granted
    ///
    /// `Wait` answers are honoured by sleeping until the hub's retry time plus
    /// jitter. A `Deny` ends the loop with an error.
    pub async fn request_permission(&mut self) -> Result<(), AgentError> {
        for attempt in 1..=self.retry.max_attempts {
            match self.request_once().await? {
                RestartDecision::Allow => {
                    info!("Restart of {} allowed (attempt {})", self.server, attempt);
                    return Ok(());
                }
                RestartDecision::Deny { reason } => {
                    warn!("Restart of {} denied: {}", self.server, reason);
                    return Err(AgentError::Denied(reason));
                }
                RestartDecision::Wait {
                    retry_after,
                    queue_position,
                    reason,
                } => {
                    let jitter = self.jitter();
                    let delay = wait_delay(retry_after, now_millis(), self.retry.min_wait, jitter);
                    match queue_position {
                        Some(position) => info!(
                            "{} is number {} in the restart queue ({}), asking again in {:.1}s",
                            self.server,
                            position,
                            reason,
                            delay.as_secs_f32()
                        ),
                        None => info!(
                            "{} must wait: {}, asking again in {:.1}s",
                            self.server,
                            reason,
                            delay.as_secs_f32()
                        ),
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(AgentError::GaveUp(self.retry.max_attempts))
    }

    /// Tells the hub the restart is over
    pub async fn complete(&self) -> Result<(), AgentError> {
        let packet = Packet::RestartComplete {
            server: self.server.clone(),
        };

        match self.link.request(&packet, self.retry.reply_timeout).await? {
            Packet::RestartAck {
                accepted: true, ..
            } => {
                info!("Hub acknowledged the restart of {}", self.server);
                Ok(())
            }
            Packet::RestartAck { reason, .. } => Err(AgentError::CompletionRejected(
                reason.unwrap_or_else(|| "no reason given".to_string()),
            )),
            other => Err(AgentError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    /// Waits for the slot, runs `command` through the shell and reports back
    ///
    /// Completion is reported even when the command fails, so the slot is not
    /// held until the hub's watchdog clears it.
    pub async fn run_restart(&mut self, command: &str) -> Result<(), AgentError> {
        self.request_permission().await?;

        info!("Running restart command for {}: {}", self.server, command);
        let status = Command::new("sh").arg("-c").arg(command).status().await;

        let completion = self.complete().await;

        match status {
            Ok(status) if status.success() => completion,
            Ok(status) => Err(AgentError::CommandFailed(format!("exited with {}", status))),
            Err(e) => Err(AgentError::CommandFailed(e.to_string())),
        }
    }

    /// Reports a restart that happened without permission (e.g. a crash)
    pub async fn report_unauthorized(&self) -> Result<(), AgentError> {
        let packet = Packet::UnauthorizedRestart {
            server: self.server.clone(),
        };

        match self.link.request(&packet, self.retry.reply_timeout).await? {
            Packet::RestartAck { reason, .. } => {
                info!(
                    "Unauthorized restart of {} recorded{}",
                    self.server,
                    reason.map(|r| format!(": {}", r)).unwrap_or_default()
                );
                Ok(())
            }
            other => Err(AgentError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    pub async fn query_state(&self) -> Result<RestartState, AgentError> {
        match self
            .link
            .request(&Packet::StateQuery, self.retry.reply_timeout)
            .await?
        {
            Packet::StateSnapshot { state } => Ok(state),
            Packet::StateUnavailable { reason } => Err(AgentError::StateUnavailable(reason)),
            other => Err(AgentError::UnexpectedReply(format!("{:?}", other))),
        }
    }
}
