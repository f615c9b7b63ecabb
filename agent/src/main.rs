use agent::network::HubLink;
use agent::restart::{RestartAgent, RetryPolicy};
use agent::status::{CountSource, StatusReporter};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Hub address to talk to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    hub: String,

    /// Name of the backend this agent speaks for
    #[arg(short, long)]
    name: String,

    /// Seconds to wait for a hub reply
    #[arg(long, default_value = "5")]
    reply_timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report the backend's player count
    Status {
        /// Player capacity of the backend
        #[arg(short, long)]
        max: u32,

        /// Fixed player count to report
        #[arg(short, long, conflicts_with = "count_file")]
        current: Option<u32>,

        /// File holding the current player count
        #[arg(short = 'f', long)]
        count_file: Option<PathBuf>,

        /// Report every N seconds instead of once
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Wait for the restart slot, run the command, report completion
    Restart {
        /// Shell command performing the restart
        command: String,

        /// Requests sent before giving up
        #[arg(long, default_value = "120")]
        max_attempts: u32,

        /// Upper bound of the random delay between requests, in milliseconds
        #[arg(long, default_value = "3000")]
        max_jitter_ms: u64,
    },

    /// Report a restart that happened without permission
    Unauthorized,

    /// Print the hub's restart state as JSON
    State,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let link = HubLink::connect(&args.hub).await?;
    info!("Agent for {} talking to {}", args.name, link.hub_addr());

    let retry = RetryPolicy {
        reply_timeout: Duration::from_secs(args.reply_timeout),
        ..RetryPolicy::default()
    };

    match args.command {
        Command::Status {
            max,
            current,
            count_file,
            interval,
        } => {
            let source = match count_file {
                Some(path) => CountSource::File(path),
                None => CountSource::Fixed(current.unwrap_or(0)),
            };
            let reporter = StatusReporter::new(link, &args.name, max, source);
            match interval {
                Some(secs) => reporter.run(Duration::from_secs(secs.max(1))).await?,
                None => {
                    reporter.report_once().await?;
                }
            }
        }

        Command::Restart {
            command,
            max_attempts,
            max_jitter_ms,
        } => {
            let retry = RetryPolicy {
                max_attempts,
                max_jitter: Duration::from_millis(max_jitter_ms),
                ..retry
            };
            let mut agent = RestartAgent::new(link, &args.name, retry);
            agent.run_restart(&command).await?;
        }

        Command::Unauthorized => {
            RestartAgent::new(link, &args.name, retry)
                .report_unauthorized()
                .await?;
        }

        Command::State => {
            let state = RestartAgent::new(link, &args.name, retry)
                .query_state()
                .await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
    }

    Ok(())
}
