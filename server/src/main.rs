use clap::Parser;
use log::{info, warn};
use server::config::HubConfig;
use server::network::{Server, ServerOptions};
use shared::PriorityRank;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Queue reconciliation passes per second
    #[arg(short, long, default_value = "20")]
    tick_rate: u32,

    /// Maximum number of connected players
    #[arg(short, long, default_value = "500")]
    max_clients: usize,

    /// Hub configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the number of slots kept free for staff
    #[arg(long)]
    reserved_slots: Option<u32>,

    /// Override the lowest rank allowed into reserved slots
    #[arg(long)]
    admin_threshold: Option<PriorityRank>,

    /// Override the per-backend restart cooldown, in seconds
    #[arg(long)]
    restart_cooldown: Option<u64>,

    /// Seconds without a packet before a player is dropped
    #[arg(long, default_value = "10")]
    client_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading hub configuration from {}", path.display());
            HubConfig::load(path)?
        }
        None => {
            warn!("No configuration file given, starting without backends");
            HubConfig::default()
        }
    };

    if let Some(reserved_slots) = args.reserved_slots {
        config.admission.reserved_slots = reserved_slots;
    }
    if let Some(admin_threshold) = args.admin_threshold {
        config.admission.admin_threshold = admin_threshold;
    }
    if let Some(cooldown) = args.restart_cooldown {
        config.restart.cooldown_secs = cooldown;
    }

    let options = ServerOptions {
        tick_duration: Duration::from_secs_f32(1.0 / args.tick_rate.max(1) as f32),
        max_clients: args.max_clients,
        client_timeout: Duration::from_secs(args.client_timeout),
        ..ServerOptions::default()
    };

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::new(&address, &config, options).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
