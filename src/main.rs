use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use groupmesh::{AppEvent, ChannelApplication, Config, GroupEvent, Keypair, Node, UdpTransport};

#[derive(Parser, Debug)]
#[command(name = "groupmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Seed address (`ip:port`); repeatable. Added to any seeds in the config file.
    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<String>,

    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Announce and listen on the local-segment multicast beacon.
    #[arg(long)]
    beacon: bool,

    /// Hex-encoded 32-byte secret key; a fresh identity is generated when absent.
    #[arg(long, value_name = "HEX")]
    secret_key: Option<String>,

    /// Seconds between telemetry snapshots in the log.
    #[arg(short, long, default_value = "300", value_parser = clap::value_parser!(u64).range(1..))]
    telemetry_interval: u64,
}

fn load_keypair(secret: Option<&str>) -> Result<Keypair> {
    let Some(secret) = secret else {
        return Ok(Keypair::generate());
    };
    let bytes = hex::decode(secret).context("invalid hex secret key")?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("secret key must be 64 hex characters (32 bytes)"))?;
    Ok(Keypair::from_secret_key_bytes(&bytes))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.seeds.extend(args.bootstrap.iter().cloned());
    if args.beacon {
        config.beacon.enabled = true;
    }

    let keypair = load_keypair(args.secret_key.as_deref())?;
    let (transport, inbound) = UdpTransport::bind(args.bind).await?;
    let (app, mut app_events) = ChannelApplication::new();
    let has_seeds = !config.seeds.is_empty();

    let node = Node::spawn(config, keypair, transport, inbound, Arc::new(app)).await?;
    info!("Node identity: {}", node.id());
    info!("Listening on {}", node.contact().addr);

    if has_seeds {
        match node.bootstrap(Vec::new()).await {
            Ok(contacts) => info!(contacts, "Bootstrap complete"),
            Err(e) => warn!(error = %e, "Bootstrap failed"),
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            Some(event) = app_events.recv() => match event {
                AppEvent::Delivered { sender, plaintext } => {
                    info!(from = %sender.short(), text = %String::from_utf8_lossy(&plaintext), "message");
                }
                AppEvent::Group { group, event: GroupEvent::Message { sender, plaintext } } => {
                    info!(%group, from = %sender.short(), text = %String::from_utf8_lossy(&plaintext), "group message");
                }
                AppEvent::Group { group, event } => info!(%group, ?event, "group event"),
                AppEvent::Failed { message_id, reason } => warn!(%message_id, error = %reason, "delivery failed"),
            },
            _ = interval.tick() => {
                match node.telemetry().await {
                    Ok(snapshot) => info!(
                        contacts = snapshot.contacts,
                        routes = snapshot.routes,
                        pending = snapshot.pending_deliveries,
                        buffered = snapshot.buffered,
                        groups = snapshot.groups,
                        down = snapshot.down,
                        suspended = snapshot.suspended,
                        delivered = snapshot.delivered,
                        exhausted = snapshot.exhausted,
                        "telemetry snapshot"
                    ),
                    Err(e) => {
                        warn!(error = %e, "node stopped");
                        break;
                    }
                }
            }
        }
    }

    node.quit().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_interval_must_be_positive() {
        assert!(Args::try_parse_from(["groupmesh", "--telemetry-interval", "0"]).is_err());
        let args = Args::try_parse_from(["groupmesh", "-t", "5"]).unwrap();
        assert_eq!(args.telemetry_interval, 5);
        assert_eq!(Args::try_parse_from(["groupmesh"]).unwrap().telemetry_interval, 300);
    }
}
