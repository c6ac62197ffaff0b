//! DACS Node
//!
//! Hosts the truck coordination server for the local truck.

use clap::Parser;
use dacs_core::{DacsConfig, FleetEvent, TieBreak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// DACS truck coordination server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port trucks connect to
    #[arg(short = 'p', long, default_value = "39850")]
    truck_port: u16,

    /// Address to bind the truck listener on
    #[arg(long, default_value = "0.0.0.0")]
    bind_host: String,

    /// Port of the downstream planning service
    #[arg(short = 's', long, default_value = "39851")]
    server_port: u16,

    /// Host of the downstream planning service
    #[arg(long, default_value = "localhost")]
    downstream_host: String,

    /// Do not report new connections to the planning service
    #[arg(long)]
    no_notifier: bool,

    /// Planner connect+send timeout in milliseconds
    #[arg(long, default_value = "2000")]
    notify_timeout_ms: u64,

    /// Distance within which two trucks connect
    #[arg(short = 'r', long, default_value = "300")]
    connection_range: f64,

    /// Id of the locally hosted truck
    #[arg(long, default_value = "current_truck")]
    local_truck_id: String,

    /// Start the local truck as a leader
    #[arg(long)]
    leader: bool,

    /// Seed for random tie-breaks (lowest id wins when unset)
    #[arg(long)]
    seed: Option<u64>,

    /// Messages buffered per truck connection
    #[arg(long, default_value = "64")]
    outbox_capacity: usize,

    /// Longest accepted line in bytes
    #[arg(long, default_value = "65536")]
    max_line_bytes: usize,

    /// Seconds to wait for connections to close on shutdown
    #[arg(long, default_value = "5")]
    shutdown_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn config(&self) -> DacsConfig {
        let tie_break = match self.seed {
            Some(seed) => TieBreak::Seeded(seed),
            None => TieBreak::LowestId,
        };

        let config = DacsConfig::new(self.truck_port, self.server_port)
            .with_bind_host(self.bind_host.clone())
            .with_downstream_host(self.downstream_host.clone())
            .with_notify_timeout(Duration::from_millis(self.notify_timeout_ms))
            .with_connection_range(self.connection_range)
            .with_local_truck(self.local_truck_id.clone(), self.leader)
            .with_tie_break(tie_break)
            .with_outbox_capacity(self.outbox_capacity)
            .with_max_line_bytes(self.max_line_bytes)
            .with_shutdown_timeout(Duration::from_secs(self.shutdown_timeout));

        if self.no_notifier {
            config.without_notifier()
        } else {
            config
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = args.config();
    let shutdown_timeout = config.shutdown_timeout;

    info!("DACS node \"{}\" starting", config.local_truck_id);
    let server = dacs_core::start(config).await?;

    // Report what happens to the local truck
    let local_id = server.local_truck_id().to_string();
    let mut events = server.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(FleetEvent::LeadershipChanged { id, role }) if id == local_id => {
                    info!("Local truck is now {}", role);
                }
                Ok(FleetEvent::ConnectionFormed { truck, peer }) if truck == local_id || peer == local_id => {
                    info!("Local truck connected: {} <-> {}", truck, peer);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("Skipped {} fleet events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!("Listening on {}, press Ctrl+C to stop", server.local_addr());
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    if let Err(e) = server.stop(shutdown_timeout).await {
        warn!("{}", e);
    }

    Ok(())
}
