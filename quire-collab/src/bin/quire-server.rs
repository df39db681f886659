//! Standalone collaboration server.
//!
//! ```text
//! RUST_LOG=info quire-server --bind 0.0.0.0:9090
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use quire_collab::{Retention, RoomConfig, ServerConfig, SyncServer};
use quire_core::Operation;

/// Quire collaboration server
#[derive(Parser, Debug)]
#[command(name = "quire-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Outbound messages buffered per client before deliveries are dropped
    #[arg(long, default_value_t = 256)]
    client_buffer: usize,

    /// Log length that triggers a trim
    #[arg(long, default_value_t = 1000)]
    max_log_entries: usize,

    /// Log entries kept after a trim
    #[arg(long, default_value_t = 500)]
    retain_log_entries: usize,

    /// Seconds between status log lines (0 disables)
    #[arg(long, default_value_t = 60)]
    status_interval_secs: u64,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            client_buffer: self.client_buffer,
            room: RoomConfig {
                retention: Retention {
                    max_entries: self.max_log_entries,
                    retain_entries: self.retain_log_entries,
                },
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();
    let args = Args::parse();

    if args.retain_log_entries > args.max_log_entries {
        log::warn!(
            "--retain-log-entries {} exceeds --max-log-entries {}; clamping",
            args.retain_log_entries,
            args.max_log_entries
        );
    }

    let server = Arc::new(SyncServer::<Operation>::new(args.server_config()));

    if args.status_interval_secs > 0 {
        let server = server.clone();
        let period = Duration::from_secs(args.status_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let status = server.status().await;
                let stats = server.stats().await;
                log::info!(
                    "status={} rooms={} clients={} connections={} messages={}",
                    status.status,
                    status.rooms,
                    status.clients,
                    stats.active_connections,
                    stats.total_messages
                );
            }
        });
    }

    server.run().await
}
