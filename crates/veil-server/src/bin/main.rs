//! veil-server binary: labeled PSI server

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use veil_core::{LogLevel, TransparentBackend};
use veil_server::{metrics, Dispatcher, ServerConfig, SharedSenderDb};

#[derive(Parser, Debug)]
#[command(name = "veil-server")]
#[command(about = "Serve a SenderDB to PSI clients over TCP")]
struct Args {
    /// JSON config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    params: Option<PathBuf>,

    /// Saved SenderDB to serve
    #[arg(long)]
    db: Option<PathBuf>,

    /// CSV file of `item` or `item,label` rows
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Save the built SenderDB to this path
    #[arg(long)]
    save_db: Option<PathBuf>,

    #[arg(long)]
    listen: Option<SocketAddr>,

    #[arg(long)]
    threads: Option<usize>,

    #[arg(long)]
    nonce_bytes: Option<usize>,

    #[arg(long)]
    compressed: bool,

    /// all, debug, info, warning, error or off
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long)]
    log_file: Option<PathBuf>,

    #[arg(long)]
    no_console: bool,

    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };

        if self.params.is_some() {
            config.params_path = self.params;
        }
        if self.db.is_some() {
            config.db_path = self.db;
        }
        if self.csv.is_some() {
            config.csv_path = self.csv;
        }
        if self.save_db.is_some() {
            config.save_db_path = self.save_db;
        }
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(threads) = self.threads {
            config.thread_count = threads;
        }
        if let Some(nonce) = self.nonce_bytes {
            config.nonce_byte_count = nonce;
        }
        config.compressed |= self.compressed;
        if let Some(level) = self.log_level {
            config.log.level = level.parse::<LogLevel>()?;
        }
        if self.log_file.is_some() {
            config.log.file = self.log_file;
        }
        if self.no_console {
            config.log.console = false;
        }
        if self.metrics_addr.is_some() {
            config.metrics_addr = self.metrics_addr;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;
    config.log.init()?;
    config.validate()?;

    if let Some(addr) = config.metrics_addr {
        metrics::install_prometheus_exporter(addr)?;
    }

    let pool = config.pool_config().build()?;
    tracing::info!(threads = pool.current_num_threads(), "worker pool ready");

    let db = config.open_database(&pool)?;
    tracing::info!(
        items = db.item_count(),
        labeled = db.is_labeled(),
        packing_rate = db.packing_rate(),
        "SenderDB ready"
    );

    let shared = Arc::new(SharedSenderDb::with_db(db));
    let dispatcher: Dispatcher<TransparentBackend> = Dispatcher::new(shared, Arc::new(pool));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    dispatcher.run(config.listen_addr, shutdown).await?;

    Ok(())
}
