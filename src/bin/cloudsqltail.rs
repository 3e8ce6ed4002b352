//! Cloud SQL log tailer binary
//!
//! Usage:
//!   cloudsqltail --project my-project --subscription cloudsql-logs
//!   cloudsqltail -f tail.toml --flush-interval 2s
//!   PUBSUB_EMULATOR_HOST=localhost:8085 cloudsqltail --project p --subscription s
//!
//! Log lines go to stdout; diagnostics go to stderr (filter with RUST_LOG).

use clap::error::ErrorKind;
use clap::Parser;
use cloudsqltail_rs::common::{setup_shutdown, TailArgs};
use cloudsqltail_rs::config::FileConfig;
use cloudsqltail_rs::source::{PubSubConfig, PubSubSource};
use cloudsqltail_rs::tailer::Tailer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout belongs to the log shipper
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("cloudsqltail_rs=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = match TailArgs::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => return Err(e.into()),
    };

    let file = args
        .config_file
        .as_deref()
        .map(FileConfig::load)
        .transpose()?;

    let (tailer, warnings) = Tailer::prepare(&args, file, |config| {
        PubSubSource::new(PubSubConfig::from_tail_config(config))
    })?;
    for warning in &warnings {
        warn!("{}", warning);
    }

    let config = tailer.config();
    info!(
        project = %config.project,
        subscription = %config.subscription,
        http_port = config.http_port,
        emulator = config.emulator_host.is_some(),
        "Starting Cloud SQL tailer"
    );

    let (_shutdown_tx, shutdown_rx) = setup_shutdown();
    tailer.run(std::io::stdout(), shutdown_rx).await?;

    info!("Tailer shut down cleanly");
    Ok(())
}
