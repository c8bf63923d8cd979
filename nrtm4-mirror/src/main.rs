use std::{
    path::PathBuf,
    sync::{Arc, RwLock},
};

use clap::{Parser, Subcommand};
use iroh_metrics::Registry;
use n0_snafu::ResultExt;
use nrtm4_mirror::{
    AutoUpdater, Processor, ReplicaStore, client::HttpClient, config::Config, metrics::Metrics,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to config file
    #[clap(short, long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bootstrap a new replica from a notification file URL.
    Connect {
        #[clap(long)]
        url: Url,
        #[clap(long, default_value = "")]
        label: String,
    },
    /// Bring a replica up to date once.
    Update {
        #[clap(long)]
        source: String,
        #[clap(long, default_value = "")]
        label: String,
    },
    /// List replicas.
    List {
        #[clap(long)]
        source: Option<String>,
        #[clap(long)]
        label: Option<String>,
    },
    /// Give a replica a new label.
    Rename {
        #[clap(long)]
        source: String,
        #[clap(long, default_value = "")]
        label: String,
        #[clap(long)]
        to: String,
    },
    /// Remove a replica with all its objects.
    Remove {
        #[clap(long)]
        source: String,
        #[clap(long, default_value = "")]
        label: String,
    },
    /// Keep every replica up to date until Ctrl-C.
    Watch,
}

#[tokio::main]
async fn main() -> n0_snafu::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Cli::parse();

    let config = if let Some(path) = args.config {
        debug!("loading config from {:?}", path);
        Config::load(path).await.e()?
    } else {
        debug!("using default config");
        Config::default()
    };

    let store = ReplicaStore::persistent(config.store_path().e()?).e()?;
    let client = HttpClient::new(
        config.fetch.timeout,
        config.fetch.connect_timeout,
        &config.fetch.user_agent,
    )
    .e()?;
    let metrics = Arc::new(Metrics::default());
    let processor = Processor::new(
        Arc::new(store),
        Arc::new(client),
        config.files_dir().e()?,
        config.snapshot.clone(),
    )
    .with_metrics(metrics.clone());

    let res = run(args.command, &config, &processor, metrics).await;
    processor.repository().close().e()?;
    res
}

async fn run(
    command: Command,
    config: &Config,
    processor: &Processor,
    metrics: Arc<Metrics>,
) -> n0_snafu::Result<()> {
    match command {
        Command::Connect { url, label } => {
            let source = processor.connect(&url, &label).await.e()?;
            println!(
                "connected {} {:?} at version {}",
                source.name, source.label, source.version
            );
        }
        Command::Update { source, label } => {
            let outcome = processor.update(&source, &label).await.e()?;
            println!(
                "{} {:?}: {} -> version {}",
                outcome.source.name, outcome.source.label, outcome.state, outcome.source.version
            );
        }
        Command::List { source, label } => {
            let summaries = processor.list_sources().await.e()?;
            println!(
                "{:>4}  {:<12} {:<16} {:>10}  {:<36}  LAST NOTIFICATION",
                "ID", "SOURCE", "LABEL", "VERSION", "SESSION"
            );
            for summary in summaries.iter().filter(|summary| {
                source.as_ref().is_none_or(|name| &summary.source.name == name)
                    && label.as_ref().is_none_or(|label| &summary.source.label == label)
            }) {
                let s = &summary.source;
                let last = summary
                    .last_notification
                    .map(|time| humantime::format_rfc3339_seconds(time).to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:>4}  {:<12} {:<16} {:>10}  {:<36}  {}",
                    s.id, s.name, s.label, s.version, s.session_id, last
                );
            }
        }
        Command::Rename { source, label, to } => {
            let renamed = processor.replace_label(&source, &label, &to).await.e()?;
            println!("renamed {} {label:?} to {:?}", renamed.name, renamed.label);
        }
        Command::Remove { source, label } => {
            processor.remove_source(&source, &label).await.e()?;
            println!("removed {source} {label:?}");
        }
        Command::Watch => {
            let metrics_task = config.metrics_addr().map(|addr| {
                let mut registry = Registry::default();
                registry.register(metrics);
                let registry = Arc::new(RwLock::new(registry));
                tokio::task::spawn(async move {
                    if let Err(err) =
                        iroh_metrics::service::start_metrics_server(addr, registry).await
                    {
                        warn!("metrics server failed: {err:#}");
                    }
                })
            });
            let cancel = CancellationToken::new();
            let updater = AutoUpdater::new(processor.clone(), config.updater.clone());
            let task = tokio::task::spawn(updater.run(cancel.clone()));
            tokio::signal::ctrl_c().await.e()?;
            info!("shutting down");
            cancel.cancel();
            task.await.e()?;
            if let Some(metrics_task) = metrics_task {
                metrics_task.abort();
            }
        }
    }
    Ok(())
}
