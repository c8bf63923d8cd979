//! Configuration for the mirror

use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

const DEFAULT_METRICS_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9118);

/// Environment variable overriding the default data directory.
pub const DATA_DIR_ENV: &str = "NRTM4_DATA_DIR";

#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to read {}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse config"))]
    Parse { source: toml::de::Error },
    #[snafu(display("operating environment provides no directory for application data"))]
    NoDataDir {},
}

/// Mirror configuration
///
/// The config is usually loaded from a file with [`Self::load`].
///
/// The struct also implements [`Default`] which creates a config suitable for local development
/// and testing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the replica database and downloaded files are kept.
    ///
    /// Defaults to `$NRTM4_DATA_DIR`, then to the platform data directory.
    pub data_dir: Option<PathBuf>,
    /// Config for fetching notifications, snapshots and deltas.
    pub fetch: FetchConfig,
    /// Config for the snapshot bootstrap.
    pub snapshot: SnapshotConfig,
    /// Config for periodic updates.
    pub updater: UpdaterConfig,
    /// Config for the metrics server, only used by `watch`.
    ///
    /// The metrics server is started by default. To disable the metrics server, set to
    /// `Some(MetricsConfig::disabled())`.
    pub metrics: Option<MetricsConfig>,
}

/// HTTP settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Deadline for a whole request, body included.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10 * 60),
            connect_timeout: Duration::from_secs(30),
            user_agent: concat!("nrtm4-mirror/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Snapshot bootstrap tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Objects parsed concurrently.
    pub parser_workers: usize,
    /// Objects written to the store per batch.
    pub batch_size: usize,
    /// How often progress is logged.
    #[serde(with = "humantime_serde")]
    pub progress_interval: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            parser_workers: 4,
            batch_size: 500,
            progress_interval: Duration::from_secs(60),
        }
    }
}

/// What the updater does after a failed sync caused by bad remote data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Try again at the next tick.
    #[default]
    Retry,
    /// Remove the replica and bootstrap it again.
    Replace,
    /// Keep the replica under a new label and bootstrap a fresh one.
    Preserve,
}

/// Periodic update settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Sources synced at the same time.
    pub max_concurrent_syncs: usize,
    pub on_failure: FailurePolicy,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            max_concurrent_syncs: 2,
            on_failure: FailurePolicy::default(),
        }
    }
}

/// The config for the metrics server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Set to true to disable the metrics server.
    pub disabled: bool,
    /// Optionally set a custom address to bind to.
    pub bind_addr: Option<SocketAddr>,
}

impl MetricsConfig {
    /// Disable the metrics server.
    pub fn disabled() -> Self {
        Self {
            disabled: true,
            bind_addr: None,
        }
    }
}

impl Config {
    /// Load the config from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let s = tokio::fs::read_to_string(path)
            .await
            .context(ReadSnafu { path })?;
        let config: Config = toml::from_str(&s).context(ParseSnafu)?;
        Ok(config)
    }

    /// Get the data directory.
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let dir = if let Some(val) = env::var_os(DATA_DIR_ENV) {
            PathBuf::from(val)
        } else {
            let path = dirs_next::data_dir().context(NoDataDirSnafu)?;
            path.join("nrtm4-mirror")
        };
        Ok(dir)
    }

    /// Get the path to the replica database file.
    pub fn store_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_dir()?.join("replica-1.db"))
    }

    /// Get the directory downloaded files are kept in.
    pub fn files_dir(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_dir()?.join("files"))
    }

    /// Get the address where the metrics server should be bound, if set.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        match &self.metrics {
            None => Some(DEFAULT_METRICS_ADDR),
            Some(conf) => match conf.disabled {
                true => None,
                false => Some(conf.bind_addr.unwrap_or(DEFAULT_METRICS_ADDR)),
            },
        }
    }
}
