//! Metrics support for the mirror

use iroh_metrics::{Counter, MetricsGroup};

/// Metrics for nrtm4-mirror
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "nrtm4")]
pub struct Metrics {
    /// Number of sync attempts started
    pub sync_attempts: Counter,
    /// Number of sync attempts that left the replica up to date
    pub sync_success: Counter,
    /// Number of sync attempts that failed
    pub sync_failures: Counter,
    /// Number of sync attempts that found the replica already up to date
    pub sync_noop: Counter,

    /// Number of snapshot bootstraps completed
    pub bootstraps: Counter,
    /// Snapshot objects parsed and stored
    pub snapshot_objects: Counter,
    /// Snapshot objects dropped because they could not be parsed
    pub snapshot_parse_failures: Counter,
    /// Batches of snapshot objects written to the store
    pub snapshot_batches: Counter,

    /// Delta files applied
    pub delta_files: Counter,
    /// `add_modify` records applied
    pub delta_add_modify: Counter,
    /// `delete` records applied
    pub delta_delete: Counter,
    /// `delete` records for keys without a current object
    pub delta_delete_missing: Counter,

    /// Files downloaded
    pub fetch_downloads: Counter,
    /// Files reused from an earlier download
    pub fetch_reused: Counter,
    /// Files rejected because their hash did not match
    pub fetch_hash_mismatch: Counter,
    /// Total bytes downloaded
    #[metrics(help = "Number of bytes downloaded.")]
    pub fetch_bytes: Counter,

    /// Replicas bootstrapped again by the updater after bad remote data
    pub updater_recoveries: Counter,
    /// Scheduled updates skipped because the previous one was still running
    pub updater_skipped: Counter,
}
