//! Bootstraps a replica from a snapshot file.
//!
//! Records are parsed by a bounded set of workers into a shared buffer. Full
//! batches are written as they become available; the source row is only
//! written once the whole file has been consumed, so an interrupted bootstrap
//! never shows up as a source.

use std::{
    fmt::Debug,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use snafu::{OptionExt, ResultExt};
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    config::SnapshotConfig,
    error::{
        HeaderSnafu, MalformedRecordSnafu, MissingHeaderSnafu, PoolSnafu, RecordsSnafu,
        StoreSnafu, SyncError, WorkerSnafu,
    },
    jsonseq::{self, RecordError},
    metrics::Metrics,
    model::{Source, SourceId},
    pool::{LockingList, WorkerPool},
    protocol::{Notification, NrtmFileHeader, SnapshotObject},
    rpsl::RpslObject,
    store::Repository,
    validate::validate_snapshot_header,
};

/// Records buffered between the file reader and the workers.
const RECORD_CHANNEL_CAPACITY: usize = 1024;

/// Counts of a running bootstrap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotProgress {
    pub parsed: u64,
    pub failed: u64,
    pub stored: u64,
}

/// Receives periodic progress of running bootstraps.
pub trait ProgressObserver: Debug + Send + Sync + 'static {
    fn snapshot_progress(&self, source: &str, progress: SnapshotProgress);
}

/// Logs progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressObserver for LogProgress {
    fn snapshot_progress(&self, source: &str, progress: SnapshotProgress) {
        info!(
            source,
            parsed = progress.parsed,
            failed = progress.failed,
            stored = progress.stored,
            "snapshot progress"
        );
    }
}

#[derive(Debug, Default)]
struct Counters {
    buffer: LockingList<RpslObject>,
    parsed: AtomicU64,
    failed: AtomicU64,
    stored: AtomicU64,
}

impl Counters {
    fn progress(&self) -> SnapshotProgress {
        SnapshotProgress {
            parsed: self.parsed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
        }
    }

    /// Parses one object record into the buffer. Failures are counted, not fatal.
    fn parse(&self, record: &[u8], metrics: &Metrics) {
        let parsed = serde_json::from_slice::<SnapshotObject>(record)
            .map_err(|err| err.to_string())
            .and_then(|obj| RpslObject::parse(&obj.object).map_err(|err| err.to_string()));
        match parsed {
            Ok(object) => {
                self.buffer.add(object);
                self.parsed.fetch_add(1, Ordering::Relaxed);
                metrics.snapshot_objects.inc();
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                metrics.snapshot_parse_failures.inc();
                debug!(%err, "dropping snapshot object");
            }
        }
    }
}

/// Loads snapshot files into a [`Repository`].
#[derive(Debug, Clone)]
pub struct SnapshotLoader {
    repo: Arc<dyn Repository>,
    config: SnapshotConfig,
    metrics: Arc<Metrics>,
    observer: Arc<dyn ProgressObserver>,
}

impl SnapshotLoader {
    pub fn new(
        repo: Arc<dyn Repository>,
        config: SnapshotConfig,
        metrics: Arc<Metrics>,
        observer: Arc<dyn ProgressObserver>,
    ) -> Self {
        Self {
            repo,
            config,
            metrics,
            observer,
        }
    }

    /// Loads the snapshot at `path` under `source.id`, which must be unused.
    ///
    /// On success the source is saved at the snapshot version, replacing
    /// `previous` in the same transaction. On failure everything written under
    /// `source.id` is removed again.
    pub async fn load(
        &self,
        path: PathBuf,
        notification: &Notification,
        source: Source,
        previous: Option<SourceId>,
    ) -> Result<Source, SyncError> {
        let id = source.id;
        match self.ingest(path, notification, source, previous).await {
            Ok(source) => {
                self.metrics.bootstraps.inc();
                Ok(source)
            }
            Err(err) => {
                warn!(%id, "bootstrap failed: {err:#}");
                let repo = self.repo.clone();
                match tokio::task::spawn_blocking(move || repo.remove_source(id)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(cleanup)) => warn!(%id, "failed to remove partial snapshot: {cleanup:#}"),
                    Err(cleanup) => warn!(%id, "failed to remove partial snapshot: {cleanup:#}"),
                }
                Err(err)
            }
        }
    }

    async fn ingest(
        &self,
        path: PathBuf,
        notification: &Notification,
        source: Source,
        previous: Option<SourceId>,
    ) -> Result<Source, SyncError> {
        let mut records = spawn_reader(path);
        let header_record = records
            .recv()
            .await
            .context(MissingHeaderSnafu { file: "snapshot" })?
            .context(RecordsSnafu)?;
        let header: NrtmFileHeader = serde_json::from_slice(&header_record)
            .context(MalformedRecordSnafu { what: "snapshot header" })?;
        validate_snapshot_header(&header, notification, &notification.snapshot)
            .context(HeaderSnafu)?;
        info!(version = header.version, "loading snapshot");

        let counters = Arc::new(Counters::default());
        let cancel = CancellationToken::new();
        let _cancel_guard = cancel.clone().drop_guard();
        tokio::spawn(report_progress(
            header.source.clone(),
            counters.clone(),
            self.observer.clone(),
            self.config.progress_interval,
            cancel,
        ));

        let batch_size = self.config.batch_size.max(1);
        let pool = WorkerPool::new(self.config.parser_workers);
        let mut tasks = JoinSet::new();
        while let Some(record) = records.recv().await {
            let record = record.context(RecordsSnafu)?;
            let token = pool.acquire().await.context(PoolSnafu)?;
            let task_counters = counters.clone();
            let metrics = self.metrics.clone();
            tasks.spawn(async move {
                let _token = token;
                task_counters.parse(&record, &metrics);
            });
            while let Some(res) = tasks.try_join_next() {
                res.context(WorkerSnafu)?;
            }
            let batch = counters.buffer.get_batch(batch_size);
            if !batch.is_empty() {
                self.store_batch(&source, batch, &header, &counters).await?;
            }
        }
        while let Some(res) = tasks.join_next().await {
            res.context(WorkerSnafu)?;
        }
        pool.close();

        let rest = counters.buffer.get_all();
        for batch in rest.chunks(batch_size) {
            self.store_batch(&source, batch.to_vec(), &header, &counters)
                .await?;
        }
        let progress = counters.progress();
        self.observer.snapshot_progress(&header.source, progress);

        let bootstrapped = Source {
            session_id: header.session_id.clone(),
            version: header.version,
            ..source
        };
        let repo = self.repo.clone();
        let notification = notification.clone();
        let saved = tokio::task::spawn_blocking(move || match previous {
            Some(previous) => repo.replace_source(previous, &bootstrapped, Some(&notification)),
            None => repo.save_source(&bootstrapped, Some(&notification)),
        })
        .await
        .context(WorkerSnafu)?
        .context(StoreSnafu)?;
        info!(
            id = %saved.id,
            version = saved.version,
            objects = progress.stored,
            failed = progress.failed,
            "snapshot loaded"
        );
        Ok(saved)
    }

    async fn store_batch(
        &self,
        source: &Source,
        batch: Vec<RpslObject>,
        header: &NrtmFileHeader,
        counters: &Counters,
    ) -> Result<(), SyncError> {
        let len = batch.len() as u64;
        let repo = self.repo.clone();
        let source = source.clone();
        let header = header.clone();
        tokio::task::spawn_blocking(move || repo.save_snapshot_objects(&source, &batch, &header))
            .await
            .context(WorkerSnafu)?
            .context(StoreSnafu)?;
        counters.stored.fetch_add(len, Ordering::Relaxed);
        self.metrics.snapshot_batches.inc();
        trace!(len, "stored snapshot batch");
        Ok(())
    }
}

/// Reads the file's records on a blocking thread.
///
/// The reader stops early once the receiver is dropped.
fn spawn_reader(path: PathBuf) -> mpsc::Receiver<Result<Vec<u8>, RecordError>> {
    let (tx, rx) = mpsc::channel(RECORD_CHANNEL_CAPACITY);
    tokio::task::spawn_blocking(move || {
        let records = match jsonseq::open_file(&path) {
            Ok(records) => records,
            Err(err) => {
                tx.blocking_send(Err(err)).ok();
                return;
            }
        };
        for record in records {
            if tx.blocking_send(record).is_err() {
                debug!(path = %path.display(), "record receiver dropped");
                break;
            }
        }
    });
    rx
}

async fn report_progress(
    source: String,
    counters: Arc<Counters>,
    observer: Arc<dyn ProgressObserver>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => observer.snapshot_progress(&source, counters.progress()),
        }
    }
}
