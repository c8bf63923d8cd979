//! Periodic updates of every stored source.

use std::{collections::HashSet, sync::Arc};

use parking_lot::Mutex;
use tokio::{task::JoinSet, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    config::{FailurePolicy, UpdaterConfig},
    error::SyncError,
    model::{Source, SourceId},
    pool::WorkerPool,
    sync::{Processor, SyncOutcome},
};

/// Syncs all sources on an interval.
///
/// At most `max_concurrent_syncs` sources are synced at once, and a source
/// whose previous update is still running is skipped.
#[derive(Debug, Clone)]
pub struct AutoUpdater {
    processor: Processor,
    config: UpdaterConfig,
    pool: WorkerPool,
    in_flight: Arc<Mutex<HashSet<SourceId>>>,
}

impl AutoUpdater {
    pub fn new(processor: Processor, config: UpdaterConfig) -> Self {
        let pool = WorkerPool::new(config.max_concurrent_syncs);
        Self {
            processor,
            config,
            pool,
            in_flight: Default::default(),
        }
    }

    /// Runs until `cancel` fires. The first round starts immediately.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tasks = JoinSet::new();
        info!(
            interval = ?self.config.interval,
            max_concurrent = self.pool.size(),
            "auto updater started"
        );
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = res {
                        warn!("update task failed: {err:#}");
                    }
                }
                _ = ticker.tick() => self.spawn_round(&mut tasks).await,
            }
        }
        self.pool.close();
        tasks.shutdown().await;
        info!("auto updater stopped");
    }

    async fn spawn_round(&self, tasks: &mut JoinSet<()>) {
        let sources = match self.processor.list_sources().await {
            Ok(sources) => sources,
            Err(err) => {
                warn!("failed to list sources: {err:#}");
                return;
            }
        };
        for summary in sources {
            let source = summary.source;
            let Some(claim) = InFlight::claim(&self.in_flight, source.id) else {
                debug!(source = %source.name, label = source.label, "update still running, skipping");
                self.processor.metrics().updater_skipped.inc();
                continue;
            };
            let this = self.clone();
            let span = info_span!("auto_update", source = %source.name, label = source.label);
            tasks.spawn(
                async move {
                    let _claim = claim;
                    let Ok(_token) = this.pool.acquire().await else {
                        return;
                    };
                    this.update_source(&source).await.ok();
                }
                .instrument(span),
            );
        }
    }

    /// Updates one source, applying the failure policy if the remote data is bad.
    ///
    /// Returns the result of the update itself.
    pub async fn update_source(&self, source: &Source) -> Result<SyncOutcome, SyncError> {
        let res = self.processor.update(&source.name, &source.label).await;
        if res.as_ref().is_err_and(SyncError::is_remote_data_error) {
            self.recover(source).await;
        }
        res
    }

    async fn recover(&self, source: &Source) {
        let policy = self.config.on_failure;
        let res = match policy {
            FailurePolicy::Retry => return,
            FailurePolicy::Replace => self.processor.rebuild(&source.name, &source.label).await,
            FailurePolicy::Preserve => self.preserve(source).await,
        };
        match res {
            Ok(fresh) => {
                self.processor.metrics().updater_recoveries.inc();
                info!(id = %fresh.id, version = fresh.version, ?policy, "replica bootstrapped again");
            }
            Err(err) => error!(?policy, "failed to recover source: {err:#}"),
        }
    }

    /// Moves the failed replica out of the way under `<label>-auto-<n>` and
    /// bootstraps a new one under the original label.
    ///
    /// If the bootstrap fails the failed replica gets its label back.
    async fn preserve(&self, source: &Source) -> Result<Source, SyncError> {
        let prefix = match source.label.as_str() {
            "" => "auto-".to_string(),
            label => format!("{label}-auto-"),
        };
        let last = self
            .processor
            .list_sources()
            .await?
            .into_iter()
            .filter(|summary| summary.source.name == source.name)
            .filter_map(|summary| summary.source.label.strip_prefix(&prefix)?.parse::<u32>().ok())
            .max()
            .unwrap_or(0);
        let label = format!("{prefix}{}", last + 1);
        self.processor
            .replace_label(&source.name, &source.label, &label)
            .await?;
        match self
            .processor
            .connect(&source.notification_url, &source.label)
            .await
        {
            Ok(fresh) => {
                info!(preserved_as = label, "kept failed replica");
                Ok(fresh)
            }
            Err(err) => {
                if let Err(restore) = self
                    .processor
                    .replace_label(&source.name, &label, &source.label)
                    .await
                {
                    warn!(preserved_as = label, "failed to restore label: {restore:#}");
                }
                Err(err)
            }
        }
    }
}

/// Marks a source as being updated until dropped.
#[derive(Debug)]
struct InFlight {
    set: Arc<Mutex<HashSet<SourceId>>>,
    id: SourceId,
}

impl InFlight {
    fn claim(set: &Arc<Mutex<HashSet<SourceId>>>, id: SourceId) -> Option<Self> {
        set.lock().insert(id).then(|| Self {
            set: set.clone(),
            id,
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}
