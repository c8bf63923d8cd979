//! The per source sync state machine and the operator commands built on it.

use std::{
    path::PathBuf,
    sync::{Arc, LazyLock},
    time::SystemTime,
};

use regex::Regex;
use snafu::{OptionExt, ResultExt, ensure};
use strum::Display;
use tracing::{Instrument, debug, info, info_span, warn};
use url::Url;

use crate::{
    client::Client,
    clock::{Clock, SystemClock},
    config::SnapshotConfig,
    delta::DeltaApplier,
    error::{
        DeltaSequenceSnafu, FetchNotificationSnafu, FetchSnafu, InvalidLabelSnafu,
        InvalidNotificationSnafu, SourceExistsSnafu, SourceNotFoundSnafu, SourceRenamedSnafu,
        StoreSnafu, SyncError, WorkerSnafu,
    },
    fetch::ResourceFetcher,
    metrics::Metrics,
    model::{Source, SourceId},
    protocol::Notification,
    snapshot::{LogProgress, ProgressObserver, SnapshotLoader},
    store::{Repository, StoreError},
    validate::{select_deltas, validate_notification},
};

static LABEL_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]*[A-Za-z0-9][A-Za-z0-9._-]*$").ok());

/// Whether `label` may be used for a source. The empty label is valid.
pub fn is_valid_label(label: &str) -> bool {
    label.is_empty() || LABEL_RE.as_ref().is_some_and(|re| re.is_match(label))
}

/// Where a replica stands relative to a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SyncState {
    /// No replica exists for the source and label.
    NoLocalState,
    /// The remote started a new session, the replica must be rebuilt.
    StaleNeedsBootstrap,
    UpToDate,
    StaleNeedsDelta,
}

/// Decides what a sync has to do.
pub fn plan(local: Option<&Source>, notification: &Notification) -> SyncState {
    let Some(local) = local else {
        return SyncState::NoLocalState;
    };
    if local.session_id != notification.header.session_id {
        SyncState::StaleNeedsBootstrap
    } else if local.version >= notification.header.version {
        SyncState::UpToDate
    } else {
        SyncState::StaleNeedsDelta
    }
}

/// Result of a successful sync.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    /// The state the replica was found in.
    pub state: SyncState,
    /// The replica after the sync.
    pub source: Source,
    /// Version before the sync, if a replica of the same session existed.
    pub previous_version: Option<u64>,
}

/// A stored source with its most recent audit record.
#[derive(Debug, Clone)]
pub struct SourceSummary {
    pub source: Source,
    /// When the notification that produced the current version was recorded.
    pub last_notification: Option<SystemTime>,
}

/// What a sync expects to find locally.
#[derive(Debug, Clone, Copy)]
enum Expect<'a> {
    Anything,
    Absent,
    Source(&'a str),
    /// Bootstrap the named source again, whatever its state.
    Rebuild(&'a str),
}

/// Runs syncs and operator commands against one [`Repository`].
#[derive(Debug, Clone)]
pub struct Processor {
    repo: Arc<dyn Repository>,
    client: Arc<dyn Client>,
    clock: Arc<dyn Clock>,
    files_dir: PathBuf,
    snapshot: SnapshotConfig,
    observer: Arc<dyn ProgressObserver>,
    metrics: Arc<Metrics>,
}

impl Processor {
    pub fn new(
        repo: Arc<dyn Repository>,
        client: Arc<dyn Client>,
        files_dir: PathBuf,
        snapshot: SnapshotConfig,
    ) -> Self {
        Self {
            repo,
            client,
            clock: Arc::new(SystemClock),
            files_dir,
            snapshot,
            observer: Arc::new(LogProgress),
            metrics: Default::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_progress_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Brings the replica of the source behind `notification_url` with `label`
    /// up to date, creating it if needed.
    pub async fn sync(&self, notification_url: &Url, label: &str) -> Result<SyncOutcome, SyncError> {
        self.attempt(notification_url, label, Expect::Anything).await
    }

    /// Bootstraps a new replica. Fails if one already exists for the label.
    pub async fn connect(&self, notification_url: &Url, label: &str) -> Result<Source, SyncError> {
        let outcome = self
            .attempt(notification_url, label, Expect::Absent)
            .await?;
        Ok(outcome.source)
    }

    /// Syncs a known replica.
    pub async fn update(&self, name: &str, label: &str) -> Result<SyncOutcome, SyncError> {
        let source = self.find_source(name, label).await?.context(SourceNotFoundSnafu {
            name,
            label,
        })?;
        self.attempt(&source.notification_url, label, Expect::Source(&source.name))
            .await
    }

    /// Bootstraps a known replica again from the current snapshot.
    ///
    /// The new replica replaces the old one in a single transaction, so the
    /// old replica stays in place if the bootstrap fails.
    pub async fn rebuild(&self, name: &str, label: &str) -> Result<Source, SyncError> {
        let source = self.find_source(name, label).await?.context(SourceNotFoundSnafu {
            name,
            label,
        })?;
        let outcome = self
            .attempt(&source.notification_url, label, Expect::Rebuild(&source.name))
            .await?;
        Ok(outcome.source)
    }

    pub async fn list_sources(&self) -> Result<Vec<SourceSummary>, SyncError> {
        self.blocking(|repo| {
            let mut summaries = Vec::new();
            for source in repo.get_sources()? {
                let last_notification = repo
                    .get_notification_history(source.id, source.version, source.version)?
                    .pop()
                    .map(|record| record.created);
                summaries.push(SourceSummary {
                    source,
                    last_notification,
                });
            }
            Ok(summaries)
        })
        .await
    }

    /// Gives a replica a new label.
    pub async fn replace_label(
        &self,
        name: &str,
        label: &str,
        new_label: &str,
    ) -> Result<Source, SyncError> {
        ensure!(is_valid_label(new_label), InvalidLabelSnafu { label: new_label });
        let source = self.find_source(name, label).await?.context(SourceNotFoundSnafu {
            name,
            label,
        })?;
        if label == new_label {
            return Ok(source);
        }
        ensure!(
            self.find_source(name, new_label).await?.is_none(),
            SourceExistsSnafu {
                name,
                label: new_label,
            }
        );
        let renamed = Source {
            label: new_label.to_string(),
            ..source
        };
        let saved = self
            .blocking(move |repo| repo.save_source(&renamed, None))
            .await?;
        info!(source = %saved.name, from = label, to = new_label, "label replaced");
        Ok(saved)
    }

    /// Removes a replica with all its objects and history.
    pub async fn remove_source(&self, name: &str, label: &str) -> Result<(), SyncError> {
        let source = self.find_source(name, label).await?.context(SourceNotFoundSnafu {
            name,
            label,
        })?;
        let id = source.id;
        self.blocking(move |repo| repo.remove_source(id)).await?;
        info!(source = name, label, %id, "source removed");
        Ok(())
    }

    async fn attempt(
        &self,
        notification_url: &Url,
        label: &str,
        expect: Expect<'_>,
    ) -> Result<SyncOutcome, SyncError> {
        ensure!(is_valid_label(label), InvalidLabelSnafu { label });
        let span = info_span!("sync", url = %notification_url, label);
        async {
            self.metrics.sync_attempts.inc();
            let res = self.run(notification_url, label, expect).await;
            match &res {
                Ok(outcome) => {
                    self.metrics.sync_success.inc();
                    if outcome.state == SyncState::UpToDate {
                        self.metrics.sync_noop.inc();
                    }
                    info!(
                        state = %outcome.state,
                        source = %outcome.source.name,
                        version = outcome.source.version,
                        "sync finished"
                    );
                }
                Err(err) => {
                    self.metrics.sync_failures.inc();
                    warn!(kind = %err.kind(), "sync failed: {err:#}");
                }
            }
            res
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        notification_url: &Url,
        label: &str,
        expect: Expect<'_>,
    ) -> Result<SyncOutcome, SyncError> {
        let notification = self
            .client
            .fetch_notification(notification_url)
            .await
            .context(FetchNotificationSnafu)?;
        let failures = validate_notification(&notification);
        if !failures.is_empty() {
            return InvalidNotificationSnafu { failures }.fail();
        }
        let name = notification.header.source.as_str();
        if let Expect::Source(expected) | Expect::Rebuild(expected) = expect {
            ensure!(
                expected == name,
                SourceRenamedSnafu {
                    expected,
                    found: name,
                }
            );
        }

        let local = self.find_source(name, label).await?;
        if matches!(expect, Expect::Absent) {
            ensure!(local.is_none(), SourceExistsSnafu { name, label });
        }
        let state = plan(local.as_ref(), &notification);
        debug!(
            %state,
            local_version = local.as_ref().map(|s| s.version),
            remote_version = notification.header.version,
            "planned sync"
        );

        let rebuild = matches!(expect, Expect::Rebuild(_));
        let (source, previous_version) = match (state, local) {
            (SyncState::UpToDate, Some(source)) if !rebuild => {
                let version = source.version;
                (source, Some(version))
            }
            (SyncState::StaleNeedsDelta, Some(source)) if !rebuild => {
                let version = source.version;
                let deltas = select_deltas(&notification, version).context(DeltaSequenceSnafu)?;
                let source = self
                    .delta_applier()
                    .apply(source, &notification, &deltas)
                    .await?;
                (source, Some(version))
            }
            (_, local) => {
                let previous = local.map(|source| source.id);
                let source = self
                    .bootstrap(notification_url, label, &notification, previous)
                    .await?;
                (source, None)
            }
        };
        Ok(SyncOutcome {
            state,
            source,
            previous_version,
        })
    }

    async fn bootstrap(
        &self,
        notification_url: &Url,
        label: &str,
        notification: &Notification,
        previous: Option<SourceId>,
    ) -> Result<Source, SyncError> {
        let path = self
            .fetcher()
            .fetch(
                notification_url,
                &notification.header.source,
                &notification.snapshot,
            )
            .await
            .context(FetchSnafu)?;
        let id = self.blocking(|repo| repo.next_source_id()).await?;
        let source = Source {
            id,
            name: notification.header.source.clone(),
            session_id: notification.header.session_id.clone(),
            version: 0,
            notification_url: notification_url.clone(),
            label: label.to_string(),
            created: self.clock.now(),
        };
        self.loader()
            .load(path, notification, source, previous)
            .await
    }

    async fn find_source(&self, name: &str, label: &str) -> Result<Option<Source>, SyncError> {
        let sources = self.blocking(|repo| repo.get_sources()).await?;
        Ok(sources
            .into_iter()
            .find(|source| source.name == name && source.label == label))
    }

    /// Runs a store call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Repository) -> Result<T, StoreError> + Send + 'static,
    {
        let repo = self.repo.clone();
        tokio::task::spawn_blocking(move || f(&*repo))
            .await
            .context(WorkerSnafu)?
            .context(StoreSnafu)
    }

    fn fetcher(&self) -> ResourceFetcher {
        ResourceFetcher::new(
            self.client.clone(),
            self.files_dir.clone(),
            self.metrics.clone(),
        )
    }

    fn loader(&self) -> SnapshotLoader {
        SnapshotLoader::new(
            self.repo.clone(),
            self.snapshot.clone(),
            self.metrics.clone(),
            self.observer.clone(),
        )
    }

    fn delta_applier(&self) -> DeltaApplier {
        DeltaApplier::new(self.repo.clone(), self.fetcher(), self.metrics.clone())
    }
}
