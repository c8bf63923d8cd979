//! Applies delta files to a replica, strictly in order.

use std::{path::Path, sync::Arc};

use snafu::{OptionExt, ResultExt};
use tracing::{Span, debug, info, warn};

use crate::{
    error::{
        FetchSnafu, HeaderSnafu, InvalidDeltaObjectSnafu, MalformedRecordSnafu,
        MissingFieldSnafu, MissingHeaderSnafu, RecordsSnafu, StoreSnafu, SyncError,
        UnknownDeltaActionSnafu, WorkerSnafu,
    },
    fetch::ResourceFetcher,
    jsonseq,
    metrics::Metrics,
    model::Source,
    protocol::{ChangeRecord, DeltaAction, FileRef, Notification, NrtmFileHeader},
    rpsl::RpslObject,
    store::Repository,
    validate::validate_delta_header,
};

/// Fetches and applies delta files.
#[derive(Debug, Clone)]
pub struct DeltaApplier {
    repo: Arc<dyn Repository>,
    fetcher: ResourceFetcher,
    metrics: Arc<Metrics>,
}

impl DeltaApplier {
    pub fn new(repo: Arc<dyn Repository>, fetcher: ResourceFetcher, metrics: Arc<Metrics>) -> Self {
        Self {
            repo,
            fetcher,
            metrics,
        }
    }

    /// Applies `deltas`, which must be sorted and contiguous from `source.version + 1`.
    ///
    /// Returns the source at the version of the last applied file. The first
    /// failing file stops the run.
    pub async fn apply(
        &self,
        mut source: Source,
        notification: &Notification,
        deltas: &[FileRef],
    ) -> Result<Source, SyncError> {
        for delta in deltas {
            let path = self
                .fetcher
                .fetch(&source.notification_url, &source.name, delta)
                .await
                .context(FetchSnafu)?;
            let repo = self.repo.clone();
            let metrics = self.metrics.clone();
            let notification = notification.clone();
            let delta = delta.clone();
            let span = Span::current();
            source = tokio::task::spawn_blocking(move || {
                let _guard = span.enter();
                apply_file(&*repo, &path, source, &notification, &delta, &metrics)
            })
            .await
            .context(WorkerSnafu)??;
            self.metrics.delta_files.inc();
            info!(version = source.version, "applied delta");
        }
        Ok(source)
    }
}

/// Applies one delta file.
///
/// The version bump is saved right after the header is validated, before
/// the first change record is applied.
fn apply_file(
    repo: &dyn Repository,
    path: &Path,
    source: Source,
    notification: &Notification,
    file_ref: &FileRef,
    metrics: &Metrics,
) -> Result<Source, SyncError> {
    let mut records = jsonseq::open_file(path).context(RecordsSnafu)?;
    let header_record = records
        .next()
        .context(MissingHeaderSnafu { file: "delta" })?
        .context(RecordsSnafu)?;
    let header: NrtmFileHeader = serde_json::from_slice(&header_record)
        .context(MalformedRecordSnafu { what: "delta header" })?;
    validate_delta_header(&header, &source, file_ref).context(HeaderSnafu)?;

    let bumped = Source {
        version: header.version,
        ..source
    };
    let source = repo
        .save_source(&bumped, Some(notification))
        .context(StoreSnafu)?;

    for record in records {
        let record = record.context(RecordsSnafu)?;
        let change: ChangeRecord =
            serde_json::from_slice(&record).context(MalformedRecordSnafu { what: "delta" })?;
        apply_change(repo, &source, &header, change, metrics)?;
    }
    Ok(source)
}

fn apply_change(
    repo: &dyn Repository,
    source: &Source,
    header: &NrtmFileHeader,
    change: ChangeRecord,
    metrics: &Metrics,
) -> Result<(), SyncError> {
    match change.action() {
        Some(action @ DeltaAction::AddModify) => {
            let text = change
                .object
                .as_deref()
                .context(MissingFieldSnafu {
                    action,
                    field: "object",
                })?;
            let object = RpslObject::parse(text).context(InvalidDeltaObjectSnafu)?;
            repo.add_modify_object(source, &object, header)
                .context(StoreSnafu)?;
            metrics.delta_add_modify.inc();
            debug!(object_type = %object.object_type, key = %object.primary_key, "add_modify");
        }
        Some(action @ DeltaAction::Delete) => {
            let object_type = change.object_class.as_deref().context(MissingFieldSnafu {
                action,
                field: "object_class",
            })?;
            let primary_key = change.primary_key.as_deref().context(MissingFieldSnafu {
                action,
                field: "primary_key",
            })?;
            let deleted = repo
                .delete_object(source, object_type, primary_key, header)
                .context(StoreSnafu)?;
            metrics.delta_delete.inc();
            if deleted {
                debug!(object_type, key = primary_key, "delete");
            } else {
                metrics.delta_delete_missing.inc();
                warn!(object_type, key = primary_key, "delete of an object that is not in the replica");
            }
        }
        None => {
            return UnknownDeltaActionSnafu {
                action: change.action,
            }
            .fail();
        }
    }
    Ok(())
}
