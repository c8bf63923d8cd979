//! Durable state of the mirror.
//!
//! The sync engine only talks to the [`Repository`] trait. Every call is atomic
//! on its own; the engine never spans a transaction over several calls.

use std::fmt::Debug;

use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};

pub use self::replica::ReplicaStore;
use crate::{
    model::{NotificationRecord, ObjectRow, Source, SourceId},
    protocol::{Notification, NrtmFileHeader},
    rpsl::RpslObject,
};

mod replica;

#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("database error"))]
    Database { source: redb::Error },
    #[snafu(display("failed to create database directory"))]
    CreateDir { source: std::io::Error },
    #[snafu(display("failed to encode notification"))]
    EncodeNotification { source: serde_json::Error },
    #[snafu(display("stored notification url of source {id} is invalid"))]
    InvalidStoredUrl { id: SourceId, source: url::ParseError },
    #[snafu(display("a source named {name} with label {label:?} already exists"))]
    DuplicateSource { name: String, label: String },
    #[snafu(display("source {id} not found"))]
    UnknownSource { id: SourceId },
    #[snafu(display("store is closed"))]
    Closed {},
}

/// Storage operations required by the sync engine.
pub trait Repository: Debug + Send + Sync + 'static {
    /// Reserves an id for a source that is about to be bootstrapped.
    fn next_source_id(&self) -> Result<SourceId, StoreError>;

    fn get_sources(&self) -> Result<Vec<Source>, StoreError>;

    /// Creates or updates `source`, optionally recording the notification that
    /// caused the change.
    ///
    /// Fails if a different source already uses the same name and label.
    fn save_source(
        &self,
        source: &Source,
        notification: Option<&Notification>,
    ) -> Result<Source, StoreError>;

    /// Atomically removes `previous` with all its objects and saves `source`.
    fn replace_source(
        &self,
        previous: SourceId,
        source: &Source,
        notification: Option<&Notification>,
    ) -> Result<Source, StoreError>;

    /// Removes a source, its objects and its notification history.
    ///
    /// Also cleans up objects written under an id that never got a source row.
    /// Returns whether anything was removed.
    fn remove_source(&self, id: SourceId) -> Result<bool, StoreError>;

    /// Writes one batch of snapshot objects, valid from `header.version`.
    fn save_snapshot_objects(
        &self,
        source: &Source,
        objects: &[RpslObject],
        header: &NrtmFileHeader,
    ) -> Result<(), StoreError>;

    /// Closes the current row of the object's key, if any, and adds a new
    /// current row valid from `header.version`.
    fn add_modify_object(
        &self,
        source: &Source,
        object: &RpslObject,
        header: &NrtmFileHeader,
    ) -> Result<(), StoreError>;

    /// Closes the current row of the key at `header.version`.
    ///
    /// Returns `false` if there was no current row.
    fn delete_object(
        &self,
        source: &Source,
        object_type: &str,
        primary_key: &str,
        header: &NrtmFileHeader,
    ) -> Result<bool, StoreError>;

    /// Notifications recorded for versions in `from..=to`.
    fn get_notification_history(
        &self,
        id: SourceId,
        from: u64,
        to: u64,
    ) -> Result<Vec<NotificationRecord>, StoreError>;

    /// Rows with `to_version == 0`.
    fn get_current_objects(&self, id: SourceId) -> Result<Vec<ObjectRow>, StoreError>;

    /// All rows of one key, oldest first.
    fn get_object_history(
        &self,
        id: SourceId,
        object_type: &str,
        primary_key: &str,
    ) -> Result<Vec<ObjectRow>, StoreError>;

    fn close(&self) -> Result<(), StoreError>;
}
