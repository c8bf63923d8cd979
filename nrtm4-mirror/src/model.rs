//! The entities persisted for a mirrored source.

use std::time::SystemTime;

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use url::Url;

/// Store assigned identifier of a [`Source`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From, Into, Serialize, Deserialize,
)]
pub struct SourceId(pub u64);

/// One mirrored remote source.
///
/// (`name`, `label`) is unique within a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub id: SourceId,
    /// Source name as published by the remote, e.g. `RIPE`.
    pub name: String,
    pub session_id: String,
    /// Last version applied to the replica.
    pub version: u64,
    pub notification_url: Url,
    /// Distinguishes several mirrors of the same remote source.
    pub label: String,
    pub created: SystemTime,
}

/// A stored version of a replicated object.
///
/// The row was the effective value of its key for versions
/// `[from_version, to_version)`; `to_version == 0` marks the current row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRow {
    pub object_type: String,
    pub primary_key: String,
    pub payload: String,
    pub from_version: u64,
    pub to_version: u64,
}

impl ObjectRow {
    pub fn is_current(&self) -> bool {
        self.to_version == 0
    }
}

/// A notification recorded when it caused a change to a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRecord {
    pub source_id: SourceId,
    pub version: u64,
    pub created: SystemTime,
    /// The notification as JSON.
    pub payload: String,
}
