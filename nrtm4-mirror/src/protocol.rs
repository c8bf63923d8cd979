//! NRTM version 4 wire types.
//!
//! Field names and the action vocabulary are fixed by the protocol and are
//! reproduced verbatim in the serde attributes below.

use data_encoding::BASE64URL_NOPAD;
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu};
use strum::{Display, EnumString};

/// The only protocol version this client understands.
pub const NRTM_VERSION: u32 = 4;

/// Fields shared by the notification and the first record of every snapshot
/// and delta file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NrtmFileHeader {
    pub nrtm_version: u32,
    /// `notification`, `snapshot` or `delta`. Carried, not enforced.
    #[serde(rename = "type", default)]
    pub file_type: String,
    pub source: String,
    pub session_id: String,
    pub version: u64,
}

/// Points at a snapshot or delta file published next to the notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub version: u64,
    /// Absolute, or relative to the notification URL.
    pub url: String,
    /// Lowercase hex SHA-256 of the file as served.
    pub hash: String,
}

/// The update notification file, fetched fresh on every sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(flatten)]
    pub header: NrtmFileHeader,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_signing_key: Option<String>,
    pub snapshot: FileRef,
    #[serde(default)]
    pub deltas: Vec<FileRef>,
}

#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum NotificationDecodeError {
    #[snafu(display("notification is not valid JSON"))]
    Json { source: serde_json::Error },
    #[snafu(display("notification is neither JSON nor a compact JWS"))]
    MalformedJws {},
    #[snafu(display("JWS payload is not valid base64url"))]
    JwsPayload { source: data_encoding::DecodeError },
}

impl Notification {
    /// Decodes a notification served as plain JSON or as a JWS in compact
    /// serialization.
    ///
    /// The JWS signature is not verified.
    pub fn decode(body: &[u8]) -> Result<Self, NotificationDecodeError> {
        let body = body.trim_ascii();
        if body.first() == Some(&b'{') {
            return serde_json::from_slice(body).context(JsonSnafu);
        }
        let mut parts = body.split(|b| *b == b'.');
        let (Some(_header), Some(payload), Some(_signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return MalformedJwsSnafu.fail();
        };
        let unpadded = payload.iter().rposition(|b| *b != b'=').map_or(0, |i| i + 1);
        let payload = BASE64URL_NOPAD
            .decode(&payload[..unpadded])
            .context(JwsPayloadSnafu)?;
        serde_json::from_slice(&payload).context(JsonSnafu)
    }
}

/// A record of a snapshot file following its header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotObject {
    pub object: String,
}

/// A record of a delta file following its header.
///
/// `object` is set for `add_modify`, `object_class` and `primary_key` for
/// `delete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
}

/// The operations a delta file may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum DeltaAction {
    AddModify,
    Delete,
}

impl ChangeRecord {
    /// Parses the action string, `None` for anything outside the protocol vocabulary.
    pub fn action(&self) -> Option<DeltaAction> {
        self.action.parse().ok()
    }
}
