//! Consistency checks on notifications and file headers.

use derive_more::Display;
use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu, ensure};

use crate::{
    model::Source,
    protocol::{FileRef, NRTM_VERSION, Notification, NrtmFileHeader},
};

/// Shortest accepted session id, the length of a hyphenated UUID.
pub const MIN_SESSION_ID_LEN: usize = 36;
pub const MIN_SOURCE_NAME_LEN: usize = 3;
/// Shortest accepted snapshot url, relative urls included.
pub const MIN_URL_LEN: usize = 10;

/// A problem with a notification. All problems of a notification are reported
/// together.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum ValidationFailure {
    #[display("notification nrtm_version is not 4: {_0}")]
    VersionMismatch(u32),
    #[display("notification session id is not valid: {_0:?}")]
    InvalidSession(String),
    #[display("notification source name is not valid: {_0:?}")]
    InvalidSource(String),
    #[display("notification version must be positive: {_0}")]
    InvalidVersion(u64),
    #[display("notification snapshot url is not valid: {_0:?}")]
    InvalidSnapshotRef(String),
}

/// Checks a freshly fetched notification.
pub fn validate_notification(notification: &Notification) -> Vec<ValidationFailure> {
    let header = &notification.header;
    let mut failures = Vec::new();
    if header.nrtm_version != NRTM_VERSION {
        failures.push(ValidationFailure::VersionMismatch(header.nrtm_version));
    }
    if !is_valid_session_id(&header.session_id) {
        failures.push(ValidationFailure::InvalidSession(header.session_id.clone()));
    }
    if header.source.trim().len() < MIN_SOURCE_NAME_LEN {
        failures.push(ValidationFailure::InvalidSource(header.source.clone()));
    }
    if header.version < 1 {
        failures.push(ValidationFailure::InvalidVersion(header.version));
    }
    let url = &notification.snapshot.url;
    if url.len() < MIN_URL_LEN || url.chars().any(char::is_whitespace) {
        failures.push(ValidationFailure::InvalidSnapshotRef(url.clone()));
    }
    failures
}

fn is_valid_session_id(session_id: &str) -> bool {
    session_id.len() >= MIN_SESSION_ID_LEN
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
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
pub enum DeltaSequenceError {
    #[snafu(display("notification lists delta version {version} more than once"))]
    DuplicateDeltaVersion { version: u64 },
    #[snafu(display("no deltas lead from version {local} to {target}"))]
    NoDeltas { local: u64, target: u64 },
    #[snafu(display("next delta for version {local} is not available, first is {first}"))]
    NextDeltaUnavailable { local: u64, first: u64 },
    #[snafu(display("delta sequence broken: expected version {expected}, found {found}"))]
    DeltaSequenceBroken { expected: u64, found: u64 },
    #[snafu(display("last delta is version {last}, notification is at {target}"))]
    LastDeltaMismatch { last: u64, target: u64 },
}

/// Picks the deltas that take a replica at `local_version` to the notification
/// version, in application order.
pub fn select_deltas(
    notification: &Notification,
    local_version: u64,
) -> Result<Vec<FileRef>, DeltaSequenceError> {
    let mut deltas = notification.deltas.clone();
    deltas.sort_by_key(|d| d.version);
    if let Some(pair) = deltas.windows(2).find(|w| w[0].version == w[1].version) {
        return DuplicateDeltaVersionSnafu {
            version: pair[0].version,
        }
        .fail();
    }
    let target = notification.header.version;
    deltas.retain(|d| d.version > local_version && d.version <= target);
    let versions: Vec<u64> = deltas.iter().map(|d| d.version).collect();
    check_contiguous(&versions, local_version, target)?;
    Ok(deltas)
}

/// Accepts exactly the runs `local + 1, local + 2, ..., target`.
pub fn check_contiguous(
    versions: &[u64],
    local_version: u64,
    target: u64,
) -> Result<(), DeltaSequenceError> {
    let (Some(&first), Some(&last)) = (versions.first(), versions.last()) else {
        return NoDeltasSnafu {
            local: local_version,
            target,
        }
        .fail();
    };
    ensure!(
        first == local_version + 1,
        NextDeltaUnavailableSnafu {
            local: local_version,
            first,
        }
    );
    for pair in versions.windows(2) {
        ensure!(
            pair[1] != pair[0],
            DuplicateDeltaVersionSnafu { version: pair[0] }
        );
        ensure!(
            pair[1] == pair[0] + 1,
            DeltaSequenceBrokenSnafu {
                expected: pair[0] + 1,
                found: pair[1],
            }
        );
    }
    ensure!(last == target, LastDeltaMismatchSnafu { last, target });
    Ok(())
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
pub enum HeaderError {
    #[snafu(display("file nrtm_version is not 4: {version}"))]
    NrtmVersion { version: u32 },
    #[snafu(display("file session id {found} does not match {expected}"))]
    SessionMismatch { expected: String, found: String },
    #[snafu(display("file source {found} does not match {expected}"))]
    SourceMismatch { expected: String, found: String },
    #[snafu(display("file version {found} does not match its reference version {expected}"))]
    FileVersionMismatch { expected: u64, found: u64 },
    #[snafu(display("file version {found} is behind the replica at version {current}"))]
    FileVersionInconsistency { current: u64, found: u64 },
}

/// Checks the header of a snapshot file against the notification pointing to it.
pub fn validate_snapshot_header(
    header: &NrtmFileHeader,
    notification: &Notification,
    file_ref: &FileRef,
) -> Result<(), HeaderError> {
    check_header(
        header,
        &notification.header.session_id,
        &notification.header.source,
        file_ref,
    )
}

/// Checks the header of a delta file against the replica it is applied to.
pub fn validate_delta_header(
    header: &NrtmFileHeader,
    source: &Source,
    file_ref: &FileRef,
) -> Result<(), HeaderError> {
    check_header(header, &source.session_id, &source.name, file_ref)?;
    ensure!(
        header.version >= source.version,
        FileVersionInconsistencySnafu {
            current: source.version,
            found: header.version,
        }
    );
    Ok(())
}

fn check_header(
    header: &NrtmFileHeader,
    session_id: &str,
    source: &str,
    file_ref: &FileRef,
) -> Result<(), HeaderError> {
    ensure!(
        header.nrtm_version == NRTM_VERSION,
        NrtmVersionSnafu {
            version: header.nrtm_version,
        }
    );
    ensure!(
        header.session_id == session_id,
        SessionMismatchSnafu {
            expected: session_id,
            found: &header.session_id,
        }
    );
    ensure!(
        header.source == source,
        SourceMismatchSnafu {
            expected: source,
            found: &header.source,
        }
    );
    ensure!(
        header.version == file_ref.version,
        FileVersionMismatchSnafu {
            expected: file_ref.version,
            found: header.version,
        }
    );
    Ok(())
}
