//! Errors returned by a sync attempt or an operator command.

use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};
use strum::Display;

use crate::{
    client::ClientError,
    fetch::FetchError,
    jsonseq::RecordError,
    pool::PoolError,
    protocol::DeltaAction,
    rpsl::RpslError,
    store::StoreError,
    validate::{DeltaSequenceError, HeaderError, ValidationFailure},
};

/// Broad classes of [`SyncError`], telling remote data problems apart from
/// transport trouble and local bugs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ErrorKind {
    /// The remote published something that violates the protocol.
    Protocol,
    /// Remote data failed a hash check or cannot be applied safely.
    Integrity,
    /// Network or disk trouble, worth retrying later.
    Transport,
    /// The local store failed.
    Storage,
    /// The request itself was wrong, e.g. an unknown source.
    Operator,
    /// A bug.
    Internal,
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
pub enum SyncError {
    #[snafu(display("failed to fetch notification"))]
    FetchNotification { source: ClientError },
    #[snafu(display("invalid notification: {}", join(failures)))]
    InvalidNotification { failures: Vec<ValidationFailure> },
    #[snafu(display("cannot apply deltas"))]
    DeltaSequence { source: DeltaSequenceError },
    #[snafu(display("invalid file header"))]
    Header { source: HeaderError },
    #[snafu(display("failed to fetch file"))]
    Fetch { source: FetchError },
    #[snafu(display("failed to read records"))]
    Records { source: RecordError },
    #[snafu(display("{file} file has no header"))]
    MissingHeader { file: &'static str },
    #[snafu(display("malformed {what} record"))]
    MalformedRecord {
        what: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("unknown delta action {action:?}"))]
    UnknownDeltaAction { action: String },
    #[snafu(display("{action} record without {field}"))]
    MissingField {
        action: DeltaAction,
        field: &'static str,
    },
    #[snafu(display("delta object cannot be parsed"))]
    InvalidDeltaObject { source: RpslError },
    #[snafu(display("store error"))]
    Store { source: StoreError },
    #[snafu(display("no source {name} with label {label:?}"))]
    SourceNotFound { name: String, label: String },
    #[snafu(display("source {name} with label {label:?} already exists"))]
    SourceExists { name: String, label: String },
    #[snafu(display("notification names source {found}, expected {expected}"))]
    SourceRenamed { expected: String, found: String },
    #[snafu(display("invalid label {label:?}"))]
    InvalidLabel { label: String },
    #[snafu(display("worker task failed"))]
    Worker { source: tokio::task::JoinError },
    #[snafu(display("worker pool unavailable"))]
    Pool { source: PoolError },
}

fn join(failures: &[ValidationFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::FetchNotification { source, .. } => match source {
                ClientError::Decode { .. } => ErrorKind::Protocol,
                _ => ErrorKind::Transport,
            },
            Self::InvalidNotification { .. }
            | Self::DeltaSequence { .. }
            | Self::Header { .. }
            | Self::MissingHeader { .. }
            | Self::MalformedRecord { .. }
            | Self::UnknownDeltaAction { .. }
            | Self::MissingField { .. }
            | Self::SourceRenamed { .. } => ErrorKind::Protocol,
            Self::Fetch { source, .. } => match source {
                FetchError::HashMismatch { .. } => ErrorKind::Integrity,
                FetchError::InvalidUrl { .. } | FetchError::NoFileName { .. } => {
                    ErrorKind::Protocol
                }
                _ => ErrorKind::Transport,
            },
            Self::Records { source, .. } => match source {
                RecordError::Io { .. } => ErrorKind::Transport,
                _ => ErrorKind::Protocol,
            },
            Self::InvalidDeltaObject { .. } => ErrorKind::Integrity,
            Self::Store { source, .. } => match source {
                StoreError::DuplicateSource { .. } => ErrorKind::Operator,
                _ => ErrorKind::Storage,
            },
            Self::SourceNotFound { .. }
            | Self::SourceExists { .. }
            | Self::InvalidLabel { .. } => ErrorKind::Operator,
            Self::Worker { .. } | Self::Pool { .. } => ErrorKind::Internal,
        }
    }

    /// Whether the remote data is at fault, so that a fresh bootstrap may help.
    pub fn is_remote_data_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::Protocol | ErrorKind::Integrity)
    }
}
