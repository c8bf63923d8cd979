//! Splits JSON text sequences (RFC 7464) into raw records.
//!
//! A record is the bytes between two record separators, trimmed of
//! whitespace. Decoding the JSON is left to the caller.

use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};

use flate2::read::GzDecoder;
use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu, ensure};

/// The record separator.
pub const RS: u8 = 0x1E;

#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum RecordError {
    #[snafu(display("failed to read record stream"))]
    Io { source: io::Error },
    #[snafu(display("not a JSON text sequence"))]
    NotJsonSeq {},
    #[snafu(display("bytes found before the first record separator"))]
    ExtraneousBytes {},
    #[snafu(display("empty payload in record {index}"))]
    EmptyPayload { index: usize },
}

/// Iterates the records of a JSON text sequence.
///
/// The iterator ends after the last record; an error is always the final item.
/// Empty records are reported as [`RecordError::EmptyPayload`], except for the
/// whitespace that may follow the last separator.
#[derive(Debug)]
pub struct RecordReader<R> {
    inner: R,
    started: bool,
    finished: bool,
    records: usize,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            started: false,
            finished: false,
            records: 0,
        }
    }

    /// Number of records yielded so far.
    pub fn records_read(&self) -> usize {
        self.records
    }

    fn read_record(&mut self) -> Result<Option<Vec<u8>>, RecordError> {
        if !self.started {
            self.started = true;
            let mut lead = Vec::new();
            self.inner.read_until(RS, &mut lead).context(IoSnafu)?;
            ensure!(lead.pop() == Some(RS), NotJsonSeqSnafu);
            ensure!(
                lead.iter().all(u8::is_ascii_whitespace),
                ExtraneousBytesSnafu
            );
        }

        let mut buf = Vec::new();
        self.inner.read_until(RS, &mut buf).context(IoSnafu)?;
        let terminated = buf.last() == Some(&RS);
        if terminated {
            buf.pop();
        }
        let record = buf.trim_ascii();
        if record.is_empty() {
            ensure!(!terminated, EmptyPayloadSnafu { index: self.records });
            return Ok(None);
        }
        self.records += 1;
        Ok(Some(record.to_vec()))
    }
}

impl<R: BufRead> Iterator for RecordReader<R> {
    type Item = Result<Vec<u8>, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let res = self.read_record().transpose();
        if !matches!(res, Some(Ok(_))) {
            self.finished = true;
        }
        res
    }
}

/// A boxed reader over a snapshot or delta file on disk.
pub type FileRecords = RecordReader<Box<dyn BufRead + Send>>;

/// Opens a downloaded file, decompressing it when its name ends in `.gz`.
pub fn open_file(path: impl AsRef<Path>) -> Result<FileRecords, RecordError> {
    let path = path.as_ref();
    let file = File::open(path).context(IoSnafu)?;
    let gzipped = path.extension().is_some_and(|ext| ext == "gz");
    let inner: Box<dyn BufRead + Send> = if gzipped {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(RecordReader::new(inner))
}
