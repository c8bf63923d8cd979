//! An in-process NRTM4 server for tests.

use std::{collections::HashMap, io::Write, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use flate2::{Compression, write::GzEncoder};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use url::Url;

use crate::{
    client::{ByteStream, Client, ClientError, StatusSnafu},
    clock::FixedClock,
    config::SnapshotConfig,
    protocol::FileRef,
    snapshot::{ProgressObserver, SnapshotProgress},
    store::ReplicaStore,
    sync::Processor,
};

pub(crate) const SOURCE: &str = "EXAMPLE";
pub(crate) const SESSION: &str = "ca128382-78d9-41d1-8927-1ecef15275be";
pub(crate) const OTHER_SESSION: &str = "7f3f4c2e-0b5a-4d8e-9b61-2a1f6c3d9e04";
pub(crate) const NOTIFICATION_URL: &str =
    "https://nrtm.example.net/nrtm4/EXAMPLE/update-notification-file.json";

pub(crate) const ROUTE: &str = "route: 192.0.2.0/24\norigin: AS65530\nsource: EXAMPLE";
pub(crate) const PERSON: &str = "person: Jane Doe\nnic-hdl: JD1-EXAMPLE\nsource: EXAMPLE";
pub(crate) const MNTNER: &str = "mntner: EXAMPLE-MNT\nsource: EXAMPLE";

/// Serves canned bodies by url and remembers every request.
#[derive(Debug, Default)]
pub(crate) struct StubClient {
    files: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<String>>,
}

impl StubClient {
    pub(crate) fn serve(&self, url: &str, body: Vec<u8>) {
        self.files.lock().insert(url.to_string(), body);
    }

    /// Requests whose url ends with `suffix`.
    pub(crate) fn requests(&self, suffix: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|url| url.ends_with(suffix))
            .count()
    }
}

#[async_trait]
impl Client for StubClient {
    async fn get_body(&self, url: &Url) -> Result<ByteStream, ClientError> {
        self.requests.lock().push(url.to_string());
        let Some(body) = self.files.lock().get(url.as_str()).cloned() else {
            return StatusSnafu {
                url: url.clone(),
                status: 404u16,
            }
            .fail();
        };
        let chunks: Vec<Result<Bytes, ClientError>> = body
            .chunks(64)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(futures_util::stream::iter(chunks).boxed())
    }
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Encodes records as `application/json-seq`.
pub(crate) fn json_seq(records: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    for record in records {
        out.push(0x1E);
        out.extend_from_slice(record.to_string().as_bytes());
        out.push(b'\n');
    }
    out
}

pub(crate) fn add_modify(object: &str) -> Value {
    json!({ "action": "add_modify", "object": object })
}

pub(crate) fn delete(object_class: &str, primary_key: &str) -> Value {
    json!({ "action": "delete", "object_class": object_class, "primary_key": primary_key })
}

/// The files a remote source publishes.
#[derive(Debug)]
pub(crate) struct Remote {
    pub(crate) client: Arc<StubClient>,
    pub(crate) session: String,
    snapshot: Option<FileRef>,
    deltas: Vec<FileRef>,
}

impl Remote {
    pub(crate) fn new() -> Self {
        Self {
            client: Default::default(),
            session: SESSION.to_string(),
            snapshot: None,
            deltas: Vec::new(),
        }
    }

    pub(crate) fn url() -> Url {
        Url::parse(NOTIFICATION_URL).expect("valid url")
    }

    pub(crate) fn header(&self, file_type: &str, version: u64) -> Value {
        json!({
            "nrtm_version": 4,
            "type": file_type,
            "source": SOURCE,
            "session_id": self.session,
            "version": version,
        })
    }

    /// Publishes `body` next to the notification and returns its reference.
    pub(crate) fn publish(&self, name: &str, version: u64, body: Vec<u8>) -> FileRef {
        let file_ref = FileRef {
            version,
            url: name.to_string(),
            hash: sha256_hex(&body),
        };
        let url = Self::url().join(name).expect("valid url");
        self.client.serve(url.as_str(), body);
        file_ref
    }

    pub(crate) fn snapshot_body(&self, version: u64, objects: &[&str]) -> Vec<u8> {
        let mut records = vec![self.header("snapshot", version)];
        records.extend(objects.iter().map(|object| json!({ "object": object })));
        json_seq(&records)
    }

    pub(crate) fn publish_snapshot(&mut self, version: u64, objects: &[&str]) -> FileRef {
        let body = self.snapshot_body(version, objects);
        self.publish_snapshot_body(&format!("snapshot-{version}.jsonseq"), version, body)
    }

    pub(crate) fn publish_snapshot_body(&mut self, name: &str, version: u64, body: Vec<u8>) -> FileRef {
        let file_ref = self.publish(name, version, body);
        self.snapshot = Some(file_ref.clone());
        file_ref
    }

    pub(crate) fn publish_gzip_snapshot(&mut self, version: u64, objects: &[&str]) -> FileRef {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&self.snapshot_body(version, objects))
            .expect("in memory");
        let body = encoder.finish().expect("in memory");
        self.publish_snapshot_body(&format!("snapshot-{version}.jsonseq.gz"), version, body)
    }

    pub(crate) fn publish_delta(&mut self, version: u64, changes: Vec<Value>) -> FileRef {
        let header = self.header("delta", version);
        self.publish_delta_file(&format!("delta-{version}.jsonseq"), version, header, changes)
    }

    /// Publishes a delta file referenced at `version` with an arbitrary header.
    pub(crate) fn publish_delta_file(
        &mut self,
        name: &str,
        version: u64,
        header: Value,
        changes: Vec<Value>,
    ) -> FileRef {
        let mut records = vec![header];
        records.extend(changes);
        let file_ref = self.publish(name, version, json_seq(&records));
        self.deltas.push(file_ref.clone());
        file_ref
    }

    /// Points the notification at a snapshot that is never served.
    pub(crate) fn announce_missing_snapshot(&mut self, version: u64) {
        self.snapshot = Some(FileRef {
            version,
            url: format!("missing-snapshot-{version}.jsonseq"),
            hash: sha256_hex(b""),
        });
    }

    /// Forgets published deltas, as a server does once they age out.
    pub(crate) fn drop_deltas(&mut self, versions: &[u64]) {
        self.deltas.retain(|d| !versions.contains(&d.version));
    }

    /// Starts a new session without any deltas.
    pub(crate) fn reset_session(&mut self, session: &str) {
        self.session = session.to_string();
        self.snapshot = None;
        self.deltas.clear();
    }

    pub(crate) fn notification(&self, version: u64) -> Value {
        let mut notification = self.header("notification", version);
        notification["timestamp"] = json!("2024-05-01T12:00:00Z");
        notification["snapshot"] = json!(self.snapshot);
        notification["deltas"] = json!(self.deltas);
        notification
    }

    /// Publishes the notification for `version`.
    pub(crate) fn publish_notification(&self, version: u64) {
        let body = self.notification(version).to_string().into_bytes();
        self.client.serve(NOTIFICATION_URL, body);
    }
}

/// Remembers every progress report.
#[derive(Debug, Default)]
pub(crate) struct RecordProgress {
    pub(crate) reports: Mutex<Vec<(String, SnapshotProgress)>>,
}

impl ProgressObserver for RecordProgress {
    fn snapshot_progress(&self, source: &str, progress: SnapshotProgress) {
        self.reports.lock().push((source.to_string(), progress));
    }
}

pub(crate) fn snapshot_config(progress_interval: Duration) -> SnapshotConfig {
    SnapshotConfig {
        parser_workers: 2,
        batch_size: 2,
        progress_interval,
    }
}

/// A processor over an in-memory store, keeping its files in `dir`.
pub(crate) fn processor(
    remote: &Remote,
    dir: &tempfile::TempDir,
) -> Result<Processor, crate::store::StoreError> {
    processor_with(remote, dir, snapshot_config(Duration::from_secs(3600)))
}

pub(crate) fn processor_with(
    remote: &Remote,
    dir: &tempfile::TempDir,
    snapshot: SnapshotConfig,
) -> Result<Processor, crate::store::StoreError> {
    let clock = Arc::new(FixedClock::from_millis(1_700_000_000_000));
    let store = ReplicaStore::in_memory()?.with_clock(clock.clone());
    Ok(Processor::new(
        Arc::new(store),
        remote.client.clone(),
        dir.path().join("files"),
        snapshot,
    )
    .with_clock(clock))
}
