//! Downloads snapshot and delta files and verifies their hashes.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures_util::TryStreamExt;
use nested_enum_utils::common_fields;
use sha2::{Digest, Sha256};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt, BufWriter},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    client::{Client, ClientError},
    metrics::Metrics,
    protocol::FileRef,
};

/// Size of the buffer between the network and the disk.
pub const TRANSFER_BUFFER_SIZE: usize = 8 * 1024;

/// Files are grouped in directories of this many versions.
const VERSIONS_PER_DIR: u64 = 10_000;

const BAD_HASH_SUFFIX: &str = "-BADHASH";

#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum FetchError {
    #[snafu(display("invalid file url {url:?}"))]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[snafu(display("cannot derive a file name from {url}"))]
    NoFileName { url: Url },
    #[snafu(display("i/o error at {}", path.display()))]
    Io { path: PathBuf, source: io::Error },
    #[snafu(display("cannot move downloaded file to {}", path.display()))]
    Persist {
        path: PathBuf,
        source: tempfile::PersistError,
    },
    #[snafu(display("failed to download file"))]
    Download { source: ClientError },
    #[snafu(display("hash mismatch for {url}: expected {expected}, got {actual}"))]
    HashMismatch {
        url: Url,
        expected: String,
        actual: String,
    },
}

/// Fetches the files a notification refers to into a local directory.
///
/// A file that is already present is reused, provided it still matches the
/// expected hash. Files that fail the check are renamed with a `-BADHASH`
/// suffix so they are never picked up again.
#[derive(Debug, Clone)]
pub struct ResourceFetcher {
    client: Arc<dyn Client>,
    files_dir: PathBuf,
    metrics: Arc<Metrics>,
}

impl ResourceFetcher {
    pub fn new(client: Arc<dyn Client>, files_dir: PathBuf, metrics: Arc<Metrics>) -> Self {
        Self {
            client,
            files_dir,
            metrics,
        }
    }

    /// Directory a file for `source` at `version` is stored in.
    pub fn destination_dir(&self, source: &str, version: u64) -> PathBuf {
        let bucket = (version / VERSIONS_PER_DIR) * VERSIONS_PER_DIR;
        self.files_dir.join(source).join(bucket.to_string())
    }

    /// Returns the path of a verified local copy of `file_ref`.
    ///
    /// Relative urls are resolved against `notification_url`.
    pub async fn fetch(
        &self,
        notification_url: &Url,
        source: &str,
        file_ref: &FileRef,
    ) -> Result<PathBuf, FetchError> {
        let url = notification_url
            .join(&file_ref.url)
            .context(InvalidUrlSnafu {
                url: file_ref.url.as_str(),
            })?;
        let file_name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .context(NoFileNameSnafu { url: url.clone() })?
            .to_string();
        let dir = self.destination_dir(source, file_ref.version);
        fs::create_dir_all(&dir)
            .await
            .context(IoSnafu { path: dir.clone() })?;
        let path = dir.join(&file_name);

        if fs::try_exists(&path).await.unwrap_or(false) {
            let actual = hash_file(&path)
                .await
                .context(IoSnafu { path: path.clone() })?;
            if actual.eq_ignore_ascii_case(&file_ref.hash) {
                debug!(path = %path.display(), "reusing downloaded file");
                self.metrics.fetch_reused.inc();
                return Ok(path);
            }
            warn!(path = %path.display(), "existing file does not match its hash, downloading again");
            quarantine(&path).await?;
        }

        self.download(&url, &path, &file_ref.hash).await?;
        Ok(path)
    }

    /// Streams `url` into a temporary file next to `path` and moves it into
    /// place once the hash matches.
    ///
    /// Every download gets its own temporary file, so concurrent fetches of
    /// the same file never write to each other's inode.
    async fn download(&self, url: &Url, path: &Path, expected: &str) -> Result<(), FetchError> {
        let dir = path.parent().unwrap_or(&self.files_dir);
        let mut body = self.client.get_body(url).await.context(DownloadSnafu)?;
        let mut prefix = path.file_name().unwrap_or_default().to_owned();
        prefix.push(".");
        let part = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".part")
            .tempfile_in(dir)
            .context(IoSnafu { path: dir })?;
        let file = part
            .reopen()
            .context(IoSnafu { path: part.path() })?;
        let mut writer = BufWriter::with_capacity(TRANSFER_BUFFER_SIZE, File::from_std(file));
        let mut hasher = Sha256::new();
        let mut len = 0u64;
        while let Some(chunk) = body.try_next().await.context(DownloadSnafu)? {
            hasher.update(&chunk);
            len += chunk.len() as u64;
            writer
                .write_all(&chunk)
                .await
                .context(IoSnafu { path: part.path() })?;
        }
        writer
            .flush()
            .await
            .context(IoSnafu { path: part.path() })?;
        drop(writer);
        self.metrics.fetch_downloads.inc();
        self.metrics.fetch_bytes.inc_by(len);

        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected) {
            self.metrics.fetch_hash_mismatch.inc();
            let target = with_suffix(path, BAD_HASH_SUFFIX);
            warn!(path = %target.display(), "quarantining file with bad hash");
            part.persist(&target).context(PersistSnafu { path: target })?;
            return HashMismatchSnafu {
                url: url.clone(),
                expected,
                actual,
            }
            .fail();
        }
        part.persist(path).context(PersistSnafu { path })?;
        info!(%url, len, "downloaded file");
        Ok(())
    }
}

async fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; TRANSFER_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Moves a local file that failed verification out of the way.
///
/// A file that is already gone was moved by a concurrent fetch.
async fn quarantine(path: &Path) -> Result<(), FetchError> {
    let target = with_suffix(path, BAD_HASH_SUFFIX);
    warn!(path = %target.display(), "quarantining file with bad hash");
    match fs::rename(path, &target).await {
        Err(err) if err.kind() != io::ErrorKind::NotFound => {
            Err(err).context(IoSnafu { path: target })
        }
        _ => Ok(()),
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
