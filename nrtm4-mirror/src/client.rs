//! HTTP access to an NRTM4 server.

use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt, stream::BoxStream};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu, ensure};
use tracing::debug;
use url::Url;

use crate::protocol::{Notification, NotificationDecodeError};

/// Notifications larger than this are rejected.
const MAX_NOTIFICATION_SIZE: usize = 16 * 1024 * 1024;

#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum ClientError {
    #[snafu(display("failed to create http client"))]
    CreateClient { source: reqwest::Error },
    #[snafu(display("request to {url} failed"))]
    HttpRequest { url: Url, source: reqwest::Error },
    #[snafu(display("{url} responded with status {status}"))]
    Status { url: Url, status: u16 },
    #[snafu(display("failed to read response body of {url}"))]
    Body { url: Url, source: reqwest::Error },
    #[snafu(display("response body of {url} exceeds {limit} bytes"))]
    BodyTooLarge { url: Url, limit: usize },
    #[snafu(display("invalid notification at {url}"))]
    Decode {
        url: Url,
        source: NotificationDecodeError,
    },
}

impl ClientError {
    /// The HTTP status code, if the server answered with a non-2xx status.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// A stream of body chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, ClientError>>;

/// Fetches resources from a remote server.
#[async_trait]
pub trait Client: Debug + Send + Sync + 'static {
    /// Starts a GET request and returns the body once the status is known to be 2xx.
    async fn get_body(&self, url: &Url) -> Result<ByteStream, ClientError>;

    /// Fetches and decodes the notification file at `url`.
    async fn fetch_notification(&self, url: &Url) -> Result<Notification, ClientError> {
        let mut body = self.get_body(url).await?;
        let mut buf = Vec::new();
        while let Some(chunk) = body.try_next().await? {
            buf.extend_from_slice(&chunk);
            ensure!(
                buf.len() <= MAX_NOTIFICATION_SIZE,
                BodyTooLargeSnafu {
                    url: url.clone(),
                    limit: MAX_NOTIFICATION_SIZE,
                }
            );
        }
        debug!(%url, len = buf.len(), "fetched notification");
        Notification::decode(&buf).context(DecodeSnafu { url: url.clone() })
    }
}

/// [`Client`] backed by [`reqwest`].
#[derive(Debug, Clone)]
pub struct HttpClient {
    http_client: reqwest::Client,
}

impl HttpClient {
    /// Creates a client whose requests fail after `timeout`, body included.
    pub fn new(
        timeout: Duration,
        connect_timeout: Duration,
        user_agent: &str,
    ) -> Result<Self, ClientError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .user_agent(user_agent)
            .build()
            .context(CreateClientSnafu)?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl Client for HttpClient {
    async fn get_body(&self, url: &Url) -> Result<ByteStream, ClientError> {
        let response = self
            .http_client
            .get(url.clone())
            .send()
            .await
            .context(HttpRequestSnafu { url: url.clone() })?;
        let status = response.status();
        ensure!(
            status.is_success(),
            StatusSnafu {
                url: url.clone(),
                status: status.as_u16(),
            }
        );
        let url = url.clone();
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.context(BodySnafu { url: url.clone() }));
        Ok(body.boxed())
    }
}
