//! Network access used by the fetch stage

use crate::config::FetchConfig;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use std::{io, path::PathBuf, time::Duration};

/// Reasons why an archive could not be downloaded
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Server answered with a non-success status
    #[error("server answered {status} for {url}")]
    Status { url: Box<str>, status: u16 },

    /// Request could not be sent, or response body could not be received
    #[error("request to {url} failed: {source}")]
    Request {
        url: Box<str>,
        #[source]
        source: reqwest::Error,
    },

    /// Server stopped sending data
    #[error("no data received from {url} for {timeout:?}")]
    Stalled { url: Box<str>, timeout: Duration },

    /// Response body ended before the announced length
    #[error("{url} announced {expected} bytes, but only sent {received}")]
    Truncated {
        url: Box<str>,
        expected: u64,
        received: u64,
    },

    /// Local file could not be written
    #[error("failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Download was interrupted on user request
    #[error("download was cancelled")]
    Cancelled,
}
//
impl FetchError {
    /// Truth that trying again later could help
    ///
    /// Network hiccups and server-side errors are worth another attempt.
    /// Client errors, local storage errors and cancellation are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::Request { source, .. } => !(source.is_builder() || source.is_redirect()),
            Self::Stalled { .. } | Self::Truncated { .. } => true,
            Self::Io { .. } | Self::Cancelled => false,
        }
    }
}

/// Stream of response body chunks
pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// Response to an archive request
pub struct Download {
    /// Size of the body, if announced by the server
    pub content_length: Option<u64>,

    /// Body chunks, in order
    pub body: ByteStream,
}

/// Something that archives can be downloaded from
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start downloading the resource at `url`
    ///
    /// Non-success responses must be reported as [`FetchError::Status`].
    async fn get(&self, url: &str) -> Result<Download, FetchError>;
}

/// HTTP(S) transport
#[derive(Clone, Debug)]
pub struct HttpTransport(reqwest::Client);
//
impl HttpTransport {
    /// Set up an HTTP client with the configured timeouts
    pub fn new(config: &FetchConfig) -> reqwest::Result<Self> {
        let mut builder = reqwest::Client::builder().connect_timeout(config.connect_timeout);
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self(builder.build()?))
    }
}
//
#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<Download, FetchError> {
        // Start the download
        let response = self.0.get(url).send().await.map_err(|source| FetchError::Request {
            url: url.into(),
            source,
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.into(),
                status: status.as_u16(),
            });
        }

        // Slice the download into chunks of bytes
        let content_length = response.content_length();
        let url: Box<str> = url.into();
        let body = response
            .bytes_stream()
            .map(move |res| {
                res.map_err(|source| FetchError::Request {
                    url: url.clone(),
                    source,
                })
            })
            .boxed();
        Ok(Download {
            content_length,
            body,
        })
    }
}
