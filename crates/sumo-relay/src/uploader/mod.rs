use std::future::Future;
use std::io::Write;

use flate2::write::GzEncoder;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::Config;

/// Header carrying the record tag so the collector can name the stream.
pub const NAME_HEADER: &str = "X-Sumo-Name";

/// Default size above which payloads are gzip-compressed before upload.
pub const DEFAULT_GZIP_THRESHOLD: usize = 131_072;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("collector rejected payload: {status}")]
    Rejected { status: StatusCode },

    #[error("gzip compression failed: {0}")]
    Compression(#[from] std::io::Error),
}

/// Delivers one payload under one tag.
///
/// Implementations hold no per-call state, so a single uploader can be shared
/// by every flush.
pub trait Uploader: Send + Sync {
    fn send(
        &self,
        payload: &[u8],
        tag: &str,
    ) -> impl Future<Output = Result<(), UploadError>> + Send;
}

/// Posts payloads to a single Sumo Logic HTTP collector.
#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: Client,
    url: Url,
    gzip_threshold: usize,
}

impl HttpUploader {
    pub fn new(url: Url, gzip_threshold: usize) -> Result<Self, UploadError> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            url,
            gzip_threshold,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, UploadError> {
        Self::new(config.url.clone(), config.gzip_threshold)
    }

    async fn post(&self, payload: &[u8], tag: &str) -> Result<(), UploadError> {
        let compressed = payload.len() > self.gzip_threshold;
        let body = if compressed {
            compress_gzip(payload)?
        } else {
            payload.to_vec()
        };

        let mut req = self.client.post(self.url.clone());
        if compressed {
            req = req.header("content-encoding", "gzip");
        }
        if !tag.is_empty() {
            req = req.header(NAME_HEADER, tag);
        }

        debug!(tag, bytes = body.len(), compressed, "uploading payload");
        let resp = req.body(body).send().await?;

        // The collector acknowledges with a bare 200; anything else is a failure.
        if resp.status() == StatusCode::OK {
            Ok(())
        } else {
            Err(UploadError::Rejected {
                status: resp.status(),
            })
        }
    }
}

impl Uploader for HttpUploader {
    async fn send(&self, payload: &[u8], tag: &str) -> Result<(), UploadError> {
        if payload.is_empty() {
            return Ok(());
        }
        self.post(payload, tag).await
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
