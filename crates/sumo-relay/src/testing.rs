use std::convert::Infallible;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use flate2::read::GzDecoder;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use tokio::net::TcpListener;

use crate::buffer::LogBuffer;
use crate::uploader::{NAME_HEADER, UploadError, Uploader};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub payload: Vec<u8>,
    pub tag: String,
}

impl Upload {
    pub fn new(payload: &str, tag: &str) -> Self {
        Self {
            payload: payload.as_bytes().to_vec(),
            tag: tag.to_owned(),
        }
    }
}

/// Accepts everything and remembers each call in order.
#[derive(Default)]
pub struct RecordingUploader {
    calls: Mutex<Vec<Upload>>,
}

impl RecordingUploader {
    pub fn calls(&self) -> Vec<Upload> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, payload: &[u8], tag: &str) {
        self.calls.lock().unwrap().push(Upload {
            payload: payload.to_vec(),
            tag: tag.to_owned(),
        });
    }
}

impl Uploader for RecordingUploader {
    async fn send(&self, payload: &[u8], tag: &str) -> Result<(), UploadError> {
        self.record(payload, tag);
        Ok(())
    }
}

pub struct FailingUploader;

impl Uploader for FailingUploader {
    async fn send(&self, _payload: &[u8], _tag: &str) -> Result<(), UploadError> {
        Err(rejected(StatusCode::INTERNAL_SERVER_ERROR.as_u16()))
    }
}

/// Fails every upload for one tag and records the rest.
pub struct TagFailUploader {
    pub failing_tag: String,
    pub inner: RecordingUploader,
}

impl TagFailUploader {
    pub fn new(failing_tag: &str) -> Self {
        Self {
            failing_tag: failing_tag.to_owned(),
            inner: RecordingUploader::default(),
        }
    }
}

impl Uploader for TagFailUploader {
    async fn send(&self, payload: &[u8], tag: &str) -> Result<(), UploadError> {
        if tag == self.failing_tag {
            return Err(rejected(StatusCode::SERVICE_UNAVAILABLE.as_u16()));
        }
        self.inner.record(payload, tag);
        Ok(())
    }
}

/// Sleeps before succeeding, to hold a flush open.
#[derive(Default)]
pub struct SlowUploader {
    pub inner: RecordingUploader,
}

impl Uploader for SlowUploader {
    async fn send(&self, payload: &[u8], tag: &str) -> Result<(), UploadError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.inner.record(payload, tag);
        Ok(())
    }
}

pub fn rejected(status: u16) -> UploadError {
    UploadError::Rejected {
        status: reqwest::StatusCode::from_u16(status).unwrap(),
    }
}

/// Poll until `buffer` holds `len` records, panicking after a few seconds.
pub async fn wait_for_len(buffer: &LogBuffer, len: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while buffer.len() < len {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {len} records, have {}",
            buffer.len()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn payloads(buffer: &LogBuffer) -> Vec<String> {
    buffer
        .pending()
        .iter()
        .map(|r| String::from_utf8_lossy(r.payload()).into_owned())
        .collect()
}

pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// A request as seen by [`MockCollector`], with gzip bodies already inflated.
#[derive(Debug, Clone)]
pub struct CollectedRequest {
    pub method: String,
    pub content_encoding: Option<String>,
    pub name: Option<String>,
    pub raw_len: usize,
    pub body: Vec<u8>,
}

/// Local HTTP collector that stores every request and answers with a
/// configurable status.
#[derive(Clone)]
pub struct MockCollector {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<CollectedRequest>>>,
    status: Arc<AtomicU16>,
}

impl MockCollector {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let collector = Self {
            addr,
            requests: Arc::new(Mutex::new(Vec::new())),
            status: Arc::new(AtomicU16::new(200)),
        };

        let server = collector.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let server = server.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let server = server.clone();
                        async move { server.handle(req).await }
                    });
                    let _ = Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        collector
    }

    pub fn url(&self) -> url::Url {
        url::Url::parse(&format!("http://{}/receiver/v1/http/token", self.addr)).unwrap()
    }

    pub fn respond_with(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<CollectedRequest> {
        self.requests.lock().unwrap().clone()
    }

    async fn handle<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, Infallible>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
    {
        let method = req.method().to_string();
        let content_encoding = header(&req, "content-encoding");
        let name = header(&req, NAME_HEADER);

        let raw = req
            .collect()
            .await
            .map(|c| c.to_bytes())
            .unwrap_or_default();

        let body = if content_encoding.as_deref() == Some("gzip") {
            let mut inflated = Vec::new();
            GzDecoder::new(&raw[..])
                .read_to_end(&mut inflated)
                .unwrap();
            inflated
        } else {
            raw.to_vec()
        };

        self.requests.lock().unwrap().push(CollectedRequest {
            method,
            content_encoding,
            name,
            raw_len: raw.len(),
            body,
        });

        let status = StatusCode::from_u16(self.status.load(Ordering::SeqCst)).unwrap();
        Ok(Response::builder()
            .status(status)
            .body(Full::default())
            .unwrap())
    }
}

fn header<B>(req: &Request<B>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_owned())
}
