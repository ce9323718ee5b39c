//! Abstract transfer client and its HTTP implementation.
//!
//! The measurement core depends only on the [`TransferClient`] trait;
//! [`HttpTransferClient`] is the production implementation on top of
//! reqwest. Tests substitute a mock.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, CACHE_CONTROL, USER_AGENT};
use reqwest::Client as ReqwestClient;
use tokio::time::Instant;
use url::Url;

use crate::errors::SpeedTestError;

const UA: &str =
    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Transport primitives the measurement core relies on.
///
/// All methods are raced against cancellation signals by the caller,
/// so implementations should honor future drop by releasing their
/// connection.
pub trait TransferClient: Send + Sync + 'static {
    /// Open a connection to `endpoint`, perform one lightweight round
    /// trip, and return the elapsed time.
    fn connect_and_time(
        &self,
        endpoint: &str,
    ) -> impl Future<Output = Result<Duration, SpeedTestError>> + Send;

    /// Download one chunk of roughly `bytes` bytes from `endpoint`,
    /// returning the number of bytes actually received.
    fn fetch_chunk(
        &self,
        endpoint: &str,
        bytes: u64,
    ) -> impl Future<Output = Result<u64, SpeedTestError>> + Send;

    /// Upload `payload` to `endpoint`, returning the number of bytes
    /// acknowledged.
    fn push_chunk(
        &self,
        endpoint: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<u64, SpeedTestError>> + Send;
}

/// Resolve a path relative to the directory of a server endpoint URL.
///
/// `http://host:8080/speedtest/upload.php` + `latency.txt` becomes
/// `http://host:8080/speedtest/latency.txt`; the port survives.
pub fn sibling_url(endpoint: &str, file: &str) -> Result<Url, SpeedTestError> {
    let base = Url::parse(endpoint).map_err(SpeedTestError::network)?;
    base.join(file).map_err(SpeedTestError::network)
}

/// Append a millisecond-timestamp query parameter so intermediate
/// caches never serve a stale body.
fn cache_bust(mut url: Url) -> Url {
    url.query_pairs_mut()
        .append_pair("x", &Utc::now().timestamp_millis().to_string());
    url
}

/// HTTP transfer client backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransferClient {
    client: ReqwestClient,
}

impl HttpTransferClient {
    pub fn new(timeout: Duration) -> Result<Self, SpeedTestError> {
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(USER_AGENT, HeaderValue::from_static(UA));

        let client = ReqwestClient::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(SpeedTestError::network)?;

        Ok(Self { client })
    }
}

impl TransferClient for HttpTransferClient {
    async fn connect_and_time(
        &self,
        endpoint: &str,
    ) -> Result<Duration, SpeedTestError> {
        let url = cache_bust(sibling_url(endpoint, "latency.txt")?);

        let start = Instant::now();
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(SpeedTestError::network)?;
        // Wait for the body so the measurement covers a full round trip.
        let _ = response.bytes().await.map_err(SpeedTestError::network)?;
        let elapsed = start.elapsed();

        debug!("probe round trip to {}: {:?}", endpoint, elapsed);
        Ok(elapsed)
    }

    async fn fetch_chunk(
        &self,
        endpoint: &str,
        bytes: u64,
    ) -> Result<u64, SpeedTestError> {
        let mut url = sibling_url(endpoint, "random.bin")?;
        url.query_pairs_mut().append_pair("bytes", &bytes.to_string());
        let url = cache_bust(url);

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(SpeedTestError::network)?;

        let mut received = 0u64;
        while let Some(chunk) =
            response.chunk().await.map_err(SpeedTestError::network)?
        {
            received += chunk.len() as u64;
        }

        Ok(received)
    }

    async fn push_chunk(
        &self,
        endpoint: &str,
        payload: Vec<u8>,
    ) -> Result<u64, SpeedTestError> {
        let url = cache_bust(
            Url::parse(endpoint).map_err(SpeedTestError::network)?,
        );
        let sent = payload.len() as u64;

        self.client
            .post(url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(payload)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(SpeedTestError::network)?;

        Ok(sent)
    }
}
