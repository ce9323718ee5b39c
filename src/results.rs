//! Result data structures for a completed speed test.
//!
//! [`TestResult`] is an immutable record assembled once at the end of a
//! successful run and handed to the history store. All structures
//! implement `Serialize` for JSON output.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::geo::Location;

/// Client connection metadata, fetched once per test run.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    /// Public IP address of the client
    pub ip: String,
    /// ISP/Organization name
    pub isp: String,
    /// ISO country code
    pub country: String,
    /// Geographic location of the client
    pub location: Location,
}

impl ClientInfo {
    pub fn new(
        ip: String,
        isp: String,
        country: String,
        location: Location,
    ) -> Self {
        Self { ip, isp, country, location }
    }
}

/// An owned snapshot of the server a test ran against.
///
/// Carried by value inside [`TestResult`] so history entries never
/// alias registry state.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSnapshot {
    pub id: u64,
    pub name: String,
    pub sponsor: String,
}

/// Complete results from one speed test run.
///
/// Immutable once constructed; a failed run produces no `TestResult`
/// at all rather than a partially populated one.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    /// When the test completed
    pub timestamp: DateTime<Utc>,
    /// The server the test ran against
    pub server: ServerSnapshot,
    /// Client metadata, when discovery provided it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientInfo>,
    /// Round-trip latency to the chosen server in milliseconds
    pub ping_ms: f64,
    /// Download throughput in Mbps
    pub download_mbps: f64,
    /// Upload throughput in Mbps
    pub upload_mbps: f64,
    /// Confirmed bytes received during the download phase
    pub bytes_downloaded: u64,
    /// Confirmed bytes sent during the upload phase
    pub bytes_uploaded: u64,
    /// Wall-clock duration of the whole run
    #[serde(serialize_with = "serialize_duration_secs")]
    pub duration: Duration,
}

impl TestResult {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server: ServerSnapshot,
        client: Option<ClientInfo>,
        ping_ms: f64,
        download_mbps: f64,
        upload_mbps: f64,
        bytes_downloaded: u64,
        bytes_uploaded: u64,
        duration: Duration,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            server,
            client,
            ping_ms,
            download_mbps,
            upload_mbps,
            bytes_downloaded,
            bytes_uploaded,
            duration,
        }
    }
}

fn serialize_duration_secs<S>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}
