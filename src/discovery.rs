//! Server list and client info discovery.
//!
//! The engine depends on the [`ServerProvider`] trait; the HTTP
//! implementation fetches JSON documents from a configured primary URL
//! with a fallback, tolerating malformed entries in the server list.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use reqwest::Client as ReqwestClient;
use serde::Deserialize;

use crate::errors::SpeedTestError;
use crate::geo::Location;
use crate::registry::Server;
use crate::results::ClientInfo;

/// External source of candidate servers and client metadata.
pub trait ServerProvider: Send + Sync + 'static {
    fn fetch_candidates(
        &self,
    ) -> impl Future<Output = Result<Vec<Server>, SpeedTestError>> + Send;

    fn fetch_client_info(
        &self,
    ) -> impl Future<Output = Result<ClientInfo, SpeedTestError>> + Send;
}

/// One server record as served by the discovery endpoint.
#[derive(Debug, Deserialize)]
struct ServerRecord {
    id: u64,
    url: String,
    name: String,
    #[serde(default)]
    sponsor: String,
    #[serde(default)]
    country: String,
    lat: f64,
    lon: f64,
}

/// Client metadata as served by the discovery endpoint.
#[derive(Debug, Deserialize)]
struct ClientRecord {
    ip: String,
    #[serde(default)]
    isp: String,
    #[serde(default)]
    country: String,
    lat: f64,
    lon: f64,
}

/// Endpoint URLs for an [`HttpServerProvider`].
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Server list URL, tried first.
    pub servers_url: String,
    /// Fallback server list URL.
    pub servers_fallback_url: Option<String>,
    /// Client info URL.
    pub client_info_url: String,
}

/// HTTP discovery source backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpServerProvider {
    client: ReqwestClient,
    config: DiscoveryConfig,
}

impl HttpServerProvider {
    pub fn new(
        config: DiscoveryConfig,
        timeout: Duration,
    ) -> Result<Self, SpeedTestError> {
        let client = ReqwestClient::builder()
            .timeout(timeout)
            .build()
            .map_err(SpeedTestError::network)?;

        Ok(Self { client, config })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
    ) -> Result<T, SpeedTestError> {
        self.client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(SpeedTestError::network)?
            .json::<T>()
            .await
            .map_err(SpeedTestError::network)
    }
}

impl ServerProvider for HttpServerProvider {
    async fn fetch_candidates(&self) -> Result<Vec<Server>, SpeedTestError> {
        let records: Vec<ServerRecord> =
            match self.get_json(&self.config.servers_url).await {
                Ok(records) => records,
                Err(primary_err) => {
                    let Some(fallback) = &self.config.servers_fallback_url
                    else {
                        return Err(primary_err);
                    };
                    warn!(
                        "primary server list failed ({}), trying fallback",
                        primary_err
                    );
                    self.get_json(fallback).await?
                }
            };

        debug!("discovery returned {} server records", records.len());
        Ok(records
            .into_iter()
            .filter_map(|record| match Location::new(record.lat, record.lon) {
                Ok(location) => Some(Server::new(
                    record.id,
                    record.url,
                    record.name,
                    record.sponsor,
                    record.country,
                    location,
                )),
                Err(err) => {
                    // A single bad record should not sink discovery.
                    warn!("skipping server {}: {}", record.id, err);
                    None
                }
            })
            .collect())
    }

    async fn fetch_client_info(&self) -> Result<ClientInfo, SpeedTestError> {
        let record: ClientRecord =
            self.get_json(&self.config.client_info_url).await?;
        let location = Location::new(record.lat, record.lon)?;

        Ok(ClientInfo::new(record.ip, record.isp, record.country, location))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_record_deserializes_with_defaults() {
        let json = r#"{"id": 3, "url": "http://h.test/up.php",
                       "name": "Testville", "lat": 10.0, "lon": 20.0}"#;
        let record: ServerRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, 3);
        assert!(record.sponsor.is_empty());
        assert!(record.country.is_empty());
    }

    #[test]
    fn test_client_record_deserializes() {
        let json = r#"{"ip": "203.0.113.9", "isp": "Example ISP",
                       "country": "US", "lat": 37.0, "lon": -122.0}"#;
        let record: ClientRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.ip, "203.0.113.9");
        assert_eq!(record.isp, "Example ISP");
    }
}
