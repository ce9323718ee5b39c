//! Candidate server registry.
//!
//! Holds the servers discovered at the start of a run and ranks them by
//! great-circle distance. The registry is repopulated on every run;
//! nothing here persists across tests.

use std::collections::HashSet;

use log::debug;

use crate::errors::SpeedTestError;
use crate::geo::Location;
use crate::results::ServerSnapshot;

/// A speed test server candidate.
#[derive(Debug, Clone)]
pub struct Server {
    pub id: u64,
    /// Full transfer endpoint URL, e.g. `http://host:8080/speedtest/upload.php`
    pub endpoint: String,
    pub name: String,
    pub sponsor: String,
    pub country: String,
    pub location: Location,
    /// Measured round-trip latency, set once per probe cycle.
    /// `f64::INFINITY` marks a server whose probes all failed.
    pub latency_ms: Option<f64>,
    /// Distance to the client, derived during ranking.
    pub distance_km: Option<f64>,
}

impl Server {
    pub fn new(
        id: u64,
        endpoint: impl Into<String>,
        name: impl Into<String>,
        sponsor: impl Into<String>,
        country: impl Into<String>,
        location: Location,
    ) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
            name: name.into(),
            sponsor: sponsor.into(),
            country: country.into(),
            location,
            latency_ms: None,
            distance_km: None,
        }
    }

    /// Owned snapshot for embedding into a result record.
    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            id: self.id,
            name: self.name.clone(),
            sponsor: self.sponsor.clone(),
        }
    }
}

/// Registry of candidate servers with unique ids.
///
/// `load` takes exclusive access; once loaded, reads may run
/// concurrently.
#[derive(Debug, Default)]
pub struct ServerRegistry {
    servers: Vec<Server>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self { servers: Vec::new() }
    }

    /// Replace the current contents with `candidates`.
    ///
    /// A duplicate id anywhere in the candidate list is rejected with
    /// `DuplicateServer` and leaves the previous contents untouched.
    pub fn load(
        &mut self,
        candidates: Vec<Server>,
    ) -> Result<(), SpeedTestError> {
        let mut seen = HashSet::with_capacity(candidates.len());

        for server in &candidates {
            if !seen.insert(server.id) {
                return Err(SpeedTestError::DuplicateServer { id: server.id });
            }
        }

        debug!("registry loaded with {} candidate servers", candidates.len());
        self.servers = candidates;

        Ok(())
    }

    /// The `k` servers closest to `origin`, ties broken by id ascending.
    ///
    /// Returns owned copies with `distance_km` populated; calling this
    /// twice without an intervening `load` yields identical sequences.
    pub fn nearest(&self, k: usize, origin: &Location) -> Vec<Server> {
        let mut ranked: Vec<Server> = self
            .servers
            .iter()
            .map(|server| {
                let mut server = server.clone();
                server.distance_km =
                    Some(origin.distance_km(&server.location));
                server
            })
            .collect();

        ranked.sort_by(|a, b| {
            let da = a.distance_km.unwrap_or(f64::INFINITY);
            let db = b.distance_km.unwrap_or(f64::INFINITY);
            da.total_cmp(&db).then_with(|| a.id.cmp(&b.id))
        });

        ranked.truncate(k);
        ranked
    }

    /// The subset matching `predicate`, without mutating the registry.
    pub fn filter(&self, predicate: impl Fn(&Server) -> bool) -> Vec<Server> {
        self.servers.iter().filter(|s| predicate(s)).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
