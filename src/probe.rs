//! Concurrent latency probing and best-server selection.
//!
//! Each candidate gets a bounded number of timed round trips; failed
//! probes are kept in the ranking as infinite latency so a total-failure
//! run still produces a well-defined "best of worst" set, unless every
//! server is unreachable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use log::{debug, warn};
use tokio::time::timeout;

use crate::cancel::CancelToken;
use crate::client::TransferClient;
use crate::errors::SpeedTestError;
use crate::progress::{ProgressCallback, ProgressEvent};
use crate::registry::Server;
use crate::stats::median_f64;

/// Tuning knobs for a probe cycle.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Timed round trips per server; the recorded latency is the
    /// median of the successful ones.
    pub attempts: usize,
    /// Per-attempt deadline.
    pub timeout: Duration,
    /// Upper bound on servers probed concurrently.
    pub max_concurrent: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout: Duration::from_secs(5),
            max_concurrent: 5,
        }
    }
}

/// The ranked outcome of a probe cycle, best server first.
///
/// Only [`LatencyProber::probe`] constructs one, and never with an
/// empty ranking.
#[derive(Debug)]
pub struct ProbeOutcome {
    ranked: Vec<Server>,
}

impl ProbeOutcome {
    /// The selected server.
    pub fn best(&self) -> &Server {
        // Non-empty by construction.
        &self.ranked[0]
    }

    /// All probed servers with `latency_ms` populated, ranked by
    /// latency, then distance, then id.
    pub fn ranked(&self) -> &[Server] {
        &self.ranked
    }
}

/// Probes candidate servers concurrently and ranks them.
pub struct LatencyProber<C> {
    client: Arc<C>,
    config: ProbeConfig,
}

impl<C: TransferClient> LatencyProber<C> {
    pub fn new(client: Arc<C>, config: ProbeConfig) -> Self {
        Self { client, config }
    }

    /// Probe every server in `servers` and rank them.
    ///
    /// Fails with `NoReachableServer` when the candidate list is empty
    /// or every probe on every server failed, and with `Cancelled`
    /// when the caller aborts mid-cycle.
    pub async fn probe(
        &self,
        servers: Vec<Server>,
        progress: &dyn ProgressCallback,
        mut cancel: CancelToken,
    ) -> Result<ProbeOutcome, SpeedTestError> {
        if servers.is_empty() {
            return Err(SpeedTestError::NoReachableServer);
        }

        let total = servers.len();
        let concurrency = self.config.max_concurrent.min(total).max(1);
        let finished = AtomicUsize::new(0);

        let probes = stream::iter(servers)
            .map(|mut server| {
                let client = Arc::clone(&self.client);
                let finished = &finished;
                async move {
                    let latency_ms = probe_latency(
                        client.as_ref(),
                        &server.endpoint,
                        self.config.attempts,
                        self.config.timeout,
                    )
                    .await;
                    server.latency_ms = Some(latency_ms);

                    let current = finished.fetch_add(1, Ordering::Relaxed) + 1;
                    progress.on_progress(ProgressEvent::ProbeMeasurement {
                        server_id: server.id,
                        latency_ms,
                        current,
                        total,
                    });

                    server
                }
            })
            .buffer_unordered(concurrency)
            .collect::<Vec<Server>>();

        let mut ranked: Vec<Server> = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SpeedTestError::Cancelled),
            ranked = probes => ranked,
        };

        if ranked
            .iter()
            .all(|s| s.latency_ms.unwrap_or(f64::INFINITY).is_infinite())
        {
            warn!("all {} latency probes failed", total);
            return Err(SpeedTestError::NoReachableServer);
        }

        // Latency first; static geography only breaks ties.
        ranked.sort_by(|a, b| {
            let la = a.latency_ms.unwrap_or(f64::INFINITY);
            let lb = b.latency_ms.unwrap_or(f64::INFINITY);
            let da = a.distance_km.unwrap_or(f64::INFINITY);
            let db = b.distance_km.unwrap_or(f64::INFINITY);
            la.total_cmp(&lb)
                .then(da.total_cmp(&db))
                .then_with(|| a.id.cmp(&b.id))
        });

        debug!(
            "probe cycle complete, best server {} at {:.2} ms",
            ranked[0].id,
            ranked[0].latency_ms.unwrap_or(f64::INFINITY)
        );

        Ok(ProbeOutcome { ranked })
    }
}

/// Run `attempts` timed round trips against one endpoint.
///
/// Returns the median of the successful attempts in milliseconds, or
/// `f64::INFINITY` when every attempt timed out or errored.
async fn probe_latency<C: TransferClient>(
    client: &C,
    endpoint: &str,
    attempts: usize,
    per_attempt_timeout: Duration,
) -> f64 {
    let mut timings = Vec::with_capacity(attempts);

    for attempt in 0..attempts {
        match timeout(per_attempt_timeout, client.connect_and_time(endpoint))
            .await
        {
            Ok(Ok(elapsed)) => {
                timings.push(elapsed.as_secs_f64() * 1000.0);
            }
            Ok(Err(err)) => {
                debug!(
                    "probe attempt {}/{} to {} failed: {}",
                    attempt + 1,
                    attempts,
                    endpoint,
                    err
                );
            }
            Err(_) => {
                debug!(
                    "probe attempt {}/{} to {} timed out after {:?}",
                    attempt + 1,
                    attempts,
                    endpoint,
                    per_attempt_timeout
                );
            }
        }
    }

    median_f64(&mut timings).unwrap_or(f64::INFINITY)
}
