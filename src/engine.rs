//! The test engine that orchestrates a complete measurement run.
//!
//! Sequences discovery, registry load, latency probing, download and
//! upload measurement, result assembly, and history insertion. A
//! failing stage stops the run, records nothing, and surfaces an
//! [`EngineError`] tagged with the stage.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::time::Instant;

use crate::cancel::CancelHandle;
use crate::client::TransferClient;
use crate::discovery::ServerProvider;
use crate::errors::{EngineError, SpeedTestError, Stage};
use crate::history::HistoryStore;
use crate::probe::{LatencyProber, ProbeConfig};
use crate::progress::{ProgressCallback, ProgressEvent, StatusCallback, TestPhase};
use crate::registry::ServerRegistry;
use crate::results::TestResult;
use crate::transfer::{TransferMeasurer, TransferPlan};

/// Configuration for a test engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How many of the nearest candidates go into the probe cycle.
    pub preselect: usize,
    /// Latency probe settings.
    pub probe: ProbeConfig,
    /// Download phase chunk schedule.
    pub download: TransferPlan,
    /// Upload phase chunk schedule.
    pub upload: TransferPlan,
    /// Ring-buffer capacity of the result history.
    pub history_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            preselect: 5,
            probe: ProbeConfig::default(),
            // Escalating chunk ladder, four passes over each size.
            download: TransferPlan {
                chunk_sizes: vec![
                    350_000, 500_000, 750_000, 1_000_000, 1_500_000,
                    2_000_000, 2_500_000, 3_000_000, 3_500_000, 4_000_000,
                ],
                repetitions: 4,
                streams: 4,
                deadline: Duration::from_secs(10),
            },
            upload: TransferPlan {
                chunk_sizes: vec![262_144, 524_288, 1_048_576, 7_340_032],
                repetitions: 5,
                streams: 4,
                deadline: Duration::from_secs(10),
            },
            history_capacity: 100,
        }
    }
}

/// Orchestrates the full measurement sequence.
///
/// A plain owned instance: collaborators are injected at construction
/// so multiple engines can coexist (and be mocked) freely.
pub struct Engine<P, C> {
    provider: P,
    prober: LatencyProber<C>,
    measurer: TransferMeasurer<C>,
    registry: ServerRegistry,
    history: HistoryStore,
    config: EngineConfig,
    cancel: CancelHandle,
}

impl<P: ServerProvider, C: TransferClient> Engine<P, C> {
    pub fn new(provider: P, client: Arc<C>, config: EngineConfig) -> Self {
        Self {
            provider,
            prober: LatencyProber::new(
                Arc::clone(&client),
                config.probe.clone(),
            ),
            measurer: TransferMeasurer::new(client),
            registry: ServerRegistry::new(),
            history: HistoryStore::new(config.history_capacity),
            config,
            cancel: CancelHandle::new(),
        }
    }

    /// Recorded results, oldest first.
    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// A handle that aborts the run currently in flight.
    ///
    /// Cloneable and usable from any task; a cancelled run fails with
    /// [`SpeedTestError::Cancelled`] and records nothing. Each new run
    /// clears any earlier request.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run one complete speed test.
    ///
    /// Status messages are fire-and-forget; nothing a subscriber does
    /// with them can fail the run.
    pub async fn run(
        &mut self,
        status: &dyn StatusCallback,
        progress: &dyn ProgressCallback,
    ) -> Result<TestResult, EngineError> {
        let run_start = Instant::now();
        self.cancel.reset();
        let cancel = self.cancel.token();

        // Discovery: server list and client info are fetched fresh on
        // every run.
        progress.on_progress(ProgressEvent::PhaseChange(TestPhase::Discovery));
        status.on_status("Retrieving server list...");

        let candidates = self
            .provider
            .fetch_candidates()
            .await
            .map_err(|e| EngineError::new(Stage::Discovery, e))?;
        let client_info = self
            .provider
            .fetch_client_info()
            .await
            .map_err(|e| EngineError::new(Stage::Discovery, e))?;

        status.on_status(&format!(
            "Testing from {} ({})...",
            client_info.isp, client_info.ip
        ));

        self.registry
            .load(candidates)
            .map_err(|e| EngineError::new(Stage::Discovery, e))?;

        let shortlist =
            self.registry.nearest(self.config.preselect, &client_info.location);
        info!(
            "{} candidates, probing the {} nearest",
            self.registry.len(),
            shortlist.len()
        );

        // Probe: rank the shortlist by measured latency.
        progress.on_progress(ProgressEvent::PhaseChange(TestPhase::Probe));
        status.on_status("Selecting best server based on latency...");

        let outcome = self
            .prober
            .probe(shortlist, progress, cancel.clone())
            .await
            .map_err(|e| EngineError::new(Stage::Probe, e))?;
        let best = outcome.best().clone();
        progress.on_progress(ProgressEvent::PhaseComplete(TestPhase::Probe));

        status.on_status(&format!(
            "Hosted by {} ({}) [{:.2} km]: {:.2} ms",
            best.sponsor,
            best.name,
            best.distance_km.unwrap_or(f64::NAN),
            best.latency_ms.unwrap_or(f64::NAN),
        ));

        // Download.
        progress.on_progress(ProgressEvent::PhaseChange(TestPhase::Download));
        status.on_status("Testing download speed...");

        let download = self
            .measurer
            .measure_download(&best, &self.config.download, progress, cancel.clone())
            .await
            .map_err(|e| EngineError::new(Stage::Download, e))?;
        progress.on_progress(ProgressEvent::PhaseComplete(TestPhase::Download));
        status.on_status(&format!("Download: {:.2} Mbps", download.mbps));
        if download.streams_failed > 0 {
            warn!(
                "download finished with {} failed streams",
                download.streams_failed
            );
        }

        // Upload.
        progress.on_progress(ProgressEvent::PhaseChange(TestPhase::Upload));
        status.on_status("Testing upload speed...");

        let upload = self
            .measurer
            .measure_upload(&best, &self.config.upload, progress, cancel.clone())
            .await
            .map_err(|e| EngineError::new(Stage::Upload, e))?;
        progress.on_progress(ProgressEvent::PhaseComplete(TestPhase::Upload));
        status.on_status(&format!("Upload: {:.2} Mbps", upload.mbps));

        // Record: assemble the immutable result and insert it. A
        // cancellation arriving after the transfers discards the run.
        if cancel.is_cancelled() {
            return Err(EngineError::new(
                Stage::Record,
                SpeedTestError::Cancelled,
            ));
        }
        let ping_ms = best
            .latency_ms
            .filter(|latency| latency.is_finite())
            .ok_or_else(|| {
                EngineError::new(Stage::Record, SpeedTestError::NoReachableServer)
            })?;

        let result = TestResult::new(
            best.snapshot(),
            Some(client_info),
            ping_ms,
            download.mbps,
            upload.mbps,
            download.bytes,
            upload.bytes,
            run_start.elapsed(),
        );
        self.history.add(result.clone());

        progress.on_progress(ProgressEvent::PhaseChange(TestPhase::Complete));
        status.on_status("Test complete!");

        Ok(result)
    }
}
