//! Progress and status notification interfaces.
//!
//! The engine only ever calls out through these interfaces; presentation
//! layers implement them. Callbacks are invoked from worker contexts and
//! must return quickly to avoid skewing measurements.

/// Test phases during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPhase {
    /// Fetching server list and client info
    Discovery,
    /// Running latency probes
    Probe,
    /// Running download streams
    Download,
    /// Running upload streams
    Upload,
    /// Run finished
    Complete,
}

/// Progress events emitted during test execution.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Test phase has changed
    PhaseChange(TestPhase),
    /// A latency probe finished for one server
    ProbeMeasurement {
        server_id: u64,
        /// Measured latency in milliseconds, `f64::INFINITY` on failure
        latency_ms: f64,
        /// Probes finished so far (1-indexed)
        current: usize,
        /// Total number of probes
        total: usize,
    },
    /// Aggregate transfer progress, emitted at a bounded rate
    Transfer {
        phase: TestPhase,
        /// Confirmed bytes over planned bytes, clamped to [0, 1]
        fraction: f64,
        /// Confirmed bytes across all live streams
        bytes: u64,
        /// Instantaneous aggregate throughput in Mbps
        mbps: f64,
    },
    /// Phase finished
    PhaseComplete(TestPhase),
}

/// Callback interface for progress updates.
///
/// Implementations must be non-blocking; the engine delivers events
/// from the aggregation loop and will not buffer on a slow subscriber.
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

/// Callback interface for human-readable status lines.
///
/// Fire-and-forget: the engine ignores anything the subscriber does
/// with the message.
pub trait StatusCallback: Send + Sync {
    fn on_status(&self, message: &str);
}

/// A subscriber that discards all notifications.
pub struct NoopCallback;

impl ProgressCallback for NoopCallback {
    fn on_progress(&self, _event: ProgressEvent) {}
}

impl StatusCallback for NoopCallback {
    fn on_status(&self, _message: &str) {}
}
