//! Concurrent chunked transfer measurement.
//!
//! A bounded pool of stream workers moves chunks against the chosen
//! server; every confirmed chunk is reported over a channel to the
//! aggregation loop, which is the single point of serialized state
//! mutation (byte totals, progress emission, deadline handling). The
//! measurement window starts when the pool launches, so the computed
//! throughput reflects aggregate capacity rather than per-stream rates.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};

use crate::cancel::CancelToken;
use crate::client::TransferClient;
use crate::errors::SpeedTestError;
use crate::progress::{ProgressCallback, ProgressEvent, TestPhase};
use crate::registry::Server;

/// Minimum interval between progress emissions. Chunk completions
/// arrive far more often than a subscriber can usefully render.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(150);

const PAYLOAD_PREFIX: &[u8] = b"content1=";
const PAYLOAD_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Chunk schedule for one transfer phase.
#[derive(Debug, Clone)]
pub struct TransferPlan {
    /// Chunk sizes in bytes; the full job list is every size repeated
    /// `repetitions` times, dealt round-robin to the streams.
    pub chunk_sizes: Vec<u64>,
    /// Repetitions of each chunk size.
    pub repetitions: usize,
    /// Number of concurrent stream workers.
    pub streams: usize,
    /// Overall wall-clock budget for the phase.
    pub deadline: Duration,
}

impl TransferPlan {
    /// The flat job list, in dispatch order.
    fn jobs(&self) -> Vec<u64> {
        let mut jobs =
            Vec::with_capacity(self.chunk_sizes.len() * self.repetitions);
        for _ in 0..self.repetitions {
            jobs.extend_from_slice(&self.chunk_sizes);
        }
        jobs
    }

    /// Total bytes the plan would move if every chunk completes.
    pub fn total_bytes(&self) -> u64 {
        self.chunk_sizes.iter().sum::<u64>() * self.repetitions as u64
    }
}

/// Aggregate outcome of one transfer phase.
#[derive(Debug, Clone, Copy)]
pub struct TransferOutcome {
    /// Confirmed bytes across all streams.
    pub bytes: u64,
    /// Wall-clock time from pool launch to last confirmed event.
    pub elapsed: Duration,
    /// Aggregate throughput in Mbps.
    pub mbps: f64,
    /// Streams that errored mid-flight.
    pub streams_failed: usize,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Download,
    Upload,
}

/// Per-worker reports consumed by the aggregation loop.
#[derive(Debug)]
enum StreamEvent {
    /// One chunk confirmed.
    Chunk { bytes: u64 },
    /// Worker drained its job queue.
    Finished,
    /// Worker errored and left the pool; its confirmed bytes stay
    /// counted.
    Failed,
}

/// Drives concurrent chunked transfers and aggregates throughput.
pub struct TransferMeasurer<C> {
    client: Arc<C>,
}

impl<C: TransferClient> TransferMeasurer<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    /// Measure download throughput against `server`.
    pub async fn measure_download(
        &self,
        server: &Server,
        plan: &TransferPlan,
        progress: &dyn ProgressCallback,
        cancel: CancelToken,
    ) -> Result<TransferOutcome, SpeedTestError> {
        self.measure(Direction::Download, server, plan, progress, TestPhase::Download, cancel)
            .await
    }

    /// Measure upload throughput against `server`.
    pub async fn measure_upload(
        &self,
        server: &Server,
        plan: &TransferPlan,
        progress: &dyn ProgressCallback,
        cancel: CancelToken,
    ) -> Result<TransferOutcome, SpeedTestError> {
        self.measure(Direction::Upload, server, plan, progress, TestPhase::Upload, cancel)
            .await
    }

    async fn measure(
        &self,
        direction: Direction,
        server: &Server,
        plan: &TransferPlan,
        progress: &dyn ProgressCallback,
        phase: TestPhase,
        mut cancel: CancelToken,
    ) -> Result<TransferOutcome, SpeedTestError> {
        let jobs = plan.jobs();
        if jobs.is_empty() {
            return Err(SpeedTestError::EmptyTransferPlan);
        }
        let stream_count = plan.streams.min(jobs.len()).max(1);
        let planned_bytes = plan.total_bytes();

        let (event_tx, mut event_rx) = mpsc::channel::<StreamEvent>(64);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut workers = JoinSet::new();

        // The measurement window opens when the pool launches; every
        // stream starts sending immediately.
        let start = Instant::now();
        let deadline = start + plan.deadline;

        for stream_id in 0..stream_count {
            let queue: Vec<u64> = jobs
                .iter()
                .skip(stream_id)
                .step_by(stream_count)
                .copied()
                .collect();

            workers.spawn(run_stream(
                Arc::clone(&self.client),
                server.endpoint.clone(),
                direction,
                queue,
                event_tx.clone(),
                cancel_rx.clone(),
            ));
        }
        drop(event_tx);

        let mut total_bytes = 0u64;
        let mut active = stream_count;
        let mut failed = 0usize;
        let mut deadline_hit = false;
        let mut caller_cancelled = false;
        let mut last_emit: Option<Instant> = None;

        while active > 0 {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(
                        "transfer cancelled with {} bytes confirmed",
                        total_bytes
                    );
                    caller_cancelled = true;
                    break;
                }
                event = timeout_at(deadline, event_rx.recv()) => event,
            };

            match event {
                Ok(Some(StreamEvent::Chunk { bytes })) => {
                    total_bytes += bytes;

                    let now = Instant::now();
                    let due = last_emit
                        .is_none_or(|at| now - at >= PROGRESS_INTERVAL);
                    if due {
                        last_emit = Some(now);
                        progress.on_progress(ProgressEvent::Transfer {
                            phase,
                            fraction: (total_bytes as f64
                                / planned_bytes.max(1) as f64)
                                .min(1.0),
                            bytes: total_bytes,
                            mbps: throughput_mbps(total_bytes, now - start),
                        });
                    }
                }
                Ok(Some(StreamEvent::Finished)) => {
                    active -= 1;
                }
                Ok(Some(StreamEvent::Failed)) => {
                    active -= 1;
                    failed += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(
                        "transfer deadline of {:?} reached with {} bytes confirmed",
                        plan.deadline, total_bytes
                    );
                    deadline_hit = true;
                    break;
                }
            }
        }

        let elapsed = start.elapsed();

        // Stop the pool and wait for every worker; no detached work may
        // survive this call.
        let _ = cancel_tx.send(true);
        event_rx.close();
        while workers.join_next().await.is_some() {}

        if caller_cancelled {
            return Err(SpeedTestError::Cancelled);
        }
        if failed == stream_count {
            return Err(SpeedTestError::TransferAborted);
        }
        if total_bytes == 0 {
            return Err(SpeedTestError::TransferTimeout);
        }

        if deadline_hit {
            debug!(
                "returning partial transfer measurement: {} bytes in {:?}",
                total_bytes, elapsed
            );
        }

        Ok(TransferOutcome {
            bytes: total_bytes,
            elapsed,
            mbps: throughput_mbps(total_bytes, elapsed),
            streams_failed: failed,
        })
    }
}

/// One stream worker: drain the job queue, report every confirmed
/// chunk, exit on first error or on cancellation.
async fn run_stream<C: TransferClient>(
    client: Arc<C>,
    endpoint: String,
    direction: Direction,
    queue: Vec<u64>,
    events: mpsc::Sender<StreamEvent>,
    mut cancel: watch::Receiver<bool>,
) {
    for chunk_bytes in queue {
        if *cancel.borrow() {
            return;
        }

        let transfer = async {
            match direction {
                Direction::Download => {
                    client.fetch_chunk(&endpoint, chunk_bytes).await
                }
                Direction::Upload => {
                    let payload = make_payload(chunk_bytes as usize);
                    client.push_chunk(&endpoint, payload).await
                }
            }
        };

        tokio::select! {
            biased;
            _ = cancel.changed() => return,
            result = transfer => match result {
                Ok(bytes) => {
                    if events
                        .send(StreamEvent::Chunk { bytes })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(err) => {
                    warn!("transfer stream failed on {}: {}", endpoint, err);
                    let _ = events.send(StreamEvent::Failed).await;
                    return;
                }
            },
        }
    }

    let _ = events.send(StreamEvent::Finished).await;
}

/// Aggregate throughput: bytes over wall-clock time, in Mbps.
fn throughput_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let seconds = elapsed.as_secs_f64();
    if seconds <= 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0) / seconds / 1_000_000.0
}

/// Build an upload payload of exactly `size` bytes: a `content1=`
/// prefix followed by a repeated ASCII alphabet.
fn make_payload(size: usize) -> Vec<u8> {
    let mut payload = Vec::with_capacity(size);
    payload.extend_from_slice(&PAYLOAD_PREFIX[..PAYLOAD_PREFIX.len().min(size)]);
    while payload.len() < size {
        let remaining = size - payload.len();
        payload
            .extend_from_slice(&PAYLOAD_ALPHABET[..PAYLOAD_ALPHABET.len().min(remaining)]);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelHandle;
    use crate::geo::Location;
    use crate::progress::NoopCallback;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Token whose handle is gone, so it can never fire.
    fn idle_cancel() -> CancelToken {
        CancelHandle::new().token()
    }

    /// Chunk size the scripted client treats as poison.
    const POISON: u64 = 999;

    /// Scripted transfer client: every chunk of `chunk_delay` size
    /// completes after a fixed delay; `POISON` chunks fail after a
    /// short delay; `hang_after` bounds how many calls ever complete.
    struct MockClient {
        chunk_delay: Duration,
        hang_after: Option<usize>,
        fail_all: bool,
        calls: AtomicUsize,
        payload_prefix_ok: Mutex<bool>,
    }

    impl MockClient {
        fn new(chunk_delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                chunk_delay: Duration::from_millis(chunk_delay_ms),
                hang_after: None,
                fail_all: false,
                calls: AtomicUsize::new(0),
                payload_prefix_ok: Mutex::new(true),
            })
        }

        fn hanging_after(chunk_delay_ms: u64, calls: usize) -> Arc<Self> {
            Arc::new(Self {
                chunk_delay: Duration::from_millis(chunk_delay_ms),
                hang_after: Some(calls),
                fail_all: false,
                calls: AtomicUsize::new(0),
                payload_prefix_ok: Mutex::new(true),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                chunk_delay: Duration::from_millis(50),
                hang_after: None,
                fail_all: true,
                calls: AtomicUsize::new(0),
                payload_prefix_ok: Mutex::new(true),
            })
        }

        async fn transfer(&self, bytes: u64) -> Result<u64, SpeedTestError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);

            if self.fail_all {
                tokio::time::sleep(self.chunk_delay).await;
                return Err(SpeedTestError::network(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset",
                )));
            }

            if self.hang_after.is_some_and(|limit| call >= limit) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }

            if bytes == POISON {
                tokio::time::sleep(Duration::from_millis(100)).await;
                return Err(SpeedTestError::network(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "broken pipe",
                )));
            }

            tokio::time::sleep(self.chunk_delay).await;
            Ok(bytes)
        }
    }

    impl TransferClient for MockClient {
        async fn connect_and_time(
            &self,
            _endpoint: &str,
        ) -> Result<Duration, SpeedTestError> {
            unimplemented!("transfer tests never probe")
        }

        async fn fetch_chunk(
            &self,
            _endpoint: &str,
            bytes: u64,
        ) -> Result<u64, SpeedTestError> {
            self.transfer(bytes).await
        }

        async fn push_chunk(
            &self,
            _endpoint: &str,
            payload: Vec<u8>,
        ) -> Result<u64, SpeedTestError> {
            if !payload.starts_with(PAYLOAD_PREFIX) {
                *self.payload_prefix_ok.lock().unwrap() = false;
            }
            self.transfer(payload.len() as u64).await
        }
    }

    fn server() -> Server {
        Server::new(
            1,
            "http://h.test/speedtest/upload.php",
            "Testville",
            "Example ISP",
            "US",
            Location::new(0.0, 0.0).unwrap(),
        )
    }

    fn plan(
        chunk_sizes: Vec<u64>,
        repetitions: usize,
        streams: usize,
        deadline_secs: u64,
    ) -> TransferPlan {
        TransferPlan {
            chunk_sizes,
            repetitions,
            streams,
            deadline: Duration::from_secs(deadline_secs),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregate_throughput_across_streams() {
        // 4 streams x 4 chunks x 250 KB, each chunk taking 250 ms:
        // 4 MB over a 1 second window.
        let client = MockClient::new(250);
        let measurer = TransferMeasurer::new(client);

        let outcome = measurer
            .measure_download(
                &server(),
                &plan(vec![250_000], 16, 4, 30),
                &NoopCallback,
                idle_cancel(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.bytes, 4_000_000);
        assert!((outcome.elapsed.as_secs_f64() - 1.0).abs() < 0.05);
        assert!((outcome.mbps - 32.0).abs() < 1.0);
        assert_eq!(outcome.streams_failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_failure_does_not_abort_measurement() {
        // Jobs are dealt round-robin across 4 streams; the second
        // stream draws only poison chunks and dies mid-flight.
        let client = MockClient::new(250);
        let measurer = TransferMeasurer::new(client);

        let outcome = measurer
            .measure_download(
                &server(),
                &plan(vec![250_000, POISON, 250_000, 250_000], 2, 4, 30),
                &NoopCallback,
                idle_cancel(),
            )
            .await
            .unwrap();

        // Three surviving streams deliver 2 chunks each; the failed
        // stream's unconfirmed bytes are excluded.
        assert_eq!(outcome.bytes, 1_500_000);
        assert_eq!(outcome.streams_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_bytes_before_deadline_times_out() {
        let client = MockClient::hanging_after(250, 0);
        let measurer = TransferMeasurer::new(client);

        let result = measurer
            .measure_download(
                &server(),
                &plan(vec![250_000], 8, 4, 2),
                &NoopCallback,
                idle_cancel(),
            )
            .await;

        assert!(matches!(result, Err(SpeedTestError::TransferTimeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_returns_partial_measurement() {
        // The first four calls complete in 250 ms, everything after
        // hangs; the 1 s deadline fires with 1 MB confirmed.
        let client = MockClient::hanging_after(250, 4);
        let measurer = TransferMeasurer::new(client);

        let outcome = measurer
            .measure_download(
                &server(),
                &plan(vec![250_000], 16, 4, 1),
                &NoopCallback,
                idle_cancel(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.bytes, 1_000_000);
        assert!((outcome.elapsed.as_secs_f64() - 1.0).abs() < 0.05);
        assert!((outcome.mbps - 8.0).abs() < 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_streams_failing_aborts() {
        let client = MockClient::failing();
        let measurer = TransferMeasurer::new(client);

        let result = measurer
            .measure_download(
                &server(),
                &plan(vec![250_000], 8, 4, 30),
                &NoopCallback,
                idle_cancel(),
            )
            .await;

        assert!(matches!(result, Err(SpeedTestError::TransferAborted)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_counts_acknowledged_payload_bytes() {
        let client = MockClient::new(100);
        let measurer = TransferMeasurer::new(Arc::clone(&client));

        let outcome = measurer
            .measure_upload(
                &server(),
                &plan(vec![32_768, 65_536], 2, 2, 30),
                &NoopCallback,
                idle_cancel(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.bytes, 2 * (32_768 + 65_536));
        assert!(outcome.mbps > 0.0);
        assert!(*client.payload_prefix_ok.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_is_throttled_and_monotonic() {
        struct Recorder(Mutex<Vec<(u64, f64)>>);
        impl ProgressCallback for Recorder {
            fn on_progress(&self, event: ProgressEvent) {
                if let ProgressEvent::Transfer { bytes, fraction, .. } = event {
                    self.0.lock().unwrap().push((bytes, fraction));
                }
            }
        }

        // 100 chunks completing every 10 ms; unthrottled this would be
        // one event per chunk.
        let client = MockClient::new(10);
        let measurer = TransferMeasurer::new(client);
        let recorder = Recorder(Mutex::new(Vec::new()));

        measurer
            .measure_download(
                &server(),
                &plan(vec![10_000], 100, 1, 30),
                &recorder,
                idle_cancel(),
            )
            .await
            .unwrap();

        let events = recorder.0.into_inner().unwrap();
        assert!(!events.is_empty());
        assert!(events.len() < 20, "got {} progress events", events.len());
        for window in events.windows(2) {
            assert!(window[1].0 >= window[0].0);
        }
        for (_, fraction) in &events {
            assert!((0.0..=1.0).contains(fraction));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_transfer_mid_flight() {
        // Chunks take 600 ms each; cancellation lands at 100 ms, well
        // before the first confirmation or the deadline.
        let client = MockClient::new(600);
        let measurer = TransferMeasurer::new(client);
        let handle = CancelHandle::new();

        let server = server();
        let plan = plan(vec![250_000], 16, 4, 30);
        let transfer = measurer.measure_download(
            &server,
            &plan,
            &NoopCallback,
            handle.token(),
        );
        let trigger = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.cancel();
        };

        let (result, ()) = tokio::join!(transfer, trigger);
        assert!(matches!(result, Err(SpeedTestError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_plan_is_rejected() {
        let client = MockClient::new(10);
        let measurer = TransferMeasurer::new(client);

        let no_sizes = measurer
            .measure_download(
                &server(),
                &plan(vec![], 4, 4, 10),
                &NoopCallback,
                idle_cancel(),
            )
            .await;
        assert!(matches!(no_sizes, Err(SpeedTestError::EmptyTransferPlan)));

        let no_repetitions = measurer
            .measure_upload(
                &server(),
                &plan(vec![250_000], 0, 4, 10),
                &NoopCallback,
                idle_cancel(),
            )
            .await;
        assert!(matches!(
            no_repetitions,
            Err(SpeedTestError::EmptyTransferPlan)
        ));
    }

    #[test]
    fn test_make_payload_exact_size_and_prefix() {
        let payload = make_payload(100);
        assert_eq!(payload.len(), 100);
        assert!(payload.starts_with(b"content1="));

        let tiny = make_payload(4);
        assert_eq!(tiny.len(), 4);

        let large = make_payload(32_768);
        assert_eq!(large.len(), 32_768);
    }

    #[test]
    fn test_plan_total_bytes() {
        let plan = plan(vec![100, 200], 3, 2, 10);
        assert_eq!(plan.total_bytes(), 900);
        assert_eq!(plan.jobs().len(), 6);
    }
}
