//! Error types for the measurement engine.
//!
//! Component-level failures are expressed as [`SpeedTestError`] variants;
//! the orchestrator wraps whichever one stopped the run in an
//! [`EngineError`] tagged with the stage it occurred in.

use std::error::Error;
use std::fmt;

/// Exit codes for the binary.
pub mod exit_codes {
    /// Successful execution.
    pub const SUCCESS: i32 = 0;
    /// Network error (discovery failed, no reachable server, transfer died).
    pub const NETWORK_ERROR: i32 = 1;
    /// Invalid configuration or input data.
    pub const CONFIG_ERROR: i32 = 3;
    /// Unknown/unexpected error.
    pub const UNKNOWN_ERROR: i32 = 99;
    /// Run aborted by the caller (128 + SIGINT).
    pub const CANCELLED: i32 = 130;
}

/// Errors raised by individual engine components.
#[derive(Debug)]
pub enum SpeedTestError {
    /// A latitude/longitude pair outside the valid coordinate ranges.
    InvalidLocation { latitude: f64, longitude: f64 },
    /// Two candidate servers shared the same id during a registry load.
    DuplicateServer { id: u64 },
    /// A transfer plan with no chunks to move.
    EmptyTransferPlan,
    /// The caller aborted the run through its cancel handle.
    Cancelled,
    /// Every latency probe failed; no server can be selected.
    NoReachableServer,
    /// The transfer deadline expired before a single byte was confirmed.
    TransferTimeout,
    /// Every transfer stream failed mid-flight.
    TransferAborted,
    /// An external fetch (server list, client info, transport) failed.
    Network(Box<dyn Error + Send + Sync>),
}

impl SpeedTestError {
    /// Wrap an arbitrary transport/fetch failure.
    pub fn network(source: impl Error + Send + Sync + 'static) -> Self {
        SpeedTestError::Network(Box::new(source))
    }

    /// Get the exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            SpeedTestError::InvalidLocation { .. }
            | SpeedTestError::DuplicateServer { .. }
            | SpeedTestError::EmptyTransferPlan => exit_codes::CONFIG_ERROR,
            SpeedTestError::Cancelled => exit_codes::CANCELLED,
            SpeedTestError::NoReachableServer
            | SpeedTestError::TransferTimeout
            | SpeedTestError::TransferAborted
            | SpeedTestError::Network(_) => exit_codes::NETWORK_ERROR,
        }
    }
}

impl fmt::Display for SpeedTestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeedTestError::InvalidLocation { latitude, longitude } => {
                write!(f, "invalid location: ({}, {})", latitude, longitude)
            }
            SpeedTestError::DuplicateServer { id } => {
                write!(f, "duplicate server id {} in candidate list", id)
            }
            SpeedTestError::EmptyTransferPlan => {
                write!(f, "transfer plan contains no chunks to move")
            }
            SpeedTestError::Cancelled => {
                write!(f, "test cancelled")
            }
            SpeedTestError::NoReachableServer => {
                write!(f, "no candidate server answered a latency probe")
            }
            SpeedTestError::TransferTimeout => {
                write!(f, "transfer deadline expired before any byte was confirmed")
            }
            SpeedTestError::TransferAborted => {
                write!(f, "all transfer streams failed mid-flight")
            }
            SpeedTestError::Network(source) => {
                write!(f, "network error: {}", source)
            }
        }
    }
}

impl Error for SpeedTestError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SpeedTestError::Network(source) => {
                Some(source.as_ref() as &(dyn Error + 'static))
            }
            _ => None,
        }
    }
}

/// The stage of a test run, used to tag orchestrator failures and
/// status notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Fetching the server list and client info.
    Discovery,
    /// Concurrent latency probing and best-server selection.
    Probe,
    /// Download throughput measurement.
    Download,
    /// Upload throughput measurement.
    Upload,
    /// Result assembly and history insertion.
    Record,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Discovery => "discovery",
            Stage::Probe => "probe",
            Stage::Download => "download",
            Stage::Upload => "upload",
            Stage::Record => "record",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A component failure wrapped with the run stage it occurred in.
#[derive(Debug)]
pub struct EngineError {
    pub stage: Stage,
    pub source: SpeedTestError,
}

impl EngineError {
    pub fn new(stage: Stage, source: SpeedTestError) -> Self {
        Self { stage, source }
    }

    /// Get the exit code for the underlying error.
    pub fn exit_code(&self) -> i32 {
        self.source.exit_code()
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "test failed during {}: {}", self.stage, self.source)
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}
