//! Internet connection measurement engine.
//!
//! Discovers candidate test servers, probes their latency concurrently,
//! measures download and upload throughput over a pool of chunked
//! transfer streams, and keeps a bounded in-memory history of results.
//! Presentation is left to the caller, which observes a run through
//! status and progress callbacks.

pub mod cancel;
pub mod client;
pub mod discovery;
pub mod engine;
pub mod errors;
pub mod geo;
pub mod history;
pub mod probe;
pub mod progress;
pub mod registry;
pub mod results;
pub mod retry;
pub mod stats;
pub mod transfer;
