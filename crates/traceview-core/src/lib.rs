//! Tracing core for the TraceView agent.
//!
//! This crate follows one logical request across asynchronous continuations
//! and reports its events to a local collector:
//!
//! - **Identifiers**: `TraceIdentifier` and its 60-character X-Trace header encoding
//! - **Context**: task-local "current event" with explicit propagation across spawns and callbacks
//! - **Sampler**: per-trace sample decisions driven by `TraceMode` and rate
//! - **Reporter**: fire-and-forget JSON datagrams over UDP
//! - **Tracer**: the hook API probes call (`create_event`, `report_entry`, `report_exit`)
//!
//! # Usage
//!
//! ```rust,no_run
//! use traceview_core::{Tracer, TracerConfig, context};
//!
//! #[tokio::main]
//! async fn main() {
//!     let tracer = Tracer::from_config(&TracerConfig::default()).unwrap_or_else(|_| Tracer::disabled());
//!
//!     let inbound = Some("2B...");
//!     tracer
//!         .instrument_request("http", inbound, async {
//!             // Continuations keep the request's position.
//!             context::spawn(async { /* ... */ }).await.ok();
//!
//!             tracer.instrument("db", async { /* query */ }).await;
//!         })
//!         .await;
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod id;
pub mod message;
pub mod reporter;
pub mod sampler;
pub mod tracer;

// Re-export main types
pub use config::{ConfigValidationError, ReporterConfig, TracerConfig};
pub use context::Context;
pub use error::{Result, TraceError};
pub use event::{Event, EventHandle, SpanState};
pub use id::{OpId, TaskId, TraceIdentifier, new_op_id, new_task_id};
pub use message::ReceivedMessage;
pub use reporter::{
    MemoryTransport, NullTransport, Reporter, ReporterStats, Transport, UdpTransport,
};
pub use sampler::{
    Inbound, MAX_SAMPLE_RATE, SampleDecision, SampleSource, Sampler, TraceMode, should_sample,
};
pub use tracer::{
    NO_METADATA, Tracer, create_event, current, install, report_entry, report_exit, tracer,
};
