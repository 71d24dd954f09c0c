//! Trace events.
//!
//! An event is one recorded point of a trace: its identifier, the op ids it
//! continues from, a timestamp and free-form span metadata.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::id::{OpId, TaskId, TraceIdentifier};
use crate::sampler::SampleDecision;

/// Reserved key holding the encoded identifier.
pub const KEY_XTRACE: &str = "X-Trace";
/// Reserved key holding the op ids this event continues from.
pub const KEY_EDGE: &str = "Edge";
/// Reserved key holding the event timestamp in microseconds.
pub const KEY_TIMESTAMP: &str = "Timestamp_u";

/// Name of the instrumented layer (e.g. "koa-route").
pub const KEY_LAYER: &str = "Layer";
/// Position of the event within its layer: "entry", "exit" or "info".
pub const KEY_LABEL: &str = "Label";
pub const KEY_ERROR_CLASS: &str = "ErrorClass";
pub const KEY_ERROR_MSG: &str = "ErrorMsg";

pub const LABEL_ENTRY: &str = "entry";
pub const LABEL_EXIT: &str = "exit";
pub const LABEL_INFO: &str = "info";

const RESERVED_KEYS: [&str; 3] = [KEY_XTRACE, KEY_EDGE, KEY_TIMESTAMP];

/// Lifecycle of an event within its span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanState {
    Created,
    Entered,
    Ended,
}

/// The part of an event the context store keeps track of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHandle {
    pub id: TraceIdentifier,
    pub decision: SampleDecision,
}

/// A point in a trace.
#[derive(Debug, Clone)]
pub struct Event {
    id: TraceIdentifier,
    edges: Vec<OpId>,
    timestamp: DateTime<Utc>,
    info: Map<String, Value>,
    decision: SampleDecision,
    state: SpanState,
}

impl Event {
    /// Create an event with the given identifier and incoming edges.
    pub fn new(id: TraceIdentifier, edges: Vec<OpId>, decision: SampleDecision) -> Self {
        Self {
            id,
            edges,
            timestamp: Utc::now(),
            info: Map::new(),
            decision,
            state: SpanState::Created,
        }
    }

    /// Create the next event of the trace, linked back to `parent`.
    pub fn child_of(parent: &EventHandle) -> Self {
        Self::new(
            parent.id.derive_child(),
            vec![parent.id.op_id()],
            parent.decision,
        )
    }

    pub fn id(&self) -> &TraceIdentifier {
        &self.id
    }

    pub fn task_id(&self) -> TaskId {
        self.id.task_id()
    }

    pub fn op_id(&self) -> OpId {
        self.id.op_id()
    }

    pub fn edges(&self) -> &[OpId] {
        &self.edges
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn info(&self) -> &Map<String, Value> {
        &self.info
    }

    pub fn decision(&self) -> SampleDecision {
        self.decision
    }

    pub fn is_sampled(&self) -> bool {
        self.decision.sampled
    }

    pub fn state(&self) -> SpanState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SpanState) {
        self.state = state;
    }

    /// The identifier and decision, as stored in a context.
    pub fn handle(&self) -> EventHandle {
        EventHandle {
            id: self.id,
            decision: self.decision,
        }
    }

    /// Link this event to another event it continues from.
    pub fn add_edge(&mut self, op_id: OpId) {
        if !self.edges.contains(&op_id) {
            self.edges.push(op_id);
        }
    }

    /// Set a metadata key. Returns false if the key is reserved.
    ///
    /// Setting an existing key replaces the value and keeps its position.
    pub fn add_info(&mut self, key: impl Into<String>, value: impl Into<Value>) -> bool {
        let key = key.into();
        if RESERVED_KEYS.contains(&key.as_str()) {
            tracing::debug!(key = %key, op_id = %self.id.op_id(), "Ignoring reserved event key");
            return false;
        }
        self.info.insert(key, value.into());
        true
    }

    /// Set several metadata keys.
    pub fn add_all<K, V>(&mut self, metadata: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<Value>,
    {
        for (key, value) in metadata {
            self.add_info(key, value);
        }
    }

    /// Look up a metadata value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.info.get(key)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}
