//! Wire messages sent to the collector.
//!
//! Each event becomes one JSON object in one datagram:
//!
//! ```text
//! {"X-Trace":"2B…01","Edge":["…"],"Timestamp_u":1700000000000000,"Layer":"koa-route","Label":"entry"}
//! ```

use serde_json::{Map, Value};

use crate::error::{Result, TraceError};
use crate::event::{Event, KEY_EDGE, KEY_TIMESTAMP, KEY_XTRACE};
use crate::id::{OpId, TraceIdentifier};

/// Largest payload a single UDP datagram can carry.
pub const MAX_MESSAGE_SIZE: usize = 65_507;

/// Serialize an event into its wire form.
pub fn encode(event: &Event) -> Result<Vec<u8>> {
    let mut body = Map::with_capacity(event.info().len() + 3);
    body.insert(KEY_XTRACE.to_string(), Value::String(event.id().encode()));
    if !event.edges().is_empty() {
        let edges = event
            .edges()
            .iter()
            .map(|op| Value::String(op.to_string()))
            .collect();
        body.insert(KEY_EDGE.to_string(), Value::Array(edges));
    }
    body.insert(
        KEY_TIMESTAMP.to_string(),
        Value::from(event.timestamp().timestamp_micros()),
    );
    for (key, value) in event.info() {
        body.insert(key.clone(), value.clone());
    }

    let bytes = serde_json::to_vec(&Value::Object(body))?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(TraceError::transport(format!(
            "message too large: {} bytes (max {MAX_MESSAGE_SIZE})",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// A message as seen by the collector.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub id: TraceIdentifier,
    pub edges: Vec<OpId>,
    pub timestamp_u: Option<i64>,
    /// Every key other than the reserved ones, in wire order.
    pub info: Map<String, Value>,
}

impl ReceivedMessage {
    /// Parse a datagram received from a reporter.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut body: Map<String, Value> = serde_json::from_slice(bytes)
            .map_err(|e| TraceError::malformed(format!("message body: {e}")))?;

        let id = match body.remove(KEY_XTRACE) {
            Some(Value::String(header)) => TraceIdentifier::decode(&header)?,
            _ => return Err(TraceError::malformed("message has no X-Trace")),
        };

        let edges = match body.remove(KEY_EDGE) {
            None => Vec::new(),
            Some(Value::String(op)) => vec![OpId::from_hex(&op)?],
            Some(Value::Array(ops)) => ops
                .iter()
                .map(|op| {
                    op.as_str()
                        .ok_or_else(|| TraceError::malformed("non-string Edge"))
                        .and_then(OpId::from_hex)
                })
                .collect::<Result<_>>()?,
            Some(other) => return Err(TraceError::malformed(format!("bad Edge: {other}"))),
        };

        let timestamp_u = body.remove(KEY_TIMESTAMP).and_then(|v| v.as_i64());

        Ok(Self {
            id,
            edges,
            timestamp_u,
            info: body,
        })
    }

    /// Look up a metadata value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.info.get(key)
    }

    /// Look up a string metadata value.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.info.get(key).and_then(Value::as_str)
    }
}
