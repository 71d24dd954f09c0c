//! Trace identifiers and their X-Trace header encoding.
//!
//! A header is the uppercase hex encoding of
//! `version(1) | task_id(20) | op_id(8) | flags(1)`, 60 characters in total.
//! The task id is fixed for a whole trace; every event gets a fresh op id.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TraceError};

/// Header byte for the current format: version 2, 20-byte task id, 8-byte op id.
pub const HEADER_VERSION: u8 = 0x2B;

/// Task id length in bytes.
pub const TASK_ID_LEN: usize = 20;

/// Op id length in bytes.
pub const OP_ID_LEN: usize = 8;

/// Length of an encoded header in hex characters.
pub const HEADER_LEN: usize = 2 * (1 + TASK_ID_LEN + OP_ID_LEN + 1);

/// Flag bit marking a trace as sampled.
pub const FLAG_SAMPLED: u8 = 0x01;

/// Identifies one trace for its whole lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub [u8; TASK_ID_LEN]);

/// Identifies one event within a trace.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(pub [u8; OP_ID_LEN]);

impl TaskId {
    /// Generate a new task id from the thread-local CSPRNG.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl OpId {
    /// Generate a new op id from the thread-local CSPRNG.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Parse an op id from its 16-character hex form (as found in `Edge` values).
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = [0u8; OP_ID_LEN];
        hex::decode_to_slice(s.trim(), &mut bytes)
            .map_err(|e| TraceError::malformed(format!("op id {s:?}: {e}")))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({self})")
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpId({self})")
    }
}

/// Generate a fresh 20-byte task id.
pub fn new_task_id() -> TaskId {
    TaskId::random()
}

/// Generate a fresh 8-byte op id.
pub fn new_op_id() -> OpId {
    OpId::random()
}

/// The identifier carried by every event and propagated as the X-Trace header.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TraceIdentifier {
    version: u8,
    task_id: TaskId,
    op_id: OpId,
    flags: u8,
}

impl TraceIdentifier {
    /// Build an identifier from its parts.
    pub fn new(task_id: TaskId, op_id: OpId, flags: u8) -> Self {
        Self {
            version: HEADER_VERSION,
            task_id,
            op_id,
            flags,
        }
    }

    /// Start a brand new trace.
    pub fn root(sampled: bool) -> Self {
        Self::new(TaskId::random(), OpId::random(), sampled_flags(0, sampled))
    }

    /// Next event in the same trace: same task, fresh op, same flags.
    pub fn derive_child(&self) -> Self {
        Self {
            op_id: OpId::random(),
            ..*self
        }
    }

    /// Continue a trace received from elsewhere with a locally made sample decision.
    pub fn continue_from(&self, sampled: bool) -> Self {
        Self {
            op_id: OpId::random(),
            flags: sampled_flags(self.flags, sampled),
            ..*self
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn op_id(&self) -> OpId {
        self.op_id
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Whether the sampled bit is set.
    pub fn is_sampled(&self) -> bool {
        self.flags & FLAG_SAMPLED != 0
    }

    /// Encode as the 60-character uppercase hex header.
    pub fn encode(&self) -> String {
        let mut bytes = Vec::with_capacity(HEADER_LEN / 2);
        bytes.push(self.version);
        bytes.extend_from_slice(&self.task_id.0);
        bytes.extend_from_slice(&self.op_id.0);
        bytes.push(self.flags);
        hex::encode_upper(bytes)
    }

    /// Decode a header. Surrounding whitespace is ignored and either hex case is accepted.
    pub fn decode(header: &str) -> Result<Self> {
        let header = header.trim();
        if header.len() != HEADER_LEN {
            return Err(TraceError::malformed(format!(
                "expected {HEADER_LEN} characters, got {}",
                header.len()
            )));
        }

        let mut bytes = [0u8; HEADER_LEN / 2];
        hex::decode_to_slice(header, &mut bytes)
            .map_err(|e| TraceError::malformed(format!("invalid hex: {e}")))?;

        if bytes[0] != HEADER_VERSION {
            return Err(TraceError::malformed(format!(
                "unsupported version {:#04X}",
                bytes[0]
            )));
        }

        let mut task_id = [0u8; TASK_ID_LEN];
        task_id.copy_from_slice(&bytes[1..1 + TASK_ID_LEN]);
        let mut op_id = [0u8; OP_ID_LEN];
        op_id.copy_from_slice(&bytes[1 + TASK_ID_LEN..1 + TASK_ID_LEN + OP_ID_LEN]);

        Ok(Self {
            version: bytes[0],
            task_id: TaskId(task_id),
            op_id: OpId(op_id),
            flags: bytes[HEADER_LEN / 2 - 1],
        })
    }
}

fn sampled_flags(flags: u8, sampled: bool) -> u8 {
    if sampled {
        flags | FLAG_SAMPLED
    } else {
        flags & !FLAG_SAMPLED
    }
}

impl fmt::Display for TraceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Debug for TraceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceIdentifier({self})")
    }
}

impl FromStr for TraceIdentifier {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s)
    }
}

impl TryFrom<String> for TraceIdentifier {
    type Error = TraceError;

    fn try_from(s: String) -> Result<Self> {
        Self::decode(&s)
    }
}

impl From<TraceIdentifier> for String {
    fn from(id: TraceIdentifier) -> Self {
        id.encode()
    }
}
