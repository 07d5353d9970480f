//! Path-addressed operations and the append-only operation log.
//!
//! An [`Operation`] is the atomic unit of change: one mutation of the state
//! tree at a dot-delimited path, stamped with the emitting actor, a wall
//! clock timestamp and the actor's vector clock. Operations are immutable
//! once broadcast; conflict transformation produces new operations rather
//! than editing existing ones.
//!
//! Wire format uses camelCase field names (`oldValue`, `userId`,
//! `vectorClock`) and a lowercase `type` tag, so a serialized operation
//! looks like:
//!
//! ```json
//! {
//!   "type": "update",
//!   "path": "nodes.3.position",
//!   "value": {"x": 10, "y": 20},
//!   "timestamp": 1700000000000,
//!   "userId": "alice",
//!   "vectorClock": {"alice": 4, "bob": 2}
//! }
//! ```

use crate::clock::VectorClock;
use crate::path::Path;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// The kind of mutation an operation performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Insert,
    Update,
    Delete,
    /// Declared for wire compatibility; the reducer rejects it because a
    /// single-path record cannot carry both a source and a target.
    Move,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
            OpKind::Move => "move",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An atomic, path-addressed state change with causal metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(rename = "type")]
    pub kind: OpKind,
    pub path: Path,
    /// New payload at the path (absent for deletes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Previous payload at the path, when the emitter knew it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    /// Wall-clock milliseconds at creation. A secondary ordering hint, not
    /// the causality source of truth.
    pub timestamp: i64,
    /// Originating actor.
    pub user_id: String,
    /// Causal history known to the actor at emission time.
    pub vector_clock: VectorClock,
}

impl Operation {
    /// The logical identity of this operation: the emitting actor plus that
    /// actor's own counter at emission time. Two broadcasts of the same
    /// operation share an [`OpRef`], which is what duplicate suppression
    /// keys on.
    pub fn op_ref(&self) -> OpRef {
        OpRef {
            user_id: self.user_id.clone(),
            seq: self.vector_clock.get(&self.user_id),
        }
    }

    /// Tie-break scalar of the attached clock.
    pub fn weight(&self) -> u64 {
        self.vector_clock.weight()
    }
}

/// A partial operation as produced by the edit layer, before the session
/// stamps it with actor, time and clock.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationDraft {
    #[serde(rename = "type")]
    pub kind: OpKind,
    pub path: Path,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
}

impl OperationDraft {
    pub fn insert(path: impl Into<Path>, value: Value) -> Self {
        Self {
            kind: OpKind::Insert,
            path: path.into(),
            value: Some(value),
            old_value: None,
        }
    }

    pub fn update(path: impl Into<Path>, value: Value) -> Self {
        Self {
            kind: OpKind::Update,
            path: path.into(),
            value: Some(value),
            old_value: None,
        }
    }

    pub fn delete(path: impl Into<Path>) -> Self {
        Self {
            kind: OpKind::Delete,
            path: path.into(),
            value: None,
            old_value: None,
        }
    }

    /// Attach the previous payload for UI attribution and undo.
    pub fn with_old_value(mut self, old_value: Value) -> Self {
        self.old_value = Some(old_value);
        self
    }

    /// Stamp the draft into a full operation.
    pub fn into_operation(
        self,
        user_id: impl Into<String>,
        vector_clock: VectorClock,
        timestamp: i64,
    ) -> Operation {
        Operation {
            kind: self.kind,
            path: self.path,
            value: self.value,
            old_value: self.old_value,
            timestamp,
            user_id: user_id.into(),
            vector_clock,
        }
    }
}

/// Logical operation identity: `(userId, vectorClock[userId])`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpRef {
    pub user_id: String,
    pub seq: u64,
}

impl fmt::Display for OpRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_id, self.seq)
    }
}

/// Append-only log of operations for one resource.
///
/// Entries are kept in arrival order and never edited. Duplicate broadcasts
/// (same [`OpRef`]) are dropped. The log tracks the merged clock of
/// everything it has seen.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OperationLog {
    ops: Vec<Operation>,
    #[serde(skip)]
    index: HashMap<OpRef, usize>,
    clock: VectorClock,
}

impl OperationLog {
    /// Create a new empty operation log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation. Returns false (and keeps the log unchanged)
    /// when the operation was already present.
    pub fn append(&mut self, op: Operation) -> bool {
        let op_ref = op.op_ref();
        if self.index.contains_key(&op_ref) {
            return false;
        }

        if op_ref.seq > self.clock.get(&op_ref.user_id) {
            self.clock.set(&op_ref.user_id, op_ref.seq);
        }

        self.index.insert(op_ref, self.ops.len());
        self.ops.push(op);
        true
    }

    /// Check whether an operation is already recorded.
    pub fn contains(&self, op_ref: &OpRef) -> bool {
        self.index.contains_key(op_ref)
    }

    /// Look up an operation by its logical identity.
    pub fn get(&self, op_ref: &OpRef) -> Option<&Operation> {
        self.index.get(op_ref).map(|&idx| &self.ops[idx])
    }

    /// All operations in arrival order.
    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    /// Operations with a timestamp strictly greater than `after`, in
    /// arrival order. This is how reconciliation catches a client up.
    pub fn ops_after(&self, after: i64) -> Vec<&Operation> {
        self.ops.iter().filter(|op| op.timestamp > after).collect()
    }

    /// The highest timestamp recorded, if any.
    pub fn latest_timestamp(&self) -> Option<i64> {
        self.ops.iter().map(|op| op.timestamp).max()
    }

    /// Merged clock of every recorded operation.
    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.ops.iter()
    }

    /// Rebuild the duplicate-suppression index. Required after
    /// deserializing, since the index is not part of the wire form.
    pub fn rebuild_index(&mut self) {
        self.index.clear();
        for (idx, op) in self.ops.iter().enumerate() {
            self.index.insert(op.op_ref(), idx);
        }
    }
}
