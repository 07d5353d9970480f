//! Conflict transformation for concurrent operations.
//!
//! This is a reduced, best-effort rule set rather than full operational
//! transform: operations on non-overlapping paths pass through untouched,
//! and the only real conflict handled is two updates of the identical path,
//! which is resolved last-write-wins by vector clock weight. The losing
//! operation becomes a true no-op: it is dropped, on the client and on the
//! server alike, never rewritten into a delete or an overwrite.

use crate::operation::{OpKind, OpRef, Operation};
use crate::path::Path;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Result of transforming one operation against another.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransformOutcome {
    /// The operation is unaffected and applies as-is.
    Unchanged,
    /// The operation lost a same-path conflict and must be discarded.
    Superseded,
}

/// Decide how `op` must be adjusted given that `against` is also in flight.
///
/// Rules, in order:
/// 1. Paths that do not overlap never conflict.
/// 2. An operation with a later timestamp than `op` does not retroactively
///    change it; whoever holds both simply applies them in order.
/// 3. Two updates of the identical path are tie-broken by clock weight; the
///    lower weight is superseded. Equal weights keep `op`.
/// 4. Everything else (mixed kinds on overlapping paths) passes through.
pub fn transform(op: &Operation, against: &Operation) -> TransformOutcome {
    if !op.path.overlaps(&against.path) {
        return TransformOutcome::Unchanged;
    }

    if against.timestamp > op.timestamp {
        return TransformOutcome::Unchanged;
    }

    if op.kind == OpKind::Update
        && against.kind == OpKind::Update
        && op.path == against.path
        && op.weight() < against.weight()
    {
        return TransformOutcome::Superseded;
    }

    TransformOutcome::Unchanged
}

/// A record of one resolved same-path conflict.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub path: Path,
    pub winner: OpRef,
    pub superseded: OpRef,
    pub winner_weight: u64,
    pub superseded_weight: u64,
    pub resolved_at: i64,
}

/// Applies the transform rules and optionally keeps a history of resolved
/// conflicts for diagnostics.
#[derive(Debug, Default)]
pub struct TransformEngine {
    log_conflicts: bool,
    history: Vec<ConflictRecord>,
}

impl TransformEngine {
    /// Create an engine that resolves conflicts without recording them.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an engine that records every resolved conflict.
    pub fn with_logging() -> Self {
        Self {
            log_conflicts: true,
            history: Vec::new(),
        }
    }

    /// Transform `op` against a single in-flight operation.
    ///
    /// Returns the surviving operation (an untouched clone of `op`), or
    /// `None` when `op` was superseded.
    pub fn transform(&mut self, op: &Operation, against: &Operation) -> Option<Operation> {
        match transform(op, against) {
            TransformOutcome::Unchanged => Some(op.clone()),
            TransformOutcome::Superseded => {
                tracing::debug!(
                    path = %op.path,
                    loser = %op.op_ref(),
                    winner = %against.op_ref(),
                    "operation superseded by heavier concurrent update"
                );
                if self.log_conflicts {
                    self.history.push(ConflictRecord {
                        path: op.path.clone(),
                        winner: against.op_ref(),
                        superseded: op.op_ref(),
                        winner_weight: against.weight(),
                        superseded_weight: op.weight(),
                        resolved_at: Utc::now().timestamp_millis(),
                    });
                }
                None
            }
        }
    }

    /// Fold `op` through the transform against every operation in `others`.
    ///
    /// Returns `None` as soon as any of them supersedes `op`.
    pub fn transform_against_all<'a>(
        &mut self,
        op: &Operation,
        others: impl IntoIterator<Item = &'a Operation>,
    ) -> Option<Operation> {
        let mut current = op.clone();
        for other in others {
            current = self.transform(&current, other)?;
        }
        Some(current)
    }

    /// Conflicts recorded so far (empty unless logging is enabled).
    pub fn history(&self) -> &[ConflictRecord] {
        &self.history
    }

    /// Discard the recorded conflict history.
    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}
