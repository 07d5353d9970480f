//! Vector clocks for causality tracking across collaborators.
//!
//! Every actor keeps one counter per participant it has heard from. Emitting
//! an operation bumps the actor's own counter; receiving one merges the
//! sender's clock in. Two clocks can then be compared to tell whether one
//! operation causally preceded another or whether they were concurrent, and
//! the sum of all counters (`weight`) serves as the deterministic scalar for
//! last-write-wins tie-breaking.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Vector clock mapping actor ids to the highest counter seen from each.
///
/// Actor ids are opaque strings (whatever the authentication layer hands
/// out). Serializes as a plain JSON object, e.g. `{"alice": 3, "bob": 1}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: HashMap<String, u64>,
}

impl VectorClock {
    /// Create a new empty vector clock.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Get the counter for an actor (0 if the actor is unknown).
    pub fn get(&self, actor: &str) -> u64 {
        self.entries.get(actor).copied().unwrap_or(0)
    }

    /// Set the counter for an actor.
    pub fn set(&mut self, actor: &str, counter: u64) {
        self.entries.insert(actor.to_string(), counter);
    }

    /// Increment and return the counter for an actor.
    pub fn increment(&mut self, actor: &str) -> u64 {
        let counter = self.get(actor) + 1;
        self.set(actor, counter);
        counter
    }

    /// Merge another clock into this one (pointwise maximum over the union
    /// of actors).
    pub fn merge(&mut self, other: &VectorClock) {
        for (actor, &counter) in &other.entries {
            if counter > self.get(actor) {
                self.entries.insert(actor.clone(), counter);
            }
        }
    }

    /// Sum of all counters.
    ///
    /// A deterministic scalar used to break ties between concurrent
    /// operations, not a causal proof.
    pub fn weight(&self) -> u64 {
        self.entries.values().sum()
    }

    /// Check if this clock dominates another (every counter >= the other's).
    pub fn dominates(&self, other: &VectorClock) -> bool {
        for (actor, &counter) in &other.entries {
            if self.get(actor) < counter {
                return false;
            }
        }
        true
    }

    /// Check if this clock is concurrent with another (neither dominates).
    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        !self.dominates(other) && !other.dominates(self)
    }

    /// Get all entries in the clock.
    pub fn entries(&self) -> &HashMap<String, u64> {
        &self.entries
    }

    /// Check if the clock contains any entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of actors tracked by this clock.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterate over all (actor, counter) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.entries.iter().map(|(k, &v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
