//! Lamport clock and operation stamps.
//!
//! Every document operation carries an [`OpId`]. Stamps are totally ordered
//! across peers, which gives last-writer-wins map registers and a stable
//! insertion order for concurrent list inserts.

use crate::PeerId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Unique, totally ordered identifier of one document operation.
///
/// Ordering rules:
/// 1. Higher counter wins
/// 2. If counters equal, lexicographically higher node id wins
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpId {
    pub counter: u64,
    pub node_id: PeerId,
}

impl OpId {
    pub fn new(node_id: impl Into<PeerId>, counter: u64) -> Self {
        Self {
            counter,
            node_id: node_id.into(),
        }
    }
}

impl Ord for OpId {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.counter.cmp(&other.counter) {
            Ordering::Equal => self.node_id.cmp(&other.node_id),
            other => other,
        }
    }
}

impl PartialOrd for OpId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.node_id)
    }
}

/// A Lamport clock owned by one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalClock {
    /// Unique identifier for the peer owning the document
    pub node_id: PeerId,
    /// Monotonically increasing counter
    pub counter: u64,
}

impl LogicalClock {
    /// Create a new clock for a node, starting at counter 0.
    pub fn new(node_id: impl Into<PeerId>) -> Self {
        Self {
            node_id: node_id.into(),
            counter: 0,
        }
    }

    /// Increment the clock and return a fresh stamp.
    pub fn tick(&mut self) -> OpId {
        self.counter += 1;
        OpId::new(self.node_id.clone(), self.counter)
    }

    /// Advance past a stamp observed from another peer.
    pub fn observe(&mut self, id: &OpId) {
        self.counter = self.counter.max(id.counter);
    }
}
