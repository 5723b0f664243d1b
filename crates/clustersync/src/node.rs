// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node identities and fixed-width node sets.

use crate::config::MAX_NODES;
use std::fmt;

/// Identifier of a cluster member (0..64).
pub type NodeId = u8;

/// Role of a node in the cluster topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    /// Authoritative source of frame data
    Emitter,
    /// Reproduces the frames dictated by the emitter
    Repeater,
    /// Repeater that can be promoted to emitter
    Backup,
    /// Known node that takes no part in the frame protocol
    Unassigned,
}

impl NodeRole {
    /// Repeaters and backups both receive frames and answer surveys.
    #[inline]
    pub fn is_repeater_like(self) -> bool {
        matches!(self, NodeRole::Repeater | NodeRole::Backup)
    }
}

/// Set of [`NodeId`]s stored as a 64-bit mask.
///
/// Used for "who must we wait for" and "who is still waiting". Node ids
/// `>= 64` are a programming error and panic.
///
/// # Example
///
/// ```ignore
/// let mut waiting = NodeIdBitVector::from_nodes(&[1, 3, 9]);
/// waiting.remove(3);
/// assert_eq!(waiting.count(), 2);
/// assert_eq!(waiting.iter().collect::<Vec<_>>(), vec![1, 9]);
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct NodeIdBitVector(u64);

impl NodeIdBitVector {
    /// Empty set.
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub const fn new() -> Self {
        Self(0)
    }

    /// Build from raw mask bits (bit `n` set means node `n` is present).
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn from_nodes(nodes: &[NodeId]) -> Self {
        let mut set = Self::new();
        for &node in nodes {
            set.insert(node);
        }
        set
    }

    #[inline]
    fn mask(node: NodeId) -> u64 {
        assert!(
            usize::from(node) < MAX_NODES,
            "node id {} out of range (max {})",
            node,
            MAX_NODES - 1
        );
        1u64 << node
    }

    /// Add `node`, returns whether it was absent.
    pub fn insert(&mut self, node: NodeId) -> bool {
        let mask = Self::mask(node);
        let was_absent = self.0 & mask == 0;
        self.0 |= mask;
        was_absent
    }

    /// Remove `node`, returns whether it was present.
    pub fn remove(&mut self, node: NodeId) -> bool {
        let mask = Self::mask(node);
        let was_present = self.0 & mask != 0;
        self.0 &= !mask;
        was_present
    }

    #[inline]
    pub fn contains(self, node: NodeId) -> bool {
        self.0 & Self::mask(node) != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of nodes in the set.
    #[inline]
    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Remove every node of `other` from this set.
    pub fn clear_nodes(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Node ids in increasing order.
    pub fn iter(self) -> impl Iterator<Item = NodeId> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let node = bits.trailing_zeros() as NodeId;
            bits &= bits - 1;
            Some(node)
        })
    }
}

impl fmt::Debug for NodeIdBitVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<NodeId> for NodeIdBitVector {
    fn from_iter<I: IntoIterator<Item = NodeId>>(iter: I) -> Self {
        let mut set = Self::new();
        for node in iter {
            set.insert(node);
        }
        set
    }
}
