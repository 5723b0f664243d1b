// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Change-notifying view of the cluster topology.
//!
//! The topology is computed elsewhere (discovery, election). Components of
//! this crate only read the current entries and subscribe to changes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::node::{NodeId, NodeRole};

/// One node of the cluster as seen by the topology owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterTopologyEntry {
    pub node_id: NodeId,
    pub role: NodeRole,
    /// Node whose rendering this node mirrors, if any
    pub render_node_id: NodeId,
}

impl ClusterTopologyEntry {
    pub fn new(node_id: NodeId, role: NodeRole) -> Self {
        Self {
            node_id,
            role,
            render_node_id: node_id,
        }
    }
}

/// Handle returned by [`ClusterTopology::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// Shared cluster topology.
///
/// `generation()` increases on every [`ClusterTopology::set_entries`];
/// zero means no topology was ever published.
#[derive(Default)]
pub struct ClusterTopology {
    entries: ArcSwapOption<Vec<ClusterTopologyEntry>>,
    generation: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, ChangeCallback)>>,
    next_subscription: AtomicU64,
}

impl ClusterTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Topology already holding `entries` (generation 1).
    pub fn with_entries(entries: Vec<ClusterTopologyEntry>) -> Self {
        let topology = Self::new();
        topology.set_entries(entries);
        topology
    }

    /// Publish a new set of entries and notify subscribers.
    ///
    /// Callbacks run on the calling thread, after the new entries are visible.
    pub fn set_entries(&self, entries: Vec<ClusterTopologyEntry>) {
        self.entries.store(Some(Arc::new(entries)));
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        log::debug!("[Topology] generation {} published", generation);

        // Clone the list so callbacks may (un)subscribe
        let callbacks: Vec<ChangeCallback> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback();
        }
    }

    /// Current entries, empty if nothing was published yet.
    pub fn entries(&self) -> Arc<Vec<ClusterTopologyEntry>> {
        self.entries.load_full().unwrap_or_default()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Role of `node_id`, `None` if it is not part of the topology.
    pub fn role_of(&self, node_id: NodeId) -> Option<NodeRole> {
        self.entries
            .load()
            .as_ref()
            .and_then(|entries| entries.iter().find(|entry| entry.node_id == node_id))
            .map(|entry| entry.role)
    }

    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push((id, Arc::new(callback)));
        id
    }

    /// Returns whether the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }
}

impl std::fmt::Debug for ClusterTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterTopology")
            .field("generation", &self.generation())
            .field("entries", &self.entries())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_empty_topology() {
        let topology = ClusterTopology::new();
        assert_eq!(topology.generation(), 0);
        assert!(topology.entries().is_empty());
        assert_eq!(topology.role_of(1), None);
    }

    #[test]
    fn test_set_entries_bumps_generation() {
        let topology = ClusterTopology::with_entries(vec![
            ClusterTopologyEntry::new(0, NodeRole::Emitter),
            ClusterTopologyEntry::new(1, NodeRole::Repeater),
        ]);
        assert_eq!(topology.generation(), 1);
        assert_eq!(topology.role_of(1), Some(NodeRole::Repeater));

        topology.set_entries(vec![ClusterTopologyEntry::new(0, NodeRole::Emitter)]);
        assert_eq!(topology.generation(), 2);
        assert_eq!(topology.entries().len(), 1);
    }

    #[test]
    fn test_subscribers_notified_until_unsubscribed() {
        let topology = ClusterTopology::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let id = topology.subscribe(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        topology.set_entries(Vec::new());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(topology.unsubscribe(id));
        assert!(!topology.unsubscribe(id));
        topology.set_entries(Vec::new());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
