// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Emitter side of the "everyone ready for frame N" handshake.
//!
//! Repeaters that do not use hardware sync broadcast
//! `RepeaterWaitingToStartFrame{N, node}` until the emitter answers with an
//! `EmitterWaitingToStartFrame{N, waiting_on}` that no longer lists them. The
//! emitter blocks in [`FrameStartBarrier::wait_until_all_ready`] until the
//! outstanding set is empty.
//!
//! ```text
//! repeater A                  emitter (frame N, waiting on {A, B})
//!    | Repeater..{N, A}          |
//!    |-------------------------->|  waiting_on = {B}
//!    | Emitter..{N, {B}}         |
//!    |<--------------------------|
//! ```

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::messages::{
    EmitterWaitingToStartFrame, Message, MessageType, RepeaterWaitingToStartFrame,
};
use crate::node::{NodeId, NodeIdBitVector, NodeRole};
use crate::topology::{ClusterTopology, ClusterTopologyEntry, SubscriptionId};
use crate::transport::{
    assert_receives, priority, PreprocessResult, PreprocessorHandle, ReceivedMessage,
    SharedTransport,
};

struct BarrierState {
    frame_index: u64,
    /// Repeaters using network sync, waited on every frame
    must_wait_on: NodeIdBitVector,
    /// Repeaters not ready yet for `frame_index`
    still_waiting_on: NodeIdBitVector,
    /// Last topology generation applied to the sets
    analyzed_generation: u64,
}

struct BarrierShared {
    transport: SharedTransport,
    state: Mutex<BarrierState>,
    condvar: Condvar,
}

/// Tracks which repeaters are ready to start the current frame.
///
/// # Example
///
/// ```ignore
/// let barrier = FrameStartBarrier::new(transport, 0, repeaters, 0, Some(topology));
/// loop {
///     if let Some(late) = barrier.wait_until_all_ready(frame, Duration::from_secs(1)) {
///         barrier.drop_repeaters(late);
///     }
///     frame += 1;
///     barrier.prepare_next_frame(frame);
/// }
/// ```
pub struct FrameStartBarrier {
    shared: Arc<BarrierShared>,
    emitter_node_id: NodeId,
    topology: Option<Arc<ClusterTopology>>,
    subscription: Option<SubscriptionId>,
    preprocessor: PreprocessorHandle,
}

impl FrameStartBarrier {
    /// # Panics
    ///
    /// If the transport does not receive `RepeaterWaitingToStartFrame`.
    pub fn new(
        transport: SharedTransport,
        emitter_node_id: NodeId,
        to_wait_for: NodeIdBitVector,
        first_frame_index: u64,
        topology: Option<Arc<ClusterTopology>>,
    ) -> Self {
        assert_receives(
            &*transport,
            "FrameStartBarrier",
            &[MessageType::RepeaterWaitingToStartFrame],
        );

        let shared = Arc::new(BarrierShared {
            transport: Arc::clone(&transport),
            state: Mutex::new(BarrierState {
                frame_index: first_frame_index,
                must_wait_on: to_wait_for,
                still_waiting_on: to_wait_for,
                analyzed_generation: 0,
            }),
            condvar: Condvar::new(),
        });

        // Topology changes must interrupt a wait right away
        let subscription = topology.as_ref().map(|topology| {
            let weak: Weak<BarrierShared> = Arc::downgrade(&shared);
            topology.subscribe(move || {
                if let Some(shared) = weak.upgrade() {
                    let _state = shared.state.lock();
                    shared.condvar.notify_all();
                }
            })
        });

        let weak: Weak<BarrierShared> = Arc::downgrade(&shared);
        let preprocessor = transport.pipeline().add(
            priority::REPEATER_WAITING_TO_START_FRAME,
            move |received| match weak.upgrade() {
                Some(shared) => shared.preprocess(received),
                None => PreprocessResult::PassThrough,
            },
        );

        Self {
            shared,
            emitter_node_id,
            topology,
            subscription,
            preprocessor,
        }
    }

    /// Frame repeaters are currently reporting for.
    pub fn frame_index(&self) -> u64 {
        self.shared.state.lock().frame_index
    }

    /// Repeaters waited on at the start of every frame.
    pub fn must_wait_on(&self) -> NodeIdBitVector {
        self.shared.state.lock().must_wait_on
    }

    /// Move to `frame_index` and wait again on every network-synced repeater.
    ///
    /// Returns whether anyone is left to wait for.
    ///
    /// # Panics
    ///
    /// If `frame_index` is not the previous frame index plus one.
    pub fn prepare_next_frame(&self, frame_index: u64) -> bool {
        let mut state = self.shared.state.lock();
        assert!(
            frame_index == state.frame_index.wrapping_add(1),
            "non consecutive frame index: previous was {}, new one is {}",
            state.frame_index,
            frame_index
        );
        state.frame_index = frame_index;
        state.still_waiting_on = state.must_wait_on;
        !state.still_waiting_on.is_empty()
    }

    /// Stop waiting for `nodes`, for this frame and every following one.
    pub fn drop_repeaters(&self, nodes: NodeIdBitVector) {
        let mut state = self.shared.state.lock();
        state.must_wait_on.clear_nodes(nodes);
        state.still_waiting_on.clear_nodes(nodes);
        if state.still_waiting_on.is_empty() {
            self.shared.condvar.notify_all();
        }
        log::debug!("[Barrier] dropped repeaters {:?}", nodes);
    }

    /// Block until every repeater is ready to start `frame_index`.
    ///
    /// Returns `None` once all are ready, or the nodes still outstanding when
    /// `timeout` elapses or this node stops being the emitter.
    pub fn wait_until_all_ready(
        &self,
        frame_index: u64,
        timeout: Duration,
    ) -> Option<NodeIdBitVector> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if frame_index < state.frame_index {
                break;
            }
            if frame_index == state.frame_index && state.still_waiting_on.is_empty() {
                return None;
            }

            if let Some(topology) = &self.topology {
                let generation = topology.generation();
                if generation != 0 && generation != state.analyzed_generation {
                    let entries = topology.entries();
                    let still_emitter = entries.iter().any(|entry| {
                        entry.node_id == self.emitter_node_id && entry.role == NodeRole::Emitter
                    });
                    if !still_emitter {
                        log::info!(
                            "[Barrier] node {} is not the emitter anymore, giving up on frame {}",
                            self.emitter_node_id,
                            frame_index
                        );
                        return Some(state.still_waiting_on);
                    }
                    remove_departed_repeaters(&mut state, &entries);
                    state.analyzed_generation = generation;
                    // May have removed the last node we were waiting on
                    continue;
                }
            }

            if Instant::now() >= deadline {
                break;
            }
            self.shared.condvar.wait_until(&mut state, deadline);
        }
        Some(state.still_waiting_on)
    }
}

fn remove_departed_repeaters(state: &mut BarrierState, entries: &[ClusterTopologyEntry]) {
    let present: NodeIdBitVector = entries
        .iter()
        .filter(|entry| entry.role.is_repeater_like())
        .map(|entry| entry.node_id)
        .collect();
    let departed = NodeIdBitVector::from_bits(state.must_wait_on.bits() & !present.bits());
    if !departed.is_empty() {
        log::debug!("[Barrier] repeaters {:?} left the topology", departed);
        state.must_wait_on.clear_nodes(departed);
        state.still_waiting_on.clear_nodes(departed);
    }
}

impl BarrierShared {
    fn preprocess(&self, received: &ReceivedMessage) -> PreprocessResult {
        let Message::RepeaterWaitingToStartFrame(waiting) = received.message() else {
            return PreprocessResult::PassThrough;
        };
        self.on_repeater_waiting(waiting);
        // Never passed through
        PreprocessResult::Stop
    }

    fn on_repeater_waiting(&self, waiting: &RepeaterWaitingToStartFrame) {
        let mut state = self.state.lock();
        if waiting.frame_index == state.frame_index {
            if !waiting.will_use_network_sync_on_next_frame {
                state.must_wait_on.remove(waiting.node_id);
            }
            let was_waiting = state.still_waiting_on.remove(waiting.node_id);
            if state.still_waiting_on.is_empty() {
                self.condvar.notify_all();
            }

            self.send_answer(waiting.frame_index, state.still_waiting_on);
            if !was_waiting {
                self.transport
                    .stats()
                    .record_sent_repeat(MessageType::EmitterWaitingToStartFrame);
            }
        } else if waiting.frame_index < state.frame_index {
            // Late repeater: tell it to go on
            self.send_answer(waiting.frame_index, NodeIdBitVector::EMPTY);
            self.transport
                .stats()
                .record_sent_repeat(MessageType::EmitterWaitingToStartFrame);
        } else {
            panic!(
                "received RepeaterWaitingToStartFrame for frame {} from node {} while gathering status for frame {}",
                waiting.frame_index, waiting.node_id, state.frame_index
            );
        }
    }

    fn send_answer(&self, frame_index: u64, waiting_on: NodeIdBitVector) {
        let answer = EmitterWaitingToStartFrame {
            frame_index,
            waiting_on,
        };
        if let Err(e) = self.transport.send(&answer.into(), &[]) {
            log::warn!("[Barrier] failed to answer for frame {}: {}", frame_index, e);
        }
    }
}

impl Drop for FrameStartBarrier {
    fn drop(&mut self) {
        self.shared.transport.pipeline().remove(self.preprocessor);
        if let (Some(topology), Some(subscription)) = (&self.topology, self.subscription) {
            topology.unsubscribe(subscription);
        }
    }
}
