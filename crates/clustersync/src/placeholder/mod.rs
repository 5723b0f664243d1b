// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stand-in emitter used while a backup takes over.
//!
//! When the emitter disappears, repeaters may have stopped on different
//! frames. The placeholder brings them back to a common frame before the
//! backup starts emitting:
//!
//! 1. Survey every repeater (`SurveyRepeaters`) each survey interval.
//! 2. Once all repeaters answered, `min`/`max` of their last received frame
//!    tell which frames the laggards miss.
//! 3. Fetch frames `min + 1 ..= max` from repeaters that still hold them
//!    (`RetransmitReceivedFrameData`) and serve them to the laggards
//!    through the usual `RetransmitFrameData` requests.
//! 4. Let repeaters waiting to start `min + 1` go, until `min == max`.
//!
//! # Example
//!
//! ```ignore
//! let placeholder = EmitterPlaceholder::new(topology, transport, PlaceholderConfig::default())?;
//! while !(placeholder.repeaters_synchronized()
//!     && placeholder.survey_stable_since() > Duration::from_millis(200))
//! {
//!     thread::sleep(Duration::from_millis(10));
//! }
//! drop(placeholder); // before creating the new emitter
//! ```

mod fetch;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::{FETCH_FRAMES_TIMESPAN, FETCH_FRAME_MAX_IDLE, SURVEY_INTERVAL};
use crate::error::Result;
use crate::messages::{
    EmitterWaitingToStartFrame, FrameData, Message, MessageType, RepeaterWaitingToStartFrame,
    RepeatersSurveyAnswer, RetransmitFrameData, SurveyRepeaters,
};
use crate::node::{NodeId, NodeIdBitVector};
use crate::pool::PooledBuffer;
use crate::splitter::datagram_count;
use crate::topology::{ClusterTopology, ClusterTopologyEntry, SubscriptionId};
use crate::transport::{
    assert_receives, assert_room_after_header, priority, PreprocessResult, PreprocessorHandle,
    ReceivedMessage, SharedTransport,
};

/// Message types a placeholder transport must receive.
pub const PLACEHOLDER_RECEIVE_TYPES: [MessageType; 4] = [
    MessageType::RetransmitFrameData,
    MessageType::RepeaterWaitingToStartFrame,
    MessageType::RepeatersSurveyAnswer,
    MessageType::RetransmittedReceivedFrameData,
];

/// Timings of an [`EmitterPlaceholder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaceholderConfig {
    /// Interval between two surveys
    pub survey_interval: Duration,
    /// Budget of one pass fetching every missing frame
    pub fetch_timespan: Duration,
    /// Silence after which a repeater is skipped while fetching
    pub fetch_max_idle: Duration,
}

impl Default for PlaceholderConfig {
    fn default() -> Self {
        Self {
            survey_interval: SURVEY_INTERVAL,
            fetch_timespan: FETCH_FRAMES_TIMESPAN,
            fetch_max_idle: FETCH_FRAME_MAX_IDLE,
        }
    }
}

struct PlaceholderState {
    topology_entries: Arc<Vec<ClusterTopologyEntry>>,
    answers: BTreeMap<NodeId, RepeatersSurveyAnswer>,
    last_change: Instant,
    /// Every repeater of the topology answered at least once (latched)
    has_all_answers: bool,
    /// `(min, max)` of the last received frame index over all answers
    survey_range: Option<(u64, u64)>,
    /// Frames fetched from repeaters, kept for the placeholder lifetime
    frames: BTreeMap<u64, Arc<PooledBuffer>>,
}

impl PlaceholderState {
    fn repeater_ids(&self) -> Vec<NodeId> {
        self.topology_entries
            .iter()
            .filter(|entry| entry.role.is_repeater_like())
            .map(|entry| entry.node_id)
            .collect()
    }

    fn is_repeater(&self, node_id: NodeId) -> bool {
        self.topology_entries
            .iter()
            .any(|entry| entry.node_id == node_id && entry.role.is_repeater_like())
    }

    fn update_analysis(&mut self) {
        // An empty topology was not published yet
        if !self.has_all_answers && !self.topology_entries.is_empty() {
            self.has_all_answers = self
                .repeater_ids()
                .iter()
                .all(|node_id| self.answers.contains_key(node_id));
        }
        let min = self.answers.values().map(|a| a.last_received_frame_index).min();
        let max = self.answers.values().map(|a| a.last_received_frame_index).max();
        self.survey_range = min.zip(max);
    }

    fn is_synchronized(&self) -> bool {
        self.has_all_answers && self.survey_range.is_none_or(|(min, max)| min == max)
    }
}

struct PlaceholderShared {
    transport: SharedTransport,
    topology: Arc<ClusterTopology>,
    config: PlaceholderConfig,
    max_data_per_message: usize,
    state: Mutex<PlaceholderState>,
    /// Signaled when all repeaters answered and on shutdown
    wake: Condvar,
    running: AtomicBool,
}

/// Converges repeaters to a common frame while no emitter exists.
pub struct EmitterPlaceholder {
    shared: Arc<PlaceholderShared>,
    preprocessor: PreprocessorHandle,
    subscription: SubscriptionId,
    worker: Option<JoinHandle<()>>,
}

impl EmitterPlaceholder {
    /// # Panics
    ///
    /// If the transport does not receive every [`PLACEHOLDER_RECEIVE_TYPES`].
    pub fn new(
        topology: Arc<ClusterTopology>,
        transport: SharedTransport,
        config: PlaceholderConfig,
    ) -> Result<Self> {
        assert_receives(&*transport, "EmitterPlaceholder", &PLACEHOLDER_RECEIVE_TYPES);
        assert_room_after_header(&*transport, "EmitterPlaceholder", FrameData::WIRE_SIZE);

        let shared = Arc::new(PlaceholderShared {
            transport: Arc::clone(&transport),
            topology: Arc::clone(&topology),
            config,
            max_data_per_message: transport.max_message_size() - FrameData::WIRE_SIZE,
            state: Mutex::new(PlaceholderState {
                topology_entries: Arc::new(Vec::new()),
                answers: BTreeMap::new(),
                last_change: Instant::now(),
                has_all_answers: false,
                survey_range: None,
                frames: BTreeMap::new(),
            }),
            wake: Condvar::new(),
            running: AtomicBool::new(true),
        });

        let weak: Weak<PlaceholderShared> = Arc::downgrade(&shared);
        let preprocessor = transport
            .pipeline()
            .add(priority::EMITTER_PLACEHOLDER, move |received| match weak.upgrade() {
                Some(shared) => shared.preprocess(received),
                None => PreprocessResult::PassThrough,
            });

        let weak: Weak<PlaceholderShared> = Arc::downgrade(&shared);
        let subscription = topology.subscribe(move || {
            if let Some(shared) = weak.upgrade() {
                shared.topology_changed();
            }
        });
        shared.topology_changed();

        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("clustersync-placeholder".into())
                .spawn(move || shared.work_loop())
        };
        let worker = match worker {
            Ok(handle) => handle,
            Err(e) => {
                transport.pipeline().remove(preprocessor);
                topology.unsubscribe(subscription);
                return Err(e.into());
            }
        };
        log::info!("[Placeholder] started");

        Ok(Self {
            shared,
            preprocessor,
            subscription,
            worker: Some(worker),
        })
    }

    /// All repeaters answered and report the same last received frame.
    pub fn repeaters_synchronized(&self) -> bool {
        self.shared.state.lock().is_synchronized()
    }

    /// Time since the survey result last changed (zero until all repeaters answered).
    pub fn survey_stable_since(&self) -> Duration {
        let state = self.shared.state.lock();
        if state.has_all_answers {
            state.last_change.elapsed()
        } else {
            Duration::ZERO
        }
    }

    /// Latest answer of every surveyed repeater, by node id.
    pub fn repeaters_survey_result(&self) -> Vec<RepeatersSurveyAnswer> {
        self.shared.state.lock().answers.values().copied().collect()
    }

    /// Frames fetched from repeaters so far.
    pub fn fetched_frames(&self) -> Vec<u64> {
        self.shared.state.lock().frames.keys().copied().collect()
    }
}

impl Drop for EmitterPlaceholder {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        {
            let _state = self.shared.state.lock();
            self.shared.wake.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.shared.transport.pipeline().remove(self.preprocessor);
        self.shared.topology.unsubscribe(self.subscription);
        log::info!("[Placeholder] stopped");
    }
}

// ===== Work thread =====

impl PlaceholderShared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn work_loop(&self) {
        while self.is_running() {
            let next_survey = Instant::now() + self.config.survey_interval;

            if let Err(e) = self.transport.send(&SurveyRepeaters.into(), &[]) {
                log::warn!("[Placeholder] failed to send survey: {}", e);
            }

            let has_all_answers = {
                let mut state = self.state.lock();
                if !state.has_all_answers && self.is_running() {
                    self.wake.wait_until(&mut state, next_survey);
                }
                state.has_all_answers
            };
            if !has_all_answers {
                continue;
            }
            if !self.is_running() {
                break;
            }

            self.fetch_missing_frames();

            // Repeaters are served by the preprocessor, just watch progress
            let mut state = self.state.lock();
            if self.is_running() {
                self.wake.wait_until(&mut state, next_survey);
            }
        }
        log::debug!("[Placeholder] work thread stopped");
    }

    fn fetch_missing_frames(&self) {
        let (to_fetch, candidates) = {
            let state = self.state.lock();
            let Some((min, max)) = state.survey_range else {
                return;
            };
            let to_fetch: Vec<u64> = (min.saturating_add(1)..=max)
                .filter(|frame_index| !state.frames.contains_key(frame_index))
                .collect();
            (to_fetch, state.repeater_ids())
        };
        if to_fetch.is_empty() {
            return;
        }

        let deadline = Instant::now() + self.config.fetch_timespan;
        for frame_index in to_fetch {
            let fetched = fetch::fetch_frame(
                &*self.transport,
                frame_index,
                &candidates,
                deadline,
                self.config.fetch_max_idle,
                &self.running,
            );
            match fetched {
                Some(buffer) => {
                    self.state.lock().frames.insert(frame_index, Arc::new(buffer));
                }
                None => log::debug!("[Placeholder] could not fetch frame {} this pass", frame_index),
            }
        }
    }

    fn topology_changed(&self) {
        let entries = self.topology.entries();
        let mut state = self.state.lock();
        state.topology_entries = entries;

        let stale: Vec<NodeId> = state
            .answers
            .keys()
            .copied()
            .filter(|node_id| !state.is_repeater(*node_id))
            .collect();
        for node_id in &stale {
            state.answers.remove(node_id);
        }
        if !stale.is_empty() {
            log::debug!("[Placeholder] dropped survey answers of {:?}", stale);
            state.last_change = Instant::now();
        }
        // A node leaving may be the last one we were missing
        state.update_analysis();
        if state.has_all_answers {
            self.wake.notify_all();
        }
    }
}

// ===== Receive path =====

impl PlaceholderShared {
    fn preprocess(&self, received: &ReceivedMessage) -> PreprocessResult {
        match received.message() {
            Message::RetransmitFrameData(request) => {
                self.serve_retransmission(request);
                PreprocessResult::Stop
            }
            Message::RepeaterWaitingToStartFrame(waiting) => {
                self.on_repeater_waiting(waiting);
                PreprocessResult::Stop
            }
            Message::RepeatersSurveyAnswer(answer) => {
                self.on_survey_answer(answer);
                PreprocessResult::Stop
            }
            // RetransmittedReceivedFrameData is consumed by the fetching work thread
            _ => PreprocessResult::PassThrough,
        }
    }

    fn serve_retransmission(&self, request: &RetransmitFrameData) {
        let Some(frame) = self.state.lock().frames.get(&request.frame_index).cloned() else {
            return;
        };

        let datagrams = datagram_count(frame.len(), self.max_data_per_message);
        let start = request.datagram_start.max(0) as usize;
        let end = (request.datagram_end_exclusive.max(0) as usize).min(datagrams);
        for datagram_index in start..end {
            let offset = datagram_index * self.max_data_per_message;
            let chunk_end = (offset + self.max_data_per_message).min(frame.len());
            let header = FrameData {
                frame_index: request.frame_index,
                data_length: frame.len() as i32,
                datagram_index: datagram_index as i32,
                datagram_data_offset: offset as i32,
            };
            if let Err(e) = self.transport.send(&header.into(), &frame[offset..chunk_end]) {
                log::warn!(
                    "[Placeholder] failed to resend datagram {} of frame {}: {}",
                    datagram_index,
                    request.frame_index,
                    e
                );
            }
            self.transport.stats().record_sent_repeat(MessageType::FrameData);
        }
    }

    fn on_repeater_waiting(&self, waiting: &RepeaterWaitingToStartFrame) {
        let next_frame = {
            let state = self.state.lock();
            if !state.has_all_answers {
                // Nobody moves before we know where everyone is
                return;
            }
            match state.survey_range {
                Some((min, _)) if waiting.frame_index == min.wrapping_add(1) => waiting.frame_index,
                _ => return,
            }
        };

        let answer = EmitterWaitingToStartFrame {
            frame_index: next_frame,
            waiting_on: NodeIdBitVector::EMPTY,
        };
        if let Err(e) = self.transport.send(&answer.into(), &[]) {
            log::warn!("[Placeholder] failed to release frame {}: {}", next_frame, e);
        }
    }

    fn on_survey_answer(&self, answer: &RepeatersSurveyAnswer) {
        let mut state = self.state.lock();
        if !state.is_repeater(answer.node_id) {
            log::debug!(
                "[Placeholder] ignoring survey answer of node {} (not a repeater)",
                answer.node_id
            );
            return;
        }
        if state.answers.get(&answer.node_id) == Some(answer) {
            return;
        }

        state.answers.insert(answer.node_id, *answer);
        state.last_change = Instant::now();
        let had_all = state.has_all_answers;
        state.update_analysis();
        if state.has_all_answers && !had_all {
            log::debug!("[Placeholder] every repeater answered the survey");
            self.wake.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeRole;
    use crate::transport::testing::capped;
    use crate::transport::LoopbackNetwork;

    fn answer(node_id: NodeId, last: u64) -> RepeatersSurveyAnswer {
        RepeatersSurveyAnswer {
            node_id,
            ip_address_bytes: 0,
            last_received_frame_index: last,
            still_use_network_sync: true,
        }
    }

    fn state(entries: Vec<ClusterTopologyEntry>) -> PlaceholderState {
        PlaceholderState {
            topology_entries: Arc::new(entries),
            answers: BTreeMap::new(),
            last_change: Instant::now(),
            has_all_answers: false,
            survey_range: None,
            frames: BTreeMap::new(),
        }
    }

    #[test]
    fn test_analysis_waits_for_every_repeater() {
        let mut state = state(vec![
            ClusterTopologyEntry::new(0, NodeRole::Emitter),
            ClusterTopologyEntry::new(1, NodeRole::Repeater),
            ClusterTopologyEntry::new(2, NodeRole::Backup),
        ]);
        state.answers.insert(1, answer(1, 10));
        state.update_analysis();
        assert!(!state.has_all_answers);
        assert!(!state.is_synchronized());

        state.answers.insert(2, answer(2, 12));
        state.update_analysis();
        assert!(state.has_all_answers);
        assert_eq!(state.survey_range, Some((10, 12)));
        assert!(!state.is_synchronized());

        state.answers.insert(1, answer(1, 12));
        state.update_analysis();
        assert!(state.is_synchronized());
    }

    #[test]
    fn test_unassigned_nodes_not_surveyed() {
        let state = state(vec![
            ClusterTopologyEntry::new(1, NodeRole::Repeater),
            ClusterTopologyEntry::new(5, NodeRole::Unassigned),
        ]);
        assert_eq!(state.repeater_ids(), vec![1]);
        assert!(!state.is_repeater(5));
    }

    #[test]
    #[should_panic(expected = "EmitterPlaceholder requires a maximum message size above 20 bytes")]
    fn test_rejects_transport_without_room_for_data() {
        let network = LoopbackNetwork::new();
        let transport = capped(&network, &PLACEHOLDER_RECEIVE_TYPES, FrameData::WIRE_SIZE);
        let topology = Arc::new(ClusterTopology::new());
        let _ = EmitterPlaceholder::new(topology, transport, PlaceholderConfig::default());
    }

    #[test]
    fn test_default_config() {
        let config = PlaceholderConfig::default();
        assert_eq!(config.survey_interval, Duration::from_millis(50));
        assert_eq!(config.fetch_timespan, Duration::from_millis(250));
        assert_eq!(config.fetch_max_idle, Duration::from_millis(25));
    }
}
