// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Repeater side of frame distribution.
//!
//! The assembler sits in the transport pipeline and merges `FrameData`
//! datagrams into whole frames. Only complete frames continue to the
//! transport queue, in increasing frame order with no gap:
//!
//! ```text
//!  FrameData{f, idx, off} --> current (f)   --complete--> FrameData{f, len, 0, 0} + buffer
//!                        \--> next (f + 1)                  (queued for the consumer)
//! ```
//!
//! A monitor thread, armed by [`FrameDataAssembler::note_future_need`], asks
//! for the missing datagrams of a frame that stopped progressing.
//!
//! # Example
//!
//! ```ignore
//! let assembler = FrameDataAssembler::new(Arc::clone(&transport), AssemblerConfig::default())?;
//! assembler.note_future_need(frame_index);
//! let frame = consume_until(&*transport, timeout, |m| m.message_type() == MessageType::FrameData);
//! ```

mod partial;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::{
    DEFAULT_FRAME_COMPLETION_DELAY, DEFAULT_RETRANSMIT_HISTORY, SILENT_FRAME_DELAY_MULTIPLIER,
};
use crate::error::Result;
use crate::messages::{
    FrameData, Message, MessageType, RetransmitFrameData, RetransmitReceivedFrameData,
    RetransmittedReceivedFrameData,
};
use crate::node::NodeId;
use crate::pool::PooledBuffer;
use crate::splitter::datagram_count;
use crate::transport::{
    assert_receives, assert_room_after_header, priority, PreprocessResult, PreprocessorHandle,
    ReceivedMessage, SharedTransport,
};

use partial::{PartialFrame, UNSET_FRAME};

/// Settings of a [`FrameDataAssembler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblerConfig {
    /// Datagrams arrive in send order (no reordering on the medium), so a
    /// hole in datagram indices is a loss to repair immediately
    pub ordered_reception: bool,
    /// Node id of this repeater, needed to answer `RetransmitReceivedFrameData`
    pub node_id: Option<NodeId>,
    /// Completed frames kept to answer `RetransmitReceivedFrameData` (0 disables)
    pub retransmit_history: usize,
    /// Silence after which missing datagrams are requested
    pub frame_completion_delay: Duration,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            ordered_reception: true,
            node_id: None,
            retransmit_history: DEFAULT_RETRANSMIT_HISTORY,
            frame_completion_delay: DEFAULT_FRAME_COMPLETION_DELAY,
        }
    }
}

impl AssemblerConfig {
    #[must_use]
    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    #[must_use]
    pub fn with_ordered_reception(mut self, ordered: bool) -> Self {
        self.ordered_reception = ordered;
        self
    }

    #[must_use]
    pub fn with_retransmit_history(mut self, frames: usize) -> Self {
        self.retransmit_history = frames;
        self
    }
}

struct AssemblerState {
    current: PartialFrame,
    next: PartialFrame,
    /// Copies of the last completed frames, oldest first
    completed: VecDeque<(u64, PooledBuffer)>,
    last_completed: Option<u64>,
}

/// Arm/disarm flag of the completion monitor.
struct MonitorSignal {
    armed: Mutex<bool>,
    condvar: Condvar,
}

impl MonitorSignal {
    fn set(&self, armed: bool) {
        let mut guard = self.armed.lock();
        *guard = armed;
        if armed {
            self.condvar.notify_all();
        }
    }
}

struct AssemblerShared {
    transport: SharedTransport,
    node_id: Option<NodeId>,
    retransmit_history: usize,
    state: Mutex<AssemblerState>,
    signal: MonitorSignal,
    running: AtomicBool,
    completion_delay_nanos: AtomicU64,
}

/// Reassembles frames from `FrameData` datagrams.
pub struct FrameDataAssembler {
    shared: Arc<AssemblerShared>,
    preprocessor: PreprocessorHandle,
    /// Answers `RetransmitReceivedFrameData`, only with a node id and a history
    send_back_preprocessor: Option<PreprocessorHandle>,
    monitor: Option<JoinHandle<()>>,
}

impl FrameDataAssembler {
    /// # Panics
    ///
    /// If the transport does not receive `FrameData` (and
    /// `RetransmitReceivedFrameData` when a node id and a history are set).
    /// Sending frames back also needs datagrams larger than a
    /// `RetransmittedReceivedFrameData` header.
    pub fn new(transport: SharedTransport, config: AssemblerConfig) -> Result<Self> {
        Self::build(transport, config, None)
    }

    /// Assembler seeded with a datagram received before it existed.
    pub fn with_first_frame(
        transport: SharedTransport,
        config: AssemblerConfig,
        first: ReceivedMessage,
    ) -> Result<Self> {
        Self::build(transport, config, Some(first))
    }

    fn build(
        transport: SharedTransport,
        config: AssemblerConfig,
        first: Option<ReceivedMessage>,
    ) -> Result<Self> {
        assert_receives(&*transport, "FrameDataAssembler", &[MessageType::FrameData]);
        if config.node_id.is_some() && config.retransmit_history > 0 {
            assert_receives(
                &*transport,
                "FrameDataAssembler",
                &[MessageType::RetransmitReceivedFrameData],
            );
            assert_room_after_header(
                &*transport,
                "FrameDataAssembler",
                RetransmittedReceivedFrameData::WIRE_SIZE,
            );
        }

        let mut state = AssemblerState {
            current: PartialFrame::new(config.ordered_reception),
            next: PartialFrame::new(config.ordered_reception),
            completed: VecDeque::with_capacity(config.retransmit_history),
            last_completed: None,
        };

        if let Some(first) = first {
            if let Message::FrameData(header) = first.message() {
                if !first.extra_data().is_empty() {
                    state.current.reset(header.frame_index);
                    state
                        .current
                        .consume(header, first.extra_data(), transport.buffer_pool());
                }
            }
        }

        let shared = Arc::new(AssemblerShared {
            transport: Arc::clone(&transport),
            node_id: config.node_id,
            retransmit_history: config.retransmit_history,
            state: Mutex::new(state),
            signal: MonitorSignal {
                armed: Mutex::new(false),
                condvar: Condvar::new(),
            },
            running: AtomicBool::new(true),
            completion_delay_nanos: AtomicU64::new(config.frame_completion_delay.as_nanos() as u64),
        });
        {
            let mut state = shared.state.lock();
            let pending = std::mem::take(&mut state.current.pending_retransmissions);
            shared.send_sequence_retransmissions(pending);
        }

        let weak: Weak<AssemblerShared> = Arc::downgrade(&shared);
        let preprocessor =
            transport
                .pipeline()
                .add(priority::FRAME_DATA_PROCESSING, move |received| match weak.upgrade() {
                    Some(shared) => shared.preprocess(received),
                    None => PreprocessResult::PassThrough,
                });
        let send_back_preprocessor = if shared.node_id.is_some() && shared.retransmit_history > 0 {
            let weak: Weak<AssemblerShared> = Arc::downgrade(&shared);
            Some(transport.pipeline().add(
                priority::RECEIVED_FRAME_RETRANSMISSION,
                move |received| match weak.upgrade() {
                    Some(shared) => shared.preprocess_send_back(received),
                    None => PreprocessResult::PassThrough,
                },
            ))
        } else {
            None
        };

        let monitor = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("clustersync-frame-monitor".into())
                .spawn(move || shared.monitor_loop())
        };
        let monitor = match monitor {
            Ok(handle) => handle,
            Err(e) => {
                transport.pipeline().remove(preprocessor);
                if let Some(handle) = send_back_preprocessor {
                    transport.pipeline().remove(handle);
                }
                return Err(e.into());
            }
        };

        Ok(Self {
            shared,
            preprocessor,
            send_back_preprocessor,
            monitor: Some(monitor),
        })
    }

    /// The consumer is about to wait for `frame_index`.
    ///
    /// Arms the completion monitor so missing datagrams get requested.
    pub fn note_future_need(&self, frame_index: u64) {
        let mut state = self.shared.state.lock();
        if !state.current.is_set() {
            state.current.reset(frame_index);
        }
        if frame_index == state.current.frame_index {
            self.shared.signal.set(true);
        } else if frame_index.wrapping_add(1) != state.current.frame_index {
            // frame_index + 1 == current happens when the frame completed before this call
            log::warn!(
                "[Assembler] consumer needs frame {} while the current frame is {}",
                frame_index,
                state.current.frame_index
            );
        }
    }

    /// Index of the newest frame handed to the consumer.
    pub fn last_completed_frame(&self) -> Option<u64> {
        self.shared.state.lock().last_completed
    }

    pub fn frame_completion_delay(&self) -> Duration {
        self.shared.completion_delay()
    }

    pub fn set_frame_completion_delay(&self, delay: Duration) {
        self.shared
            .completion_delay_nanos
            .store(delay.as_nanos() as u64, Ordering::Relaxed);
    }
}

impl Drop for FrameDataAssembler {
    fn drop(&mut self) {
        // Not holding any assembler lock: the receive thread may be waiting on it
        self.shared.transport.pipeline().remove(self.preprocessor);
        if let Some(handle) = self.send_back_preprocessor.take() {
            self.shared.transport.pipeline().remove(handle);
        }
        self.shared.running.store(false, Ordering::Release);
        self.shared.signal.set(true);
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }
    }
}

// ===== Receive path =====

impl AssemblerShared {
    fn completion_delay(&self) -> Duration {
        Duration::from_nanos(self.completion_delay_nanos.load(Ordering::Relaxed))
    }

    fn preprocess(&self, received: &ReceivedMessage) -> PreprocessResult {
        match received.message() {
            Message::FrameData(header) => self.on_frame_data(header, received.extra_data()),
            _ => PreprocessResult::PassThrough,
        }
    }

    fn preprocess_send_back(&self, received: &ReceivedMessage) -> PreprocessResult {
        let Message::RetransmitReceivedFrameData(request) = received.message() else {
            return PreprocessResult::PassThrough;
        };
        self.on_retransmit_received(request);
        PreprocessResult::Stop
    }

    fn on_frame_data(&self, header: &FrameData, chunk: &[u8]) -> PreprocessResult {
        // Nothing to merge, except for an empty frame
        if chunk.is_empty() && header.data_length != 0 {
            return PreprocessResult::Stop;
        }

        let pool = self.transport.buffer_pool();
        let mut state = self.state.lock();
        let state = &mut *state;

        if !state.current.is_set() {
            state.current.reset(header.frame_index);
        }
        if header.frame_index == state.current.frame_index {
            state.current.consume(header, chunk, pool);
            let pending = std::mem::take(&mut state.current.pending_retransmissions);
            self.send_sequence_retransmissions(pending);
        } else if header.frame_index == state.current.frame_index.wrapping_add(1) {
            // Datagrams of the next frame racing ahead of the current one
            if state.next.frame_index != header.frame_index {
                state.next.reset(header.frame_index);
            }
            state.next.consume(header, chunk, pool);
            let pending = std::mem::take(&mut state.next.pending_retransmissions);
            self.send_sequence_retransmissions(pending);
        }

        // Checked even if this datagram did not contribute: the previous one may
        // have completed current while next was already complete
        if !state.current.is_complete() {
            return PreprocessResult::Stop;
        }

        let frame_index = state.current.frame_index;
        let data_length = state.current.data_length();
        let buffer = state.current.take_completed();

        if self.retransmit_history > 0 {
            if state.completed.len() == self.retransmit_history {
                state.completed.pop_front();
            }
            state.completed.push_back((frame_index, pool.rent_copy(&buffer)));
        }
        state.last_completed = Some(frame_index);

        let next_index = frame_index.wrapping_add(1);
        if state.next.frame_index == next_index {
            std::mem::swap(&mut state.current, &mut state.next);
            state.next.reset(UNSET_FRAME);
        } else {
            state.current.reset(next_index);
        }
        self.signal.set(false);

        log::trace!("[Assembler] frame {} complete ({} bytes)", frame_index, data_length);
        PreprocessResult::Replace(ReceivedMessage::new(
            Message::FrameData(FrameData {
                frame_index,
                data_length,
                datagram_index: 0,
                datagram_data_offset: 0,
            }),
            Some(buffer),
        ))
    }

    fn send_sequence_retransmissions(&self, requests: Vec<RetransmitFrameData>) {
        for request in requests {
            log::debug!(
                "[Assembler] sequence gap in frame {}: asking for [{}, {})",
                request.frame_index,
                request.datagram_start,
                request.datagram_end_exclusive
            );
            if let Err(e) = self.transport.send(&request.into(), &[]) {
                log::warn!("[Assembler] failed to request retransmission: {}", e);
            }
            self.transport.stats().record_retransmit_sequence();
        }
    }

    /// Send back a frame we completed to whoever asked (failover backfill).
    fn on_retransmit_received(&self, request: &RetransmitReceivedFrameData) {
        if self.node_id != Some(request.node_id) {
            return;
        }
        let state = self.state.lock();
        let max_chunk = self
            .transport
            .max_message_size()
            .saturating_sub(RetransmittedReceivedFrameData::WIRE_SIZE)
            .max(1);

        let Some((_, buffer)) = state
            .completed
            .iter()
            .find(|(frame_index, _)| *frame_index == request.frame_index)
        else {
            log::debug!(
                "[Assembler] frame {} asked back but not kept anymore",
                request.frame_index
            );
            let not_available = RetransmittedReceivedFrameData {
                frame_index: request.frame_index,
                data_length: -1,
                datagram_index: 0,
                datagram_data_offset: 0,
            };
            if let Err(e) = self.transport.send(&not_available.into(), &[]) {
                log::warn!("[Assembler] failed to answer frame request: {}", e);
            }
            return;
        };

        for datagram_index in 0..datagram_count(buffer.len(), max_chunk) {
            let offset = datagram_index * max_chunk;
            let end = (offset + max_chunk).min(buffer.len());
            let header = RetransmittedReceivedFrameData {
                frame_index: request.frame_index,
                data_length: buffer.len() as i32,
                datagram_index: datagram_index as i32,
                datagram_data_offset: offset as i32,
            };
            if let Err(e) = self.transport.send(&header.into(), &buffer[offset..end]) {
                log::warn!(
                    "[Assembler] failed to send back datagram {} of frame {}: {}",
                    datagram_index,
                    request.frame_index,
                    e
                );
            }
        }
    }
}

// ===== Completion monitor =====

impl AssemblerShared {
    fn monitor_loop(&self) {
        while self.running.load(Ordering::Acquire) {
            {
                let mut armed = self.signal.armed.lock();
                while !*armed {
                    self.signal.condvar.wait(&mut armed);
                }
            }
            if !self.running.load(Ordering::Acquire) {
                break;
            }

            let sleep = self.check_completion(Instant::now());

            let mut armed = self.signal.armed.lock();
            if self.running.load(Ordering::Acquire) {
                self.signal.condvar.wait_for(&mut armed, sleep);
            }
        }
        log::debug!("[Assembler] completion monitor stopped");
    }

    /// Ask for missing datagrams if the current frame stalled; returns how long to wait.
    fn check_completion(&self, now: Instant) -> Duration {
        let base_delay = self.completion_delay();
        let mut state = self.state.lock();
        let current = &mut state.current;
        if !current.is_set() {
            return base_delay;
        }

        let mut delay = base_delay;
        if !current.has_received_something() {
            // Total silence usually means the emitter is not ready yet
            delay *= SILENT_FRAME_DELAY_MULTIPLIER;
            if current.last_received_at().is_none() {
                current.touch(now);
            }
        }

        let last = current.last_received_at().unwrap_or(now);
        let waited = now.saturating_duration_since(last);
        let sleep = if !current.is_complete() && waited >= delay {
            let requests = current.missing_ranges();
            log::debug!(
                "[Assembler] frame {} stalled, sending {} retransmission request(s)",
                current.frame_index,
                requests.len()
            );
            for request in &requests {
                if let Err(e) = self.transport.send(&(*request).into(), &[]) {
                    log::warn!("[Assembler] failed to request retransmission: {}", e);
                }
                self.transport.stats().record_retransmit_idle();
            }
            current.touch(now);
            base_delay
        } else {
            delay.saturating_sub(waited)
        };
        sleep.max(Duration::from_millis(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::capped;
    use crate::transport::LoopbackNetwork;

    #[test]
    fn test_default_config() {
        let config = AssemblerConfig::default();
        assert!(config.ordered_reception);
        assert_eq!(config.node_id, None);
        assert_eq!(config.retransmit_history, 2);
        assert_eq!(config.frame_completion_delay, Duration::from_millis(4));
    }

    #[test]
    fn test_config_builders() {
        let config = AssemblerConfig::default()
            .with_node_id(3)
            .with_ordered_reception(false)
            .with_retransmit_history(0);
        assert_eq!(config.node_id, Some(3));
        assert!(!config.ordered_reception);
        assert_eq!(config.retransmit_history, 0);
    }

    #[test]
    #[should_panic(expected = "FrameDataAssembler requires a maximum message size above 20 bytes")]
    fn test_sending_back_needs_room_for_data() {
        let network = LoopbackNetwork::new();
        let transport = capped(
            &network,
            &[MessageType::FrameData, MessageType::RetransmitReceivedFrameData],
            RetransmittedReceivedFrameData::WIRE_SIZE,
        );
        let _ = FrameDataAssembler::new(transport, AssemblerConfig::default().with_node_id(1));
    }

    #[test]
    fn test_receive_only_accepts_small_datagrams() {
        let network = LoopbackNetwork::new();
        let transport = capped(
            &network,
            &[MessageType::FrameData],
            RetransmittedReceivedFrameData::WIRE_SIZE,
        );
        let assembler = FrameDataAssembler::new(transport, AssemblerConfig::default());
        assert!(assembler.is_ok());
    }

    #[test]
    fn test_silent_frame_sleeps_for_the_long_delay() {
        let network = LoopbackNetwork::new();
        let transport: SharedTransport = Arc::new(
            network
                .create_transport(&[MessageType::FrameData])
                .expect("repeater transport"),
        );
        let assembler =
            FrameDataAssembler::new(transport, AssemblerConfig::default()).expect("assembler");
        assembler.set_frame_completion_delay(Duration::from_millis(20));
        assembler.note_future_need(0);

        // Nothing received: next check 200ms after the frame went silent, not 20ms
        let sleep = assembler.shared.check_completion(Instant::now());
        assert!(sleep > Duration::from_millis(100), "slept only {:?}", sleep);
        assert!(sleep <= Duration::from_millis(200));
    }
}
