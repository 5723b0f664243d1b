// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Emitter side of frame distribution.
//!
//! [`FrameDataSplitter::send_frame`] cuts a frame buffer into `FrameData`
//! datagrams and keeps the last few frames so that `RetransmitFrameData`
//! requests from repeaters can be answered without resending whole frames.
//!
//! # Retransmission
//!
//! ```text
//! repeater                         emitter
//!    |  RetransmitFrameData{f,2,4}    |
//!    |------------------------------->|  frame f in history?
//!    |  FrameData{f, idx 2}           |    yes: resend [2,4) unless sent < 2 ms ago
//!    |<-------------------------------|    no:  warn (silent for f == newest + 1)
//!    |  FrameData{f, idx 3}           |
//!    |<-------------------------------|
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{DEFAULT_RETRANSMIT_HISTORY, MIN_RETRANSMIT_HISTORY, SHORT_RETRANSMISSION_DELAY};
use crate::messages::{FrameData, Message, MessageType, RetransmitFrameData};
use crate::pool::PooledBuffer;
use crate::transport::{
    assert_receives, assert_room_after_header, priority, PreprocessResult, PreprocessorHandle,
    ReceivedMessage, SharedTransport,
};

/// Settings of a [`FrameDataSplitter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitterConfig {
    /// Number of frames kept for retransmission (at least 2)
    pub retransmit_history: usize,
    /// Minimum delay between two sends of the same datagram
    pub short_retransmission_delay: Duration,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            retransmit_history: DEFAULT_RETRANSMIT_HISTORY,
            short_retransmission_delay: SHORT_RETRANSMISSION_DELAY,
        }
    }
}

/// Number of datagrams needed for `len` bytes; an empty frame still takes one.
#[inline]
pub(crate) fn datagram_count(len: usize, max_data_per_message: usize) -> usize {
    len.div_ceil(max_data_per_message).max(1)
}

struct SentFrame {
    frame_index: u64,
    buffer: PooledBuffer,
    /// Last send time of every datagram
    sent_at: Vec<Option<Instant>>,
}

struct SplitterShared {
    transport: SharedTransport,
    max_data_per_message: usize,
    short_retransmission_delay: Duration,
    /// Sent frames, oldest first
    history: Mutex<VecDeque<SentFrame>>,
    history_depth: usize,
}

/// Splits frames into datagrams and answers retransmission requests.
///
/// # Panics
///
/// Construction panics if the history is shorter than 2 frames, if the
/// transport does not receive `RetransmitFrameData` or if its datagrams cannot
/// carry data after a `FrameData` header. Sending a frame whose
/// index does not follow the previous one panics.
pub struct FrameDataSplitter {
    shared: Arc<SplitterShared>,
    preprocessor: PreprocessorHandle,
}

impl FrameDataSplitter {
    pub fn new(transport: SharedTransport) -> Self {
        Self::with_config(transport, SplitterConfig::default())
    }

    pub fn with_config(transport: SharedTransport, config: SplitterConfig) -> Self {
        assert!(
            config.retransmit_history >= MIN_RETRANSMIT_HISTORY,
            "retransmit history must be >= {}, got {}",
            MIN_RETRANSMIT_HISTORY,
            config.retransmit_history
        );
        assert_receives(&*transport, "FrameDataSplitter", &[MessageType::RetransmitFrameData]);
        assert_room_after_header(&*transport, "FrameDataSplitter", FrameData::WIRE_SIZE);

        let max_data_per_message = transport.max_message_size() - FrameData::WIRE_SIZE;
        let shared = Arc::new(SplitterShared {
            transport: Arc::clone(&transport),
            max_data_per_message,
            short_retransmission_delay: config.short_retransmission_delay,
            history: Mutex::new(VecDeque::with_capacity(config.retransmit_history)),
            history_depth: config.retransmit_history,
        });

        let weak: Weak<SplitterShared> = Arc::downgrade(&shared);
        let preprocessor = transport.pipeline().add(
            priority::RETRANSMIT_FRAME_DATA_PROCESSING,
            move |received| match weak.upgrade() {
                Some(shared) => shared.preprocess(received),
                None => PreprocessResult::PassThrough,
            },
        );

        Self {
            shared,
            preprocessor,
        }
    }

    /// Bytes of frame data carried by one datagram.
    pub fn max_data_per_message(&self) -> usize {
        self.shared.max_data_per_message
    }

    /// Index of the last frame sent, if any.
    pub fn last_sent_frame(&self) -> Option<u64> {
        self.shared.history.lock().back().map(|frame| frame.frame_index)
    }

    /// Send one frame to every repeater.
    ///
    /// The buffer is kept for retransmissions and released (returned to its
    /// pool) once it leaves the history.
    ///
    /// # Panics
    ///
    /// If `frame_index` is not the previous frame index plus one.
    pub fn send_frame(&self, frame_index: u64, buffer: impl Into<PooledBuffer>) {
        let buffer = buffer.into();
        let shared = &self.shared;

        // Keep the lock while sending: a retransmission request may arrive before we are done
        let mut history = shared.history.lock();
        if let Some(newest) = history.back() {
            assert!(
                newest.frame_index.wrapping_add(1) == frame_index,
                "non consecutive frame index: previous was {}, new one is {}",
                newest.frame_index,
                frame_index
            );
        }
        if history.len() == shared.history_depth {
            // Evicted buffer goes back to its pool here
            history.pop_front();
        }

        let datagrams = datagram_count(buffer.len(), shared.max_data_per_message);
        history.push_back(SentFrame {
            frame_index,
            buffer,
            sent_at: vec![None; datagrams],
        });

        if let Some(frame) = history.back_mut() {
            for datagram_index in 0..datagrams {
                shared.send_datagram(frame, datagram_index);
            }
        }
        log::trace!("[Splitter] frame {} sent in {} datagrams", frame_index, datagrams);
    }
}

impl SplitterShared {
    /// Send one datagram of `frame` unless it went out very recently.
    ///
    /// Returns whether something was sent.
    fn send_datagram(&self, frame: &mut SentFrame, datagram_index: usize) -> bool {
        let now = Instant::now();
        if let Some(Some(last)) = frame.sent_at.get(datagram_index) {
            if now.duration_since(*last) < self.short_retransmission_delay {
                return false;
            }
        }

        let offset = datagram_index * self.max_data_per_message;
        let end = (offset + self.max_data_per_message).min(frame.buffer.len());
        let chunk = frame.buffer.get(offset..end).unwrap_or(&[]);
        let header = FrameData {
            frame_index: frame.frame_index,
            data_length: frame.buffer.len() as i32,
            datagram_index: datagram_index as i32,
            datagram_data_offset: offset as i32,
        };
        if let Err(e) = self.transport.send(&Message::FrameData(header), chunk) {
            log::warn!(
                "[Splitter] failed to send datagram {} of frame {}: {}",
                datagram_index,
                frame.frame_index,
                e
            );
            return false;
        }
        if let Some(slot) = frame.sent_at.get_mut(datagram_index) {
            *slot = Some(now);
        }
        true
    }

    fn preprocess(&self, received: &ReceivedMessage) -> PreprocessResult {
        let Message::RetransmitFrameData(request) = received.message() else {
            return PreprocessResult::PassThrough;
        };
        self.retransmit(request);
        PreprocessResult::Stop
    }

    fn retransmit(&self, request: &RetransmitFrameData) {
        // Lock held for the whole resend so the buffer cannot leave the history meanwhile
        let mut history = self.history.lock();
        let (Some(oldest), Some(newest)) = (
            history.front().map(|frame| frame.frame_index),
            history.back().map(|frame| frame.frame_index),
        ) else {
            log::debug!(
                "[Splitter] retransmission of frame {} asked before anything was sent",
                request.frame_index
            );
            return;
        };

        if request.frame_index < oldest || request.frame_index > newest {
            // A repeater slightly ahead of us asking for the next frame is not loss
            if request.frame_index != newest.wrapping_add(1) {
                log::warn!(
                    "[Splitter] asked to retransmit frame {} but only frames [{}, {}] are kept, skipping",
                    request.frame_index,
                    oldest,
                    newest
                );
            }
            return;
        }

        let Some(frame) = history
            .iter_mut()
            .find(|frame| frame.frame_index == request.frame_index)
        else {
            log::warn!("[Splitter] no data kept for frame {}", request.frame_index);
            return;
        };

        let datagrams = frame.sent_at.len();
        let start = request.datagram_start.max(0) as usize;
        let end = (request.datagram_end_exclusive.max(0) as usize).min(datagrams);
        for datagram_index in start..end {
            if self.send_datagram(frame, datagram_index) {
                self.transport.stats().record_sent_repeat(MessageType::FrameData);
            }
        }
    }
}

impl Drop for FrameDataSplitter {
    fn drop(&mut self) {
        self.shared.transport.pipeline().remove(self.preprocessor);
    }
}
