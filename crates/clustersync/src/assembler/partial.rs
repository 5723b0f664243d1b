// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reconstruction state of one frame.

use std::time::Instant;

use crate::messages::{FrameData, RetransmitFrameData};
use crate::pool::{BufferPool, PooledBuffer};

/// Marker for "no frame assigned yet".
pub(crate) const UNSET_FRAME: u64 = u64::MAX;

/// Set of received datagram indices, grown 32 bits at a time.
#[derive(Debug, Default)]
pub(crate) struct DatagramBits {
    words: Vec<u32>,
}

impl DatagramBits {
    pub(crate) fn contains(&self, index: usize) -> bool {
        self.words
            .get(index / 32)
            .is_some_and(|word| word & (1 << (index % 32)) != 0)
    }

    pub(crate) fn insert(&mut self, index: usize) {
        let word = index / 32;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (index % 32);
    }

    /// Capacity in bits (multiple of 32).
    pub(crate) fn capacity(&self) -> usize {
        self.words.len() * 32
    }

    pub(crate) fn clear(&mut self) {
        self.words.iter_mut().for_each(|word| *word = 0);
    }
}

/// Reassembly record of one frame index.
///
/// Complete once at least one datagram was merged and no byte is missing.
pub(crate) struct PartialFrame {
    pub(crate) frame_index: u64,
    ordered_reception: bool,
    received: DatagramBits,
    received_count: usize,
    buffer: Option<PooledBuffer>,
    data_length: i32,
    bytes_left: i64,
    last_datagram_index: i32,
    /// End offset of the datagram with the highest index
    last_datagram_data_end: i64,
    last_received_at: Option<Instant>,
    /// Retransmission requests found while merging, sent by the owner
    pub(crate) pending_retransmissions: Vec<RetransmitFrameData>,
}

impl PartialFrame {
    pub(crate) fn new(ordered_reception: bool) -> Self {
        Self {
            frame_index: UNSET_FRAME,
            ordered_reception,
            received: DatagramBits::default(),
            received_count: 0,
            buffer: None,
            data_length: 0,
            bytes_left: 0,
            last_datagram_index: -1,
            last_datagram_data_end: 0,
            last_received_at: None,
            pending_retransmissions: Vec::new(),
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.frame_index != UNSET_FRAME
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.received_count > 0 && self.bytes_left == 0
    }

    pub(crate) fn has_received_something(&self) -> bool {
        self.received_count > 0
    }

    pub(crate) fn data_length(&self) -> i32 {
        self.data_length
    }

    pub(crate) fn last_received_at(&self) -> Option<Instant> {
        self.last_received_at
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_received_at = Some(now);
    }

    /// Forget everything and start over for `frame_index`.
    pub(crate) fn reset(&mut self, frame_index: u64) {
        self.frame_index = frame_index;
        self.received.clear();
        self.received_count = 0;
        self.buffer = None;
        self.data_length = 0;
        self.bytes_left = 0;
        self.last_datagram_index = -1;
        self.last_datagram_data_end = 0;
        self.last_received_at = None;
        self.pending_retransmissions.clear();
    }

    /// Merge one datagram of this frame.
    pub(crate) fn consume(&mut self, header: &FrameData, chunk: &[u8], pool: &BufferPool) {
        debug_assert_eq!(header.frame_index, self.frame_index);
        if header.datagram_index < 0 || header.datagram_data_offset < 0 || header.data_length < 0 {
            log::warn!(
                "[Assembler] ignoring datagram with negative fields for frame {}: {:?}",
                self.frame_index,
                header
            );
            return;
        }
        let datagram_index = header.datagram_index as usize;

        if self.received.contains(datagram_index) {
            return;
        }
        let received_at = Instant::now();

        if self.received_count == 0 {
            self.buffer = Some(pool.rent(header.data_length as usize));
            self.data_length = header.data_length;
            self.bytes_left = i64::from(header.data_length);
        }

        let offset = header.datagram_data_offset as usize;
        let data_end = offset + chunk.len();
        let Some(target) = self
            .buffer
            .as_mut()
            .and_then(|buffer| buffer.get_mut(offset..data_end))
        else {
            log::error!(
                "[Assembler] invalid datagram for frame {}: bytes {} to {} while the frame is {} bytes long",
                self.frame_index,
                offset,
                data_end,
                self.data_length
            );
            return;
        };
        target.copy_from_slice(chunk);

        // With ordered reception a hole means loss, ask right away instead of waiting for the monitor
        if self.ordered_reception && header.datagram_index > self.last_datagram_index + 1 {
            self.pending_retransmissions.push(RetransmitFrameData {
                frame_index: self.frame_index,
                datagram_start: self.last_datagram_index + 1,
                datagram_end_exclusive: header.datagram_index,
            });
        }

        self.received.insert(datagram_index);
        self.received_count += 1;
        self.bytes_left -= chunk.len() as i64;
        if header.datagram_index > self.last_datagram_index {
            self.last_datagram_index = header.datagram_index;
            self.last_datagram_data_end = data_end as i64;
        }
        self.last_received_at = Some(received_at);
    }

    /// Take the assembled buffer and reset for the next use.
    pub(crate) fn take_completed(&mut self) -> PooledBuffer {
        let buffer = self
            .buffer
            .take()
            .unwrap_or_else(|| PooledBuffer::unpooled(Vec::new()));
        let frame_index = self.frame_index;
        self.reset(frame_index);
        buffer
    }

    /// Requests covering every hole below the last received datagram plus the tail.
    ///
    /// When nothing was received, a single request covers the whole frame.
    pub(crate) fn missing_ranges(&self) -> Vec<RetransmitFrameData> {
        let mut requests = Vec::new();
        let mut last_received: i32 = -1;
        for index in 0..=self.last_datagram_index {
            if self.received.contains(index as usize) {
                if index > last_received + 1 {
                    requests.push(RetransmitFrameData {
                        frame_index: self.frame_index,
                        datagram_start: last_received + 1,
                        datagram_end_exclusive: index,
                    });
                }
                last_received = index;
            }
        }

        // Datagram count is unknown, the sender clamps the end
        if self.last_datagram_data_end < i64::from(self.data_length) || self.data_length == 0 {
            requests.push(RetransmitFrameData {
                frame_index: self.frame_index,
                datagram_start: last_received + 1,
                datagram_end_exclusive: i32::MAX,
            });
        }
        requests
    }

    #[cfg(test)]
    pub(crate) fn bits_capacity(&self) -> usize {
        self.received.capacity()
    }
}
