// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fetching frames back from the repeaters that received them.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::messages::{Message, RetransmitReceivedFrameData, RetransmittedReceivedFrameData};
use crate::node::NodeId;
use crate::pool::{BufferPool, PooledBuffer};
use crate::transport::Transport;

/// Frame being rebuilt from `RetransmittedReceivedFrameData` chunks.
#[derive(Default)]
pub(super) struct FetchAssembly {
    buffer: Option<PooledBuffer>,
    received: HashSet<i32>,
    received_bytes: usize,
}

impl FetchAssembly {
    pub(super) fn is_complete(&self) -> bool {
        self.buffer
            .as_ref()
            .is_some_and(|buffer| self.received_bytes >= buffer.len())
    }

    /// Merge one chunk, `header.data_length` must be positive.
    pub(super) fn consume(
        &mut self,
        header: &RetransmittedReceivedFrameData,
        chunk: &[u8],
        pool: &BufferPool,
    ) {
        if header.datagram_index < 0 || header.datagram_data_offset < 0 {
            log::warn!("[Placeholder] ignoring chunk with negative fields: {:?}", header);
            return;
        }

        let length = header.data_length as usize;
        if self.buffer.as_ref().map(|buffer| buffer.len()) != Some(length) {
            // First chunk, or the repeater holds another version of that frame: start over
            self.buffer = Some(pool.rent(length));
            self.received.clear();
            self.received_bytes = 0;
        }
        if self.received.contains(&header.datagram_index) {
            return;
        }

        let offset = header.datagram_data_offset as usize;
        let Some(target) = self
            .buffer
            .as_mut()
            .and_then(|buffer| buffer.get_mut(offset..offset + chunk.len()))
        else {
            log::warn!(
                "[Placeholder] chunk {} of frame {} out of bounds ({} + {} > {})",
                header.datagram_index,
                header.frame_index,
                offset,
                chunk.len(),
                length
            );
            return;
        };
        target.copy_from_slice(chunk);
        self.received.insert(header.datagram_index);
        self.received_bytes += chunk.len();
    }

    pub(super) fn into_complete(self) -> Option<PooledBuffer> {
        if self.is_complete() {
            self.buffer
        } else {
            None
        }
    }
}

/// Ask each of `candidates` in turn for `frame_index` until one sends it all.
///
/// A candidate silent for `max_idle`, or answering that it does not hold the
/// frame, is skipped. Gives up once every candidate answered that it does not
/// hold the frame, at `deadline`, or when `running` drops.
/// Every other message queued on the transport meanwhile is discarded.
pub(super) fn fetch_frame(
    transport: &dyn Transport,
    frame_index: u64,
    candidates: &[NodeId],
    deadline: Instant,
    max_idle: Duration,
    running: &AtomicBool,
) -> Option<PooledBuffer> {
    if candidates.is_empty() {
        return None;
    }
    let mut assembly = FetchAssembly::default();

    while !assembly.is_complete() && Instant::now() < deadline && running.load(Ordering::Acquire) {
        let mut not_held = 0;
        for &node_id in candidates {
            let request = RetransmitReceivedFrameData {
                node_id,
                frame_index,
            };
            if let Err(e) = transport.send(&request.into(), &[]) {
                log::warn!("[Placeholder] failed to ask node {} for frame {}: {}", node_id, frame_index, e);
                continue;
            }

            let mut idle_deadline = (Instant::now() + max_idle).min(deadline);
            while !assembly.is_complete() {
                let now = Instant::now();
                if now >= idle_deadline {
                    break;
                }
                let Some(received) = transport.receive_timeout(idle_deadline - now) else {
                    continue;
                };
                let Message::RetransmittedReceivedFrameData(header) = received.message() else {
                    continue;
                };
                if header.frame_index != frame_index {
                    continue;
                }
                if header.data_length <= 0 {
                    log::debug!("[Placeholder] node {} does not hold frame {}", node_id, frame_index);
                    not_held += 1;
                    break;
                }

                assembly.consume(header, received.extra_data(), transport.buffer_pool());
                // Node is answering, give it time for the next chunk
                idle_deadline = (Instant::now() + max_idle).min(deadline);
            }

            if assembly.is_complete() {
                log::debug!("[Placeholder] frame {} fetched from node {}", frame_index, node_id);
                break;
            }
        }
        if not_held == candidates.len() {
            log::debug!("[Placeholder] no repeater holds frame {}", frame_index);
            break;
        }
    }
    assembly.into_complete()
}
