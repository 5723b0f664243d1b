// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Receive-side state shared by every transport implementation.

use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use super::{Pipeline, ReceivedMessage};
use crate::error::{Error, Result};
use crate::messages::{Message, MessageType};
use crate::pool::BufferPool;
use crate::stats::NetworkStatistics;

/// Decoding, filtering, preprocessing and queueing of received datagrams.
pub(crate) struct Inbox {
    receive_types: Vec<MessageType>,
    max_message_size: usize,
    pipeline: Pipeline,
    stats: NetworkStatistics,
    pool: BufferPool,
    queue_tx: Sender<ReceivedMessage>,
    queue_rx: Receiver<ReceivedMessage>,
    tag: &'static str,
}

impl Inbox {
    pub(crate) fn new(tag: &'static str, receive_types: &[MessageType], max_message_size: usize) -> Self {
        let (queue_tx, queue_rx) = channel::unbounded();
        let mut receive_types = receive_types.to_vec();
        receive_types.sort();
        receive_types.dedup();
        Self {
            receive_types,
            max_message_size,
            pipeline: Pipeline::new(),
            stats: NetworkStatistics::new(),
            pool: BufferPool::new(),
            queue_tx,
            queue_rx,
            tag,
        }
    }

    pub(crate) fn receive_types(&self) -> &[MessageType] {
        &self.receive_types
    }

    pub(crate) fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub(crate) fn stats(&self) -> &NetworkStatistics {
        &self.stats
    }

    pub(crate) fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub(crate) fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Encode `message` and `extra` into a datagram, counting it as sent.
    pub(crate) fn encode_outgoing(&self, message: &Message, extra: &[u8]) -> Result<Vec<u8>> {
        let size = message.header_len() + extra.len();
        if size > self.max_message_size {
            return Err(Error::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        let mut datagram = Vec::with_capacity(size + 1);
        message.encode_into(extra, &mut datagram);
        self.stats.record_sent(message.message_type());

        #[cfg(feature = "trace-messages")]
        log::trace!("[{}] send {:?} (+{} bytes)", self.tag, message, extra.len());

        Ok(datagram)
    }

    /// Handle one received datagram (called on the receive thread).
    pub(crate) fn deliver(&self, datagram: &[u8]) {
        let (message, extra_start) = match Message::decode(datagram) {
            Ok(decoded) => decoded,
            // Message types of other cluster services share the group
            Err(Error::UnknownMessageType(ty)) => {
                log::trace!("[{}] ignoring message type {}", self.tag, ty);
                return;
            }
            Err(e) => {
                log::warn!("[{}] dropping malformed datagram: {}", self.tag, e);
                return;
            }
        };

        let ty = message.message_type();
        if self.receive_types.binary_search(&ty).is_err() {
            return;
        }
        self.stats.record_received(ty);

        #[cfg(feature = "trace-messages")]
        log::trace!("[{}] received {:?}", self.tag, message);

        let extra = &datagram[extra_start..];
        let extra = if extra.is_empty() {
            None
        } else {
            Some(self.pool.rent_copy(extra))
        };

        if let Some(accepted) = self.pipeline.process(ReceivedMessage::new(message, extra)) {
            // Receiver lives in self, send only fails if we are being torn down
            let _ = self.queue_tx.send(accepted);
        }
    }

    pub(crate) fn receive_timeout(&self, timeout: Duration) -> Option<ReceivedMessage> {
        match self.queue_rx.recv_timeout(timeout) {
            Ok(message) => Some(message),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub(crate) fn try_receive(&self) -> Option<ReceivedMessage> {
        self.queue_rx.try_recv().ok()
    }

    pub(crate) fn received_count(&self) -> usize {
        self.queue_rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{FrameData, RetransmitFrameData, SurveyRepeaters};
    use crate::transport::PreprocessResult;

    fn datagram(message: Message, extra: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        message.encode_into(extra, &mut bytes);
        bytes
    }

    #[test]
    fn test_deliver_queues_accepted_types() {
        let inbox = Inbox::new("Test", &[MessageType::FrameData], 1399);
        let header = FrameData {
            frame_index: 3,
            data_length: 4,
            datagram_index: 0,
            datagram_data_offset: 0,
        };
        inbox.deliver(&datagram(header.into(), &[1, 2, 3, 4]));
        inbox.deliver(&datagram(SurveyRepeaters.into(), &[]));

        assert_eq!(inbox.received_count(), 1);
        let received = inbox.try_receive().expect("frame data queued");
        assert_eq!(*received.message(), Message::FrameData(header));
        assert_eq!(received.extra_data(), &[1, 2, 3, 4]);

        // Filtered types are not counted
        let lifetime = inbox.stats().lifetime();
        assert_eq!(lifetime.get(MessageType::FrameData).received, 1);
        assert_eq!(lifetime.get(MessageType::SurveyRepeaters).received, 0);
    }

    #[test]
    fn test_malformed_datagrams_are_dropped() {
        let inbox = Inbox::new("Test", &MessageType::ALL, 1399);
        inbox.deliver(&[]);
        inbox.deliver(&[MessageType::FrameData as u8, 1, 2]);
        inbox.deliver(&[200, 0, 0, 0]);
        assert_eq!(inbox.received_count(), 0);
    }

    #[test]
    fn test_pipeline_consumes_before_queue() {
        let inbox = Inbox::new("Test", &[MessageType::RetransmitFrameData], 1399);
        inbox.pipeline().add(10, |_| PreprocessResult::Stop);
        let request = RetransmitFrameData {
            frame_index: 1,
            datagram_start: 0,
            datagram_end_exclusive: 1,
        };
        inbox.deliver(&datagram(request.into(), &[]));
        assert!(inbox.receive_timeout(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn test_encode_outgoing_checks_size() {
        let inbox = Inbox::new("Test", &[], 30);
        let header = FrameData {
            frame_index: 0,
            data_length: 20,
            datagram_index: 0,
            datagram_data_offset: 0,
        };
        assert!(inbox.encode_outgoing(&header.into(), &[0; 10]).is_ok());
        match inbox.encode_outgoing(&header.into(), &[0; 11]) {
            Err(Error::MessageTooLarge { size, max }) => {
                assert_eq!(size, 31);
                assert_eq!(max, 30);
            }
            other => panic!("expected MessageTooLarge, got {:?}", other.map(|d| d.len())),
        }
    }
}
