// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Repeater side of the failover survey.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::messages::{Message, MessageType, RepeatersSurveyAnswer};
use crate::node::NodeId;
use crate::transport::{
    assert_receives, priority, PreprocessResult, PreprocessorHandle, ReceivedMessage,
    SharedTransport,
};

struct ResponderShared {
    transport: SharedTransport,
    node_id: NodeId,
    ip_address_bytes: u32,
    last_received_frame_index: AtomicU64,
    still_use_network_sync: AtomicBool,
}

/// Answers `SurveyRepeaters` with the progress of this repeater.
///
/// The repeater keeps the reported state current with
/// [`SurveyResponder::set_last_received_frame`] and
/// [`SurveyResponder::set_still_use_network_sync`].
///
/// # Example
///
/// ```ignore
/// let responder = SurveyResponder::new(Arc::clone(&transport), node_id, udp.interface_bytes());
/// // after each frame handed to the renderer
/// responder.set_last_received_frame(frame_index);
/// ```
pub struct SurveyResponder {
    shared: Arc<ResponderShared>,
    preprocessor: PreprocessorHandle,
}

impl SurveyResponder {
    /// # Panics
    ///
    /// If the transport does not receive `SurveyRepeaters`.
    pub fn new(transport: SharedTransport, node_id: NodeId, ip_address_bytes: u32) -> Self {
        assert_receives(&*transport, "SurveyResponder", &[MessageType::SurveyRepeaters]);

        let shared = Arc::new(ResponderShared {
            transport: Arc::clone(&transport),
            node_id,
            ip_address_bytes,
            last_received_frame_index: AtomicU64::new(0),
            still_use_network_sync: AtomicBool::new(true),
        });

        let weak: Weak<ResponderShared> = Arc::downgrade(&shared);
        let preprocessor = transport
            .pipeline()
            .add(priority::SURVEY_ANSWERING, move |received| match weak.upgrade() {
                Some(shared) => shared.preprocess(received),
                None => PreprocessResult::PassThrough,
            });

        Self {
            shared,
            preprocessor,
        }
    }

    pub fn set_last_received_frame(&self, frame_index: u64) {
        self.shared
            .last_received_frame_index
            .store(frame_index, Ordering::Relaxed);
    }

    pub fn set_still_use_network_sync(&self, value: bool) {
        self.shared.still_use_network_sync.store(value, Ordering::Relaxed);
    }

    /// Answer this responder currently sends.
    pub fn current_answer(&self) -> RepeatersSurveyAnswer {
        self.shared.answer()
    }
}

impl ResponderShared {
    fn answer(&self) -> RepeatersSurveyAnswer {
        RepeatersSurveyAnswer {
            node_id: self.node_id,
            ip_address_bytes: self.ip_address_bytes,
            last_received_frame_index: self.last_received_frame_index.load(Ordering::Relaxed),
            still_use_network_sync: self.still_use_network_sync.load(Ordering::Relaxed),
        }
    }

    fn preprocess(&self, received: &ReceivedMessage) -> PreprocessResult {
        if !matches!(received.message(), Message::SurveyRepeaters(_)) {
            return PreprocessResult::PassThrough;
        }
        let answer = self.answer();
        if let Err(e) = self.transport.send(&answer.into(), &[]) {
            log::warn!("[Survey] node {} failed to answer survey: {}", self.node_id, e);
        }
        PreprocessResult::Stop
    }
}

impl Drop for SurveyResponder {
    fn drop(&mut self) {
        self.shared.transport.pipeline().remove(self.preprocessor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::SurveyRepeaters;
    use crate::transport::{consume_until, LoopbackNetwork, Transport};
    use std::time::Duration;

    #[test]
    fn test_answers_survey_with_current_state() {
        let network = LoopbackNetwork::new();
        let repeater: SharedTransport = Arc::new(
            network
                .create_transport(&[MessageType::SurveyRepeaters])
                .expect("repeater transport"),
        );
        let surveyor = network
            .create_transport(&[MessageType::RepeatersSurveyAnswer])
            .expect("surveyor transport");

        let responder = SurveyResponder::new(Arc::clone(&repeater), 4, 0x0100_000A);
        responder.set_last_received_frame(41);
        responder.set_still_use_network_sync(false);

        surveyor.send(&SurveyRepeaters.into(), &[]).expect("send survey");
        let received = consume_until(&surveyor, Duration::from_secs(2), |m| {
            m.message_type() == MessageType::RepeatersSurveyAnswer
        })
        .expect("survey answer");
        assert_eq!(
            *received.message(),
            Message::RepeatersSurveyAnswer(RepeatersSurveyAnswer {
                node_id: 4,
                ip_address_bytes: 0x0100_000A,
                last_received_frame_index: 41,
                still_use_network_sync: false,
            })
        );

        // Survey requests are consumed
        assert!(repeater.try_receive().is_none());
    }
}
