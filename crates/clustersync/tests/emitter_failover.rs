// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test/bench code readability over pedantic
#![allow(clippy::cast_possible_truncation)] // Test parameters
#![allow(clippy::too_many_lines)] // Scenario tests

//! Emitter failover: a placeholder converges repeaters stopped on different frames.
//!
//! Test scenarios:
//! - Repeaters at frames 10, 10 and 12: frames 11 and 12 are fetched back from
//!   the most advanced repeater and served to the laggards
//! - Only repeaters ready for `min + 1` are released
//! - Topology changes stop the wait on departed repeaters

use std::sync::Arc;
use std::time::{Duration, Instant};

use clustersync::messages::{EmitterWaitingToStartFrame, RepeaterWaitingToStartFrame};
use clustersync::placeholder::PLACEHOLDER_RECEIVE_TYPES;
use clustersync::transport::loopback::EndpointId;
use clustersync::{
    consume_until, AssemblerConfig, ClusterTopology, ClusterTopologyEntry, EmitterPlaceholder,
    FrameDataAssembler, FrameDataSplitter, LoopbackNetwork, Message, MessageType, NodeId,
    NodeIdBitVector, NodeRole, PlaceholderConfig, SharedTransport, SurveyResponder, Transport,
};

const BACKUP: NodeId = 9;
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

const REPEATER_RECEIVE_TYPES: [MessageType; 4] = [
    MessageType::FrameData,
    MessageType::RetransmitReceivedFrameData,
    MessageType::SurveyRepeaters,
    MessageType::EmitterWaitingToStartFrame,
];

struct Repeater {
    node_id: NodeId,
    transport: SharedTransport,
    assembler: FrameDataAssembler,
    responder: SurveyResponder,
}

impl Repeater {
    fn new(network: &LoopbackNetwork, node_id: NodeId) -> (Self, EndpointId) {
        let endpoint = network
            .create_transport(&REPEATER_RECEIVE_TYPES)
            .expect("repeater transport");
        let endpoint_id = endpoint.endpoint_id();
        let transport: SharedTransport = Arc::new(endpoint);
        let assembler = FrameDataAssembler::new(
            Arc::clone(&transport),
            AssemblerConfig::default().with_node_id(node_id),
        )
        .expect("assembler");
        let responder = SurveyResponder::new(Arc::clone(&transport), node_id, 0x0A00_0000 | u32::from(node_id));
        (
            Self {
                node_id,
                transport,
                assembler,
                responder,
            },
            endpoint_id,
        )
    }

    /// Helper: wait for `frame_index` the way a renderer would.
    fn receive_frame(&self, frame_index: u64) -> Vec<u8> {
        self.assembler.note_future_need(frame_index);
        let received = consume_until(&*self.transport, RECEIVE_TIMEOUT, |m| {
            matches!(m.message(), Message::FrameData(h) if h.frame_index == frame_index)
        })
        .unwrap_or_else(|| panic!("node {} never got frame {}", self.node_id, frame_index));
        self.responder.set_last_received_frame(frame_index);
        received.extra_data().to_vec()
    }
}

fn make_payload(frame_index: u64) -> Vec<u8> {
    (0..3000usize).map(|i| (i as u64 ^ frame_index) as u8).collect()
}

fn topology(repeaters: &[NodeId]) -> Arc<ClusterTopology> {
    let mut entries = vec![ClusterTopologyEntry::new(BACKUP, NodeRole::Emitter)];
    entries.extend(
        repeaters
            .iter()
            .map(|&node_id| ClusterTopologyEntry::new(node_id, NodeRole::Repeater)),
    );
    Arc::new(ClusterTopology::with_entries(entries))
}

fn fast_config() -> PlaceholderConfig {
    PlaceholderConfig {
        survey_interval: Duration::from_millis(50),
        fetch_timespan: Duration::from_secs(1),
        fetch_max_idle: Duration::from_millis(100),
    }
}

fn placeholder_transport(network: &LoopbackNetwork) -> SharedTransport {
    Arc::new(
        network
            .create_transport(&PLACEHOLDER_RECEIVE_TYPES)
            .expect("placeholder transport"),
    )
}

/// Helper: poll `condition` until it holds or `timeout` elapses.
fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// ---------------------------------------------------------------------------
// Test: full failover
// ---------------------------------------------------------------------------

#[test]
fn test_placeholder_converges_repeaters() {
    let network = LoopbackNetwork::new();
    let (r1, e1) = Repeater::new(&network, 1);
    let (r2, e2) = Repeater::new(&network, 2);
    let (r3, _) = Repeater::new(&network, 3);

    // Repeaters 1 and 2 lose everything after frame 10
    network.set_drop_filter(move |message, endpoint| {
        (endpoint == e1 || endpoint == e2)
            && matches!(message, Message::FrameData(h) if h.frame_index > 10)
    });

    {
        let emitter: SharedTransport = Arc::new(
            network
                .create_transport(&[MessageType::RetransmitFrameData])
                .expect("emitter transport"),
        );
        let splitter = FrameDataSplitter::new(emitter);
        for frame_index in 0..=12u64 {
            splitter.send_frame(frame_index, make_payload(frame_index));
            if frame_index <= 10 {
                r1.receive_frame(frame_index);
                r2.receive_frame(frame_index);
            }
            r3.receive_frame(frame_index);
        }
        // Emitter dies
    }
    network.clear_drop_filter();

    let transport = placeholder_transport(&network);
    let placeholder = EmitterPlaceholder::new(topology(&[1, 2, 3]), Arc::clone(&transport), fast_config())
        .expect("placeholder");

    assert!(
        wait_for(RECEIVE_TIMEOUT, || placeholder.fetched_frames() == vec![11, 12]),
        "frames 11 and 12 fetched from node 3, got {:?}",
        placeholder.fetched_frames()
    );
    assert!(!placeholder.repeaters_synchronized());
    let last_frames: Vec<(NodeId, u64)> = placeholder
        .repeaters_survey_result()
        .iter()
        .map(|answer| (answer.node_id, answer.last_received_frame_index))
        .collect();
    assert_eq!(last_frames, vec![(1, 10), (2, 10), (3, 12)]);

    // Repeaters waiting to start 11 are released, nobody else is
    let observer = network
        .create_transport(&[MessageType::EmitterWaitingToStartFrame])
        .expect("observer transport");
    for frame_index in [12u64, 11] {
        observer
            .send(
                &RepeaterWaitingToStartFrame {
                    frame_index,
                    node_id: 1,
                    will_use_network_sync_on_next_frame: true,
                }
                .into(),
                &[],
            )
            .expect("send report");
    }
    let received = consume_until(&observer, RECEIVE_TIMEOUT, |m| {
        m.message_type() == MessageType::EmitterWaitingToStartFrame
    })
    .expect("release of frame 11");
    assert_eq!(
        *received.message(),
        Message::EmitterWaitingToStartFrame(EmitterWaitingToStartFrame {
            frame_index: 11,
            waiting_on: NodeIdBitVector::EMPTY,
        })
    );
    assert!(observer.receive_timeout(Duration::from_millis(50)).is_none());

    // Laggards catch up through regular retransmission requests
    for repeater in [&r1, &r2] {
        for frame_index in [11u64, 12] {
            assert_eq!(repeater.receive_frame(frame_index), make_payload(frame_index));
        }
    }
    assert!(transport.stats().lifetime().get(MessageType::FrameData).sent_repeat > 0);

    assert!(
        wait_for(RECEIVE_TIMEOUT, || placeholder.repeaters_synchronized()),
        "repeaters never reported the same frame"
    );
    assert!(wait_for(RECEIVE_TIMEOUT, || {
        placeholder.survey_stable_since() >= Duration::from_millis(20)
    }));

    drop(placeholder);
    assert!(transport.pipeline().is_empty());
}

// ---------------------------------------------------------------------------
// Test: topology handling
// ---------------------------------------------------------------------------

#[test]
fn test_departed_repeater_no_longer_awaited() {
    let network = LoopbackNetwork::new();
    let (r1, _) = Repeater::new(&network, 1);
    r1.responder.set_last_received_frame(4);

    let topology = topology(&[1, 2]);
    let placeholder = EmitterPlaceholder::new(Arc::clone(&topology), placeholder_transport(&network), fast_config())
        .expect("placeholder");

    assert!(wait_for(RECEIVE_TIMEOUT, || placeholder.repeaters_survey_result().len() == 1));
    std::thread::sleep(Duration::from_millis(120));
    assert!(!placeholder.repeaters_synchronized(), "node 2 never answered");
    assert_eq!(placeholder.survey_stable_since(), Duration::ZERO);

    topology.set_entries(vec![
        ClusterTopologyEntry::new(BACKUP, NodeRole::Emitter),
        ClusterTopologyEntry::new(1, NodeRole::Repeater),
    ]);
    assert!(wait_for(RECEIVE_TIMEOUT, || placeholder.repeaters_synchronized()));
}

#[test]
fn test_answers_of_removed_repeaters_are_forgotten() {
    let network = LoopbackNetwork::new();
    let (r1, _) = Repeater::new(&network, 1);
    let (r2, _) = Repeater::new(&network, 2);
    r1.responder.set_last_received_frame(7);
    r2.responder.set_last_received_frame(3);

    let topology = topology(&[1, 2]);
    let placeholder = EmitterPlaceholder::new(Arc::clone(&topology), placeholder_transport(&network), fast_config())
        .expect("placeholder");
    assert!(wait_for(RECEIVE_TIMEOUT, || placeholder.repeaters_survey_result().len() == 2));
    assert!(!placeholder.repeaters_synchronized());

    // Node 2 stops being a repeater: its answers no longer count
    topology.set_entries(vec![
        ClusterTopologyEntry::new(BACKUP, NodeRole::Emitter),
        ClusterTopologyEntry::new(1, NodeRole::Repeater),
        ClusterTopologyEntry::new(2, NodeRole::Emitter),
    ]);
    assert!(wait_for(RECEIVE_TIMEOUT, || placeholder.repeaters_synchronized()));
    let answers = placeholder.repeaters_survey_result();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].node_id, 1);
    drop(r2);
}

#[test]
fn test_unpublished_topology_is_never_synchronized() {
    let network = LoopbackNetwork::new();
    let (_r1, _) = Repeater::new(&network, 1);
    let placeholder = EmitterPlaceholder::new(
        Arc::new(ClusterTopology::new()),
        placeholder_transport(&network),
        fast_config(),
    )
    .expect("placeholder");

    std::thread::sleep(Duration::from_millis(150));
    assert!(!placeholder.repeaters_synchronized());
    assert!(placeholder.repeaters_survey_result().is_empty());
}

#[test]
#[should_panic(expected = "EmitterPlaceholder requires a transport receiving")]
fn test_placeholder_requires_receive_types() {
    let network = LoopbackNetwork::new();
    let transport: SharedTransport = Arc::new(
        network
            .create_transport(&[MessageType::RetransmitFrameData])
            .expect("transport"),
    );
    let _ = EmitterPlaceholder::new(topology(&[1]), transport, PlaceholderConfig::default());
}
