// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test/bench code readability over pedantic

//! Frame distribution over real multicast sockets.
//!
//! Socket tests need a multicast capable interface and are ignored by default:
//!
//! ```bash
//! cargo test --test udp_multicast -- --ignored
//! CLUSTERSYNC_MULTICAST_IF=lo cargo test --test udp_multicast -- --ignored
//! ```

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use clustersync::{
    consume_until, AssemblerConfig, Error, FrameDataAssembler, FrameDataSplitter, MessageType,
    SharedTransport, Transport, UdpTransport, UdpTransportConfig,
};

const TEST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 42, 99);

fn test_config(port: u16) -> UdpTransportConfig {
    UdpTransportConfig::from_env()
        .with_multicast_group(TEST_GROUP)
        .with_port(port)
}

// ---------------------------------------------------------------------------
// Test: configuration checks (no socket opened)
// ---------------------------------------------------------------------------

#[test]
fn test_rejects_unicast_group() {
    let config = test_config(25_700).with_multicast_group(Ipv4Addr::new(10, 0, 0, 1));
    assert!(matches!(
        UdpTransport::new(config).err(),
        Some(Error::InvalidConfig(_))
    ));
}

#[test]
fn test_rejects_out_of_range_mtu() {
    for mtu in [16, 70_000] {
        let config = test_config(25_701).with_mtu(mtu);
        assert!(
            matches!(UdpTransport::new(config).err(), Some(Error::InvalidConfig(_))),
            "mtu {} accepted",
            mtu
        );
    }
}

// ---------------------------------------------------------------------------
// Test: sockets
// ---------------------------------------------------------------------------

#[test]
#[ignore = "requires a multicast capable interface"]
fn test_frames_over_multicast() {
    let port = 25_710;
    let emitter: SharedTransport = Arc::new(
        UdpTransport::new(test_config(port).with_receive_types(&[MessageType::RetransmitFrameData]))
            .expect("emitter socket"),
    );
    let repeater: SharedTransport = Arc::new(
        UdpTransport::new(test_config(port).with_receive_types(&[MessageType::FrameData]))
            .expect("repeater socket"),
    );

    let splitter = FrameDataSplitter::new(Arc::clone(&emitter));
    let assembler = FrameDataAssembler::new(Arc::clone(&repeater), AssemblerConfig::default())
        .expect("assembler");

    for frame_index in 0..5u64 {
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 253) as u8).collect();
        splitter.send_frame(frame_index, payload.clone());
        assembler.note_future_need(frame_index);
        let received = consume_until(&*repeater, Duration::from_secs(5), |m| {
            m.message_type() == MessageType::FrameData
        })
        .expect("frame over multicast");
        assert_eq!(received.extra_data(), &payload[..]);
    }
}

#[test]
#[ignore = "requires a multicast capable interface"]
fn test_send_only_endpoint_does_not_receive() {
    let port = 25_711;
    let sender = UdpTransport::new(test_config(port)).expect("sender socket");
    let listener = UdpTransport::new(test_config(port).with_receive_types(&[MessageType::SurveyRepeaters]))
        .expect("listener socket");
    assert!(!sender.interface().is_unspecified());

    sender
        .send(&clustersync::messages::SurveyRepeaters.into(), &[])
        .expect("send survey");
    let received = listener
        .receive_timeout(Duration::from_secs(2))
        .expect("survey over multicast");
    assert_eq!(received.message_type(), MessageType::SurveyRepeaters);
    assert!(sender.try_receive().is_none());
}
