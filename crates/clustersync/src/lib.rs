// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # clustersync - frame distribution for render clusters
//!
//! Keeps a cluster of rendering nodes in lock-step. One node (the emitter)
//! sends a byte-identical copy of every frame state to all other nodes (the
//! repeaters) over unreliable multicast, repairs losses on demand, gates
//! frame starts until every repeater is ready, and lets a backup converge the
//! repeaters on a common frame when the emitter disappears.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use clustersync::{
//!     consume_until, AssemblerConfig, FrameDataAssembler, FrameDataSplitter, LoopbackNetwork,
//!     MessageType, SharedTransport,
//! };
//!
//! fn main() -> clustersync::Result<()> {
//!     let network = LoopbackNetwork::new();
//!     let emitter: SharedTransport =
//!         Arc::new(network.create_transport(&[MessageType::RetransmitFrameData])?);
//!     let repeater: SharedTransport = Arc::new(network.create_transport(&[MessageType::FrameData])?);
//!
//!     let splitter = FrameDataSplitter::new(emitter);
//!     let assembler = FrameDataAssembler::new(Arc::clone(&repeater), AssemblerConfig::default())?;
//!
//!     splitter.send_frame(0, vec![42u8; 10_000]);
//!     assembler.note_future_need(0);
//!     let frame = consume_until(&*repeater, Duration::from_secs(1), |m| {
//!         m.message_type() == MessageType::FrameData
//!     });
//!     assert_eq!(frame.map(|f| f.extra_data().len()), Some(10_000));
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |  Emitter                          |  Repeater                       |
//! |  FrameDataSplitter                |  FrameDataAssembler             |
//! |  FrameStartBarrier                |  SurveyResponder                |
//! |  EmitterPlaceholder (failover)    |                                 |
//! +---------------------------------------------------------------------+
//! |  Transport: Pipeline (preprocessors by priority) | NetworkStatistics |
//! |             BufferPool                                               |
//! +---------------------------------------------------------------------+
//! |  UdpTransport (multicast)  |  LoopbackTransport (in-process)        |
//! +---------------------------------------------------------------------+
//! ```
//!
//! Every component registers a preprocessor on the transport pipeline and
//! reacts to protocol messages on the receive thread, before anything is
//! queued for the application.
//!
//! ## Modules Overview
//!
//! - [`messages`] - wire format of every protocol message
//! - [`transport`] - transports, preprocessing pipeline
//! - [`splitter`] / [`assembler`] - frame distribution and loss repair
//! - [`barrier`] - frame-start handshake
//! - [`placeholder`] / [`survey`] - emitter failover

/// Global configuration (protocol timings, network defaults).
pub mod config;
/// Error type and result alias.
pub mod error;
/// Protocol messages and their binary layout.
pub mod messages;
/// Node identifiers, roles and node sets.
pub mod node;
/// Size-classed byte buffer pool.
pub mod pool;
/// Per message type network counters.
pub mod stats;
/// Cluster topology snapshot with change notification.
pub mod topology;
/// Message transports and preprocessing pipeline.
pub mod transport;

/// Emitter: frame splitting and retransmission.
pub mod splitter;
/// Repeater: frame reassembly.
pub mod assembler;
/// Emitter: frame-start barrier.
pub mod barrier;
/// Failover: stand-in emitter converging repeaters.
pub mod placeholder;
/// Repeater: answers to failover surveys.
pub mod survey;

pub use assembler::{AssemblerConfig, FrameDataAssembler};
pub use barrier::FrameStartBarrier;
pub use config::UdpTransportConfig;
pub use error::{Error, Result};
pub use messages::{Message, MessageType};
pub use node::{NodeId, NodeIdBitVector, NodeRole};
pub use placeholder::{EmitterPlaceholder, PlaceholderConfig};
pub use pool::{BufferPool, PooledBuffer};
pub use splitter::{FrameDataSplitter, SplitterConfig};
pub use stats::{NetworkStatistics, StatsSnapshot};
pub use survey::SurveyResponder;
pub use topology::{ClusterTopology, ClusterTopologyEntry};
pub use transport::{
    consume_until, LoopbackNetwork, LoopbackTransport, PreprocessResult, ReceivedMessage,
    SharedTransport, Transport, UdpTransport,
};
