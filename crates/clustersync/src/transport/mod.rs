// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message transports
//!
//! A transport sends typed messages (fixed header plus optional extra
//! bytes) to every node of the cluster and hands received ones to its
//! preprocessing [`Pipeline`] before queueing them for consumers.
//!
//! # Architecture
//!
//! ```text
//! socket / loopback bytes
//!        |
//!        v
//!   Inbox::deliver      decode, filter receive types, count, copy extra into pool
//!        |
//!        v
//!   Pipeline::process   preprocessors by descending priority
//!        |
//!        v
//!   crossbeam queue  -> receive_timeout() / try_receive()
//! ```
//!
//! - [`UdpTransport`]: multicast UDP socket
//! - [`LoopbackTransport`]: in-process medium for tests and simulations

mod inbox;
pub mod loopback;
mod multicast;
pub mod pipeline;
pub mod udp;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::messages::{Message, MessageType};
use crate::pool::{BufferPool, PooledBuffer};
use crate::stats::NetworkStatistics;

pub use loopback::{DropFilter, LoopbackNetwork, LoopbackTransport};
pub use pipeline::{Pipeline, PreprocessResult, Preprocessor, PreprocessorHandle};
pub use udp::UdpTransport;

pub(crate) use inbox::Inbox;

/// Priorities of the preprocessors registered by this crate (higher runs first).
pub mod priority {
    /// Frame assembler merging `FrameData`
    pub const FRAME_DATA_PROCESSING: i32 = 1000;
    /// Frame splitter answering `RetransmitFrameData`
    pub const RETRANSMIT_FRAME_DATA_PROCESSING: i32 = 900;
    /// Frame-start barrier
    pub const REPEATER_WAITING_TO_START_FRAME: i32 = 500;
    /// Failover placeholder
    pub const EMITTER_PLACEHOLDER: i32 = 300;
    /// Repeater answering surveys
    pub const SURVEY_ANSWERING: i32 = 200;
    /// Repeater sending back frames it received
    pub const RECEIVED_FRAME_RETRANSMISSION: i32 = 150;
}

// ============================================================================
// ReceivedMessage
// ============================================================================

/// A message accepted by a transport, with its extra bytes.
#[derive(Debug)]
pub struct ReceivedMessage {
    message: Message,
    extra: Option<PooledBuffer>,
}

impl ReceivedMessage {
    pub fn new(message: Message, extra: Option<PooledBuffer>) -> Self {
        Self { message, extra }
    }

    #[inline]
    pub fn message(&self) -> &Message {
        &self.message
    }

    #[inline]
    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }

    /// Extra bytes following the header (empty if none).
    #[inline]
    pub fn extra_data(&self) -> &[u8] {
        self.extra.as_deref().unwrap_or(&[])
    }

    /// Take ownership of the extra bytes buffer.
    pub fn into_parts(self) -> (Message, Option<PooledBuffer>) {
        (self.message, self.extra)
    }
}

// ============================================================================
// Transport trait
// ============================================================================

/// Sends messages to and receives messages from the whole cluster.
///
/// Implementations are shared between components (`Arc<dyn Transport>`), so
/// every method takes `&self`.
pub trait Transport: Send + Sync {
    /// Largest header plus extra data accepted by [`Transport::send`].
    fn max_message_size(&self) -> usize;

    /// Send to every node (including this one if it receives the type).
    ///
    /// Fails with [`crate::Error::MessageTooLarge`] when the message does not
    /// fit. Never waits for the network.
    fn send(&self, message: &Message, extra: &[u8]) -> Result<()>;

    /// Next queued message, or `None` after `timeout`.
    fn receive_timeout(&self, timeout: Duration) -> Option<ReceivedMessage>;

    /// Next queued message if one is immediately available.
    fn try_receive(&self) -> Option<ReceivedMessage>;

    /// Number of queued messages.
    fn received_count(&self) -> usize;

    /// Types accepted on reception, others are discarded.
    fn receive_types(&self) -> &[MessageType];

    fn pipeline(&self) -> &Pipeline;

    fn stats(&self) -> &NetworkStatistics;

    fn buffer_pool(&self) -> &BufferPool;

    /// Whether this transport keeps messages of type `ty`.
    fn receives(&self, ty: MessageType) -> bool {
        self.receive_types().contains(&ty)
    }
}

/// Shared handle on a transport.
pub type SharedTransport = Arc<dyn Transport>;

/// Wait for a queued message matching `predicate`, dropping the others.
///
/// Returns `None` if none matched before `timeout`.
pub fn consume_until<P>(
    transport: &dyn Transport,
    timeout: Duration,
    mut predicate: P,
) -> Option<ReceivedMessage>
where
    P: FnMut(&ReceivedMessage) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let received = transport.receive_timeout(remaining)?;
        if predicate(&received) {
            return Some(received);
        }
        if remaining.is_zero() {
            return None;
        }
    }
}

/// Panic unless datagrams of `transport` leave room for data after a `header_len` header.
pub(crate) fn assert_room_after_header(transport: &dyn Transport, component: &str, header_len: usize) {
    assert!(
        transport.max_message_size() > header_len,
        "{} requires a maximum message size above {} bytes, transport allows {}",
        component,
        header_len,
        transport.max_message_size()
    );
}

/// Panic unless `transport` receives every type of `required`.
pub(crate) fn assert_receives(transport: &dyn Transport, component: &str, required: &[MessageType]) {
    for ty in required {
        assert!(
            transport.receives(*ty),
            "{} requires a transport receiving {} messages",
            component,
            ty
        );
    }
}

/// Transports with unusual limits, for component tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Loopback endpoint announcing a smaller maximum message size.
    pub(crate) struct CappedTransport {
        pub(crate) inner: LoopbackTransport,
        pub(crate) max_message_size: usize,
    }

    impl Transport for CappedTransport {
        fn max_message_size(&self) -> usize {
            self.max_message_size
        }

        fn send(&self, message: &Message, extra: &[u8]) -> Result<()> {
            self.inner.send(message, extra)
        }

        fn receive_timeout(&self, timeout: Duration) -> Option<ReceivedMessage> {
            self.inner.receive_timeout(timeout)
        }

        fn try_receive(&self) -> Option<ReceivedMessage> {
            self.inner.try_receive()
        }

        fn received_count(&self) -> usize {
            self.inner.received_count()
        }

        fn receive_types(&self) -> &[MessageType] {
            self.inner.receive_types()
        }

        fn pipeline(&self) -> &Pipeline {
            self.inner.pipeline()
        }

        fn stats(&self) -> &NetworkStatistics {
            self.inner.stats()
        }

        fn buffer_pool(&self) -> &BufferPool {
            self.inner.buffer_pool()
        }
    }

    /// Shared transport of `network` receiving `receive_types` with datagrams of at most `max_message_size`.
    pub(crate) fn capped(
        network: &LoopbackNetwork,
        receive_types: &[MessageType],
        max_message_size: usize,
    ) -> SharedTransport {
        let inner = network
            .create_transport(receive_types)
            .expect("loopback endpoint");
        Arc::new(CappedTransport {
            inner,
            max_message_size,
        })
    }
}
