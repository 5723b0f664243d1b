// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process multicast medium.
//!
//! Every transport created from a [`LoopbackNetwork`] receives every message
//! sent on it, its own included, exactly like a multicast group with
//! loopback enabled. Datagrams are encoded to bytes and decoded again on the
//! receiving endpoint's own thread, so the receive path is the one used by
//! [`super::UdpTransport`].
//!
//! # Example
//!
//! ```ignore
//! let network = LoopbackNetwork::new();
//! let emitter = Arc::new(network.create_transport(&[MessageType::RetransmitFrameData])?);
//! let repeater = Arc::new(network.create_transport(&[MessageType::FrameData])?);
//!
//! // Lose one datagram out of ten on the way to repeaters
//! network.set_drop_filter(|message, _endpoint| {
//!     message.message_type() == MessageType::FrameData && fastrand::u8(..10) == 0
//! });
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::{Inbox, Pipeline, ReceivedMessage, Transport};
use crate::config::{DEFAULT_MTU, MIN_MTU, RECEIVE_POLL_INTERVAL};
use crate::error::{Error, Result};
use crate::messages::{Message, MessageType};
use crate::pool::BufferPool;
use crate::stats::NetworkStatistics;

/// Identifier of an endpoint on a [`LoopbackNetwork`] (creation order).
pub type EndpointId = usize;

/// Decides whether a datagram is lost on its way to an endpoint.
///
/// Returns `true` to drop the datagram.
pub type DropFilter = dyn Fn(&Message, EndpointId) -> bool + Send + Sync;

struct NetworkInner {
    mtu: usize,
    endpoints: Mutex<Vec<(EndpointId, Sender<Arc<[u8]>>)>>,
    next_endpoint: AtomicUsize,
    drop_filter: ArcSwapOption<Box<DropFilter>>,
}

/// Shared in-process medium; clones refer to the same network.
#[derive(Clone)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::with_mtu(DEFAULT_MTU)
    }

    /// Network whose datagrams are limited to `mtu` bytes (type byte included).
    pub fn with_mtu(mtu: usize) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                mtu,
                endpoints: Mutex::new(Vec::new()),
                next_endpoint: AtomicUsize::new(0),
                drop_filter: ArcSwapOption::empty(),
            }),
        }
    }

    pub fn mtu(&self) -> usize {
        self.inner.mtu
    }

    /// Simulate loss: `filter` returning `true` drops the datagram for that endpoint.
    pub fn set_drop_filter<F>(&self, filter: F)
    where
        F: Fn(&Message, EndpointId) -> bool + Send + Sync + 'static,
    {
        let filter: Box<DropFilter> = Box::new(filter);
        self.inner.drop_filter.store(Some(Arc::new(filter)));
    }

    pub fn clear_drop_filter(&self) {
        self.inner.drop_filter.store(None);
    }

    /// Number of live endpoints.
    pub fn endpoint_count(&self) -> usize {
        self.inner.endpoints.lock().len()
    }

    /// New endpoint accepting `receive_types`.
    pub fn create_transport(&self, receive_types: &[MessageType]) -> Result<LoopbackTransport> {
        if self.inner.mtu < MIN_MTU {
            return Err(Error::InvalidConfig(format!(
                "mtu {} below minimum {}",
                self.inner.mtu, MIN_MTU
            )));
        }
        let id = self.inner.next_endpoint.fetch_add(1, Ordering::Relaxed);
        let inbox = Arc::new(Inbox::new("Loopback", receive_types, self.inner.mtu - 1));
        let (datagram_tx, datagram_rx) = channel::unbounded::<Arc<[u8]>>();
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let inbox = Arc::clone(&inbox);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("clustersync-loopback-{}", id))
                .spawn(move || receive_loop(&inbox, &datagram_rx, &stop))?
        };

        self.inner.endpoints.lock().push((id, datagram_tx));
        log::debug!("[Loopback] endpoint {} created, receives {:?}", id, receive_types);

        Ok(LoopbackTransport {
            id,
            network: self.clone(),
            inbox,
            stop,
            receive_thread: Mutex::new(Some(thread)),
        })
    }

    fn broadcast(&self, datagram: Vec<u8>) {
        let datagram: Arc<[u8]> = datagram.into();
        let filter = self.inner.drop_filter.load_full();
        let decoded = match &filter {
            Some(_) => Message::decode(&datagram).ok().map(|(message, _)| message),
            None => None,
        };

        let endpoints = self.inner.endpoints.lock();
        for (id, sender) in endpoints.iter() {
            if let (Some(filter), Some(message)) = (&filter, &decoded) {
                if filter(message, *id) {
                    log::trace!("[Loopback] dropped {} for endpoint {}", message.message_type(), id);
                    continue;
                }
            }
            // A closed endpoint is about to unregister
            let _ = sender.send(Arc::clone(&datagram));
        }
    }

    fn unregister(&self, id: EndpointId) {
        self.inner.endpoints.lock().retain(|(existing, _)| *existing != id);
    }
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

fn receive_loop(inbox: &Inbox, datagrams: &Receiver<Arc<[u8]>>, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        match datagrams.recv_timeout(RECEIVE_POLL_INTERVAL) {
            Ok(datagram) => inbox.deliver(&datagram),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// One endpoint of a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    id: EndpointId,
    network: LoopbackNetwork,
    inbox: Arc<Inbox>,
    stop: Arc<AtomicBool>,
    receive_thread: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackTransport {
    pub fn endpoint_id(&self) -> EndpointId {
        self.id
    }

    fn receive_thread_id(&self) -> Option<ThreadId> {
        self.receive_thread
            .lock()
            .as_ref()
            .map(|handle| handle.thread().id())
    }
}

impl Transport for LoopbackTransport {
    fn max_message_size(&self) -> usize {
        self.inbox.max_message_size()
    }

    fn send(&self, message: &Message, extra: &[u8]) -> Result<()> {
        let datagram = self.inbox.encode_outgoing(message, extra)?;
        self.network.broadcast(datagram);
        Ok(())
    }

    fn receive_timeout(&self, timeout: Duration) -> Option<ReceivedMessage> {
        self.inbox.receive_timeout(timeout)
    }

    fn try_receive(&self) -> Option<ReceivedMessage> {
        self.inbox.try_receive()
    }

    fn received_count(&self) -> usize {
        self.inbox.received_count()
    }

    fn receive_types(&self) -> &[MessageType] {
        self.inbox.receive_types()
    }

    fn pipeline(&self) -> &Pipeline {
        self.inbox.pipeline()
    }

    fn stats(&self) -> &NetworkStatistics {
        self.inbox.stats()
    }

    fn buffer_pool(&self) -> &BufferPool {
        self.inbox.pool()
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.network.unregister(self.id);
        self.stop.store(true, Ordering::Release);

        // Last reference may be released by a preprocessor on our own receive thread
        let on_receive_thread = self.receive_thread_id() == Some(thread::current().id());
        if let Some(handle) = self.receive_thread.lock().take() {
            if !on_receive_thread {
                let _ = handle.join();
            }
        }
        log::debug!("[Loopback] endpoint {} closed", self.id);
    }
}
