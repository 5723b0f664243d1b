// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP multicast transport.
//!
//! One socket bound to `0.0.0.0:port` with `SO_REUSEADDR` (several nodes may
//! run on the same host), member of the cluster multicast group. Sends go
//! to the group; a named thread drains the socket into the [`Inbox`].

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use super::multicast::{join_group, select_interface};
use super::{Inbox, Pipeline, ReceivedMessage, Transport};
use crate::config::{UdpTransportConfig, RECEIVE_POLL_INTERVAL, SOCKET_BUFFER_SIZE};
use crate::error::{Error, Result};
use crate::messages::{Message, MessageType};
use crate::pool::BufferPool;
use crate::stats::NetworkStatistics;

/// Largest datagram the receive thread can read.
const RECEIVE_BUFFER_LEN: usize = 65536;

/// Multicast UDP transport.
///
/// # Example
///
/// ```ignore
/// let config = UdpTransportConfig::from_env()
///     .with_receive_types(&[MessageType::FrameData, MessageType::EmitterWaitingToStartFrame]);
/// let transport: SharedTransport = Arc::new(UdpTransport::new(config)?);
/// ```
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    destination: SocketAddr,
    interface: Ipv4Addr,
    inbox: Arc<Inbox>,
    stop: Arc<AtomicBool>,
    receive_thread: Mutex<Option<JoinHandle<()>>>,
}

// ===== Construction =====

impl UdpTransport {
    pub fn new(config: UdpTransportConfig) -> Result<Self> {
        config.validate()?;

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;
        socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;

        let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port));
        socket
            .bind(&bind_addr.into())
            .map_err(|e| Error::BindFailed(format!("{}: {}", bind_addr, e)))?;
        log::debug!("[UDP] transport bind addr={}", bind_addr);

        let interface = select_interface(config.adapter.as_deref())?;
        join_group(&socket, config.multicast_group, interface, config.multicast_ttl)?;
        socket.set_read_timeout(Some(RECEIVE_POLL_INTERVAL))?;

        let socket: UdpSocket = socket.into();
        let socket = Arc::new(socket);
        let inbox = Arc::new(Inbox::new("UDP", &config.receive_types, config.mtu - 1));
        let stop = Arc::new(AtomicBool::new(false));

        // Send-only endpoints have no receive thread
        let receive_thread = if config.receive_types.is_empty() {
            None
        } else {
            let socket = Arc::clone(&socket);
            let inbox = Arc::clone(&inbox);
            let stop = Arc::clone(&stop);
            Some(
                thread::Builder::new()
                    .name(format!("clustersync-udp-{}", config.port))
                    .spawn(move || receive_loop(&socket, &inbox, &stop))?,
            )
        };

        log::info!(
            "[UDP] joined {}:{} on {} (mtu {})",
            config.multicast_group,
            config.port,
            interface,
            config.mtu
        );

        Ok(Self {
            socket,
            destination: SocketAddr::V4(SocketAddrV4::new(config.multicast_group, config.port)),
            interface,
            inbox,
            stop,
            receive_thread: Mutex::new(receive_thread),
        })
    }

    /// Address of the interface carrying cluster traffic.
    pub fn interface(&self) -> Ipv4Addr {
        self.interface
    }

    /// Interface address packed the way survey answers carry it.
    pub fn interface_bytes(&self) -> u32 {
        u32::from_le_bytes(self.interface.octets())
    }
}

fn receive_loop(socket: &UdpSocket, inbox: &Inbox, stop: &AtomicBool) {
    let mut buffer = vec![0u8; RECEIVE_BUFFER_LEN];
    while !stop.load(Ordering::Acquire) {
        match socket.recv_from(&mut buffer) {
            Ok((len, _from)) => inbox.deliver(&buffer[..len]),
            Err(e) if is_timeout(&e) => {}
            Err(e) => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                log::warn!("[UDP] receive failed: {}", e);
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
    log::debug!("[UDP] receive thread stopped");
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

// ===== Transport =====

impl Transport for UdpTransport {
    fn max_message_size(&self) -> usize {
        self.inbox.max_message_size()
    }

    fn send(&self, message: &Message, extra: &[u8]) -> Result<()> {
        let datagram = self.inbox.encode_outgoing(message, extra)?;
        self.socket
            .send_to(&datagram, self.destination)
            .map_err(|e| Error::SendFailed(format!("{}: {}", self.destination, e)))?;
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

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.receive_thread.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
