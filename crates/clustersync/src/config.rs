// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cluster sync global configuration.
//!
//! Centralizes the protocol timings, sizes and network defaults.
//! **Never hardcode these values elsewhere!**
//!
//! # Architecture
//!
//! - **Level 1 (Static)**: compile-time constants (wire limits, protocol timings)
//! - **Level 2 (Dynamic)**: [`UdpTransportConfig`] for per-node network settings,
//!   with environment overrides for quick field debugging
//!
//! # Example
//!
//! ```ignore
//! use clustersync::config::*;
//!
//! let delay = DEFAULT_FRAME_COMPLETION_DELAY; // 4 ms
//!
//! let config = UdpTransportConfig::from_env()
//!     .with_port(25691)
//!     .with_receive_types(&[MessageType::FrameData]);
//! ```

use crate::error::{Error, Result};
use crate::messages::MessageType;
use std::net::Ipv4Addr;
use std::time::Duration;

// =======================================================================
// Network defaults
// =======================================================================

/// Default MTU used when the interface MTU cannot be queried.
pub const DEFAULT_MTU: usize = 1400;

/// Smallest MTU accepted by the transports.
///
/// Must leave room for the type byte, the largest header and some payload.
pub const MIN_MTU: usize = 64;

/// Default UDP port shared by every node of the cluster.
pub const DEFAULT_PORT: u16 = 25690;

/// Default multicast group carrying all cluster traffic.
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 0);

/// Socket send and receive buffer size (bytes).
pub const SOCKET_BUFFER_SIZE: usize = 65535;

/// Multicast TTL: one hop between emitter and repeaters.
pub const DEFAULT_MULTICAST_TTL: u32 = 1;

/// Read timeout of the socket receive thread, bounds shutdown latency.
pub const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum number of nodes in a cluster (width of `NodeIdBitVector`).
pub const MAX_NODES: usize = 64;

// =======================================================================
// Frame distribution
// =======================================================================

/// Default number of frames kept for retransmission.
pub const DEFAULT_RETRANSMIT_HISTORY: usize = 2;

/// Minimum splitter history: the frame being sent plus the previous one.
pub const MIN_RETRANSMIT_HISTORY: usize = 2;

/// Minimum delay between two sends of the same datagram.
///
/// Several repeaters usually ask for the same missing datagram at once,
/// answering all of them would only flood the network.
pub const SHORT_RETRANSMISSION_DELAY: Duration = Duration::from_millis(2);

/// Default delay without new datagram before asking for retransmission.
///
/// Safely above a LAN round trip while short compared to a frame.
pub const DEFAULT_FRAME_COMPLETION_DELAY: Duration = Duration::from_millis(4);

/// Multiplier applied to the completion delay when nothing was received for a frame.
pub const SILENT_FRAME_DELAY_MULTIPLIER: u32 = 10;

/// Smallest size class of the buffer pool (bytes).
pub const MIN_BUFFER_CLASS: usize = 256;

// =======================================================================
// Failover
// =======================================================================

/// Interval between two repeater surveys of the placeholder.
pub const SURVEY_INTERVAL: Duration = Duration::from_millis(50);

/// Time budget of one pass fetching missing frames from repeaters.
pub const FETCH_FRAMES_TIMESPAN: Duration = Duration::from_millis(250);

/// Silence after which a repeater is considered unable to provide a frame.
pub const FETCH_FRAME_MAX_IDLE: Duration = Duration::from_millis(25);

// =======================================================================
// Statistics
// =======================================================================

/// Duration of one statistics interval.
pub const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Number of intervals kept in the statistics window (one minute).
pub const STATS_HISTORY_LEN: usize = 60;

// =======================================================================
// UDP transport configuration
// =======================================================================

/// Network settings of a [`crate::transport::UdpTransport`].
///
/// Environment overrides (see [`UdpTransportConfig::from_env`]):
/// - `CLUSTERSYNC_MULTICAST_GROUP=<ipv4>`
/// - `CLUSTERSYNC_PORT=<port>`
/// - `CLUSTERSYNC_MULTICAST_IF=<interface name or ipv4>`
/// - `CLUSTERSYNC_MTU=<bytes>`
/// - `CLUSTERSYNC_MULTICAST_TTL=<hops>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpTransportConfig {
    /// Multicast group all nodes send to and listen on
    pub multicast_group: Ipv4Addr,
    /// Port shared by all nodes
    pub port: u16,
    /// Interface name or address, `None` picks the first usable interface
    pub adapter: Option<String>,
    /// Datagram size limit including the type byte
    pub mtu: usize,
    /// Multicast hop limit
    pub multicast_ttl: u32,
    /// Message types accepted by this endpoint, others are dropped on reception
    pub receive_types: Vec<MessageType>,
}

impl Default for UdpTransportConfig {
    fn default() -> Self {
        Self {
            multicast_group: DEFAULT_MULTICAST_GROUP,
            port: DEFAULT_PORT,
            adapter: None,
            mtu: DEFAULT_MTU,
            multicast_ttl: DEFAULT_MULTICAST_TTL,
            receive_types: Vec::new(),
        }
    }
}

impl UdpTransportConfig {
    /// Defaults overridden by `CLUSTERSYNC_*` environment variables.
    ///
    /// Invalid values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(group) = env_parse::<Ipv4Addr>("CLUSTERSYNC_MULTICAST_GROUP") {
            config.multicast_group = group;
        }
        if let Some(port) = env_parse::<u16>("CLUSTERSYNC_PORT") {
            config.port = port;
        }
        if let Ok(adapter) = std::env::var("CLUSTERSYNC_MULTICAST_IF") {
            if !adapter.is_empty() {
                config.adapter = Some(adapter);
            }
        }
        if let Some(mtu) = env_parse::<usize>("CLUSTERSYNC_MTU") {
            config.mtu = mtu;
        }
        if let Some(ttl) = env_parse::<u32>("CLUSTERSYNC_MULTICAST_TTL") {
            config.multicast_ttl = ttl;
        }

        config
    }

    #[must_use]
    pub fn with_multicast_group(mut self, group: Ipv4Addr) -> Self {
        self.multicast_group = group;
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.adapter = Some(adapter.into());
        self
    }

    #[must_use]
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    #[must_use]
    pub fn with_receive_types(mut self, types: &[MessageType]) -> Self {
        self.receive_types = types.to_vec();
        self
    }

    /// Check the settings before opening sockets.
    pub fn validate(&self) -> Result<()> {
        if !self.multicast_group.is_multicast() {
            return Err(Error::InvalidConfig(format!(
                "{} is not a multicast address",
                self.multicast_group
            )));
        }
        if self.mtu < MIN_MTU || self.mtu > usize::from(u16::MAX) {
            return Err(Error::InvalidConfig(format!(
                "mtu {} outside [{}, {}]",
                self.mtu,
                MIN_MTU,
                u16::MAX
            )));
        }
        if self.multicast_ttl == 0 || self.multicast_ttl > 255 {
            return Err(Error::InvalidConfig(format!(
                "multicast ttl {} outside [1, 255]",
                self.multicast_ttl
            )));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            log::warn!("[Config] ignoring invalid {}={}", name, value);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = UdpTransportConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mtu, DEFAULT_MTU);
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.receive_types.is_empty());
    }

    #[test]
    fn test_validate_rejects_unicast_group() {
        let config = UdpTransportConfig::default().with_multicast_group(Ipv4Addr::new(10, 0, 0, 1));
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_tiny_mtu() {
        let config = UdpTransportConfig::default().with_mtu(16);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_builder_chain() {
        let config = UdpTransportConfig::default()
            .with_port(30000)
            .with_adapter("eth1")
            .with_receive_types(&[MessageType::FrameData]);
        assert_eq!(config.port, 30000);
        assert_eq!(config.adapter.as_deref(), Some("eth1"));
        assert_eq!(config.receive_types, vec![MessageType::FrameData]);
    }
}
