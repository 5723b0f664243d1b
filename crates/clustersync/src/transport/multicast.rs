// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast group membership and interface selection.

use std::io;
use std::net::{IpAddr, Ipv4Addr};

use socket2::Socket;

use crate::error::{Error, Result};

/// Pick the IPv4 address of the interface used for cluster traffic.
///
/// `adapter` may be an interface name (`eth1`) or one of its addresses.
/// Without one, the first non-loopback IPv4 interface is used, falling back
/// to `UNSPECIFIED` (let the OS route) when none is found.
pub(super) fn select_interface(adapter: Option<&str>) -> Result<Ipv4Addr> {
    if let Some(adapter) = adapter {
        if let Ok(addr) = adapter.parse::<Ipv4Addr>() {
            log::debug!("[UDP] using explicit interface address {}", addr);
            return Ok(addr);
        }
        return interface_by_name(adapter)?.ok_or_else(|| {
            log::warn!("[UDP] network adapter '{}' not found", adapter);
            Error::NoInterface
        });
    }

    match first_non_loopback()? {
        Some(addr) => {
            log::debug!("[UDP] using first non-loopback interface {}", addr);
            Ok(addr)
        }
        None => {
            log::debug!("[UDP] WARNING: no suitable interface found, using UNSPECIFIED");
            Ok(Ipv4Addr::UNSPECIFIED)
        }
    }
}

fn list_ipv4_interfaces() -> Result<Vec<(String, Ipv4Addr)>> {
    let interfaces = local_ip_address::list_afinet_netifas().map_err(|e| {
        log::debug!("[UDP] failed to list network interfaces: {}", e);
        Error::IoError(io::Error::new(io::ErrorKind::Other, e.to_string()))
    })?;
    Ok(interfaces
        .into_iter()
        .filter_map(|(name, ip)| match ip {
            IpAddr::V4(ipv4) => Some((name, ipv4)),
            IpAddr::V6(_) => None,
        })
        .collect())
}

fn interface_by_name(name: &str) -> Result<Option<Ipv4Addr>> {
    Ok(list_ipv4_interfaces()?
        .into_iter()
        .find(|(candidate, _)| candidate == name)
        .map(|(_, addr)| addr))
}

fn first_non_loopback() -> Result<Option<Ipv4Addr>> {
    Ok(list_ipv4_interfaces()?
        .into_iter()
        .map(|(_, addr)| addr)
        .find(|addr| !addr.is_loopback()))
}

/// Join `group` on `iface` and configure outgoing multicast.
///
/// Loopback stays enabled so a node receives what it sends, like every
/// other member of the group.
pub(super) fn join_group(socket: &Socket, group: Ipv4Addr, iface: Ipv4Addr, ttl: u32) -> Result<()> {
    match socket.join_multicast_v4(&group, &iface) {
        Ok(()) => {
            log::debug!("[UDP] join_multicast_v4({}) on interface {}", group, iface);
        }
        // EADDRINUSE on Linux: already joined on the same NIC
        Err(e) if e.raw_os_error() == Some(98) => {
            log::debug!("[UDP] join_multicast_v4({}) on {} - already joined", group, iface);
        }
        Err(e) => {
            return Err(Error::MulticastJoinFailed(format!(
                "{} on {}: {}",
                group, iface, e
            )));
        }
    }

    if !iface.is_unspecified() {
        socket.set_multicast_if_v4(&iface)?;
    }
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(ttl)?;
    log::debug!("[UDP] multicast loop enabled, ttl={}", ttl);
    Ok(())
}
