//! Local IPv4 address lookup.
//!
//! Connecting a UDP socket sends nothing; it only asks the OS to pick the
//! outbound interface, whose address is then read back.  The target is in the
//! TEST-NET-1 documentation range and is never contacted.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use tracing::debug;

const PROBE_TARGET: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 9);

/// Returns the IPv4 address of the interface used for outbound traffic, or
/// `None` when there is no usable route.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    if let Err(e) = probe.connect(PROBE_TARGET) {
        debug!("local_ipv4: no outbound route: {e}");
        return None;
    }
    match probe.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
