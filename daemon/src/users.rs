// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Requesting-user checks: the configured allow-list, name-to-uid
//! resolution, and a best-effort verification that the TCP peer really
//! belongs to the claimed user, via the kernel's socket table.

use std::collections::BTreeSet;
use std::net::SocketAddr;

/// Resolves a user name against the OS account database.
#[must_use]
pub fn resolve_uid(user_name: &str) -> Option<u32> {
    ::users::get_user_by_name(user_name).map(|user| user.uid())
}

/// Whether the allow-list admits this user. An empty list admits
/// everyone.
#[must_use]
pub fn user_allowed(allowed: &BTreeSet<String>, user_name: &str) -> bool {
    allowed.is_empty() || allowed.contains(user_name)
}

/// The uid owning the client side of a loopback TCP connection, resolved
/// through `/proc/net/tcp`. `None` when the socket cannot be found, in
/// which case the caller proceeds on the allow-list alone.
#[must_use]
pub fn connection_uid(peer: SocketAddr) -> Option<u32> {
    let table = std::fs::read_to_string("/proc/net/tcp").ok()?;
    find_socket_uid(&table, peer)
}

/// Scans a `/proc/net/tcp` table for the socket whose local address is
/// the peer of our accepted connection.
fn find_socket_uid(table: &str, peer: SocketAddr) -> Option<u32> {
    let SocketAddr::V4(peer) = peer else {
        return None;
    };

    // local_address is little-endian hex: 0100007F:1F90 is 127.0.0.1:8080.
    let octets = peer.ip().octets();
    let wanted = format!(
        "{:02X}{:02X}{:02X}{:02X}:{:04X}",
        octets[3], octets[2], octets[1], octets[0],
        peer.port()
    );

    for line in table.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let _slot = fields.next()?;
        let local = fields.next()?;

        if local != wanted {
            continue;
        }

        // sl local rem st tx_queue:rx_queue tr:tm->when retrnsmt uid
        return fields.nth(5).and_then(|uid| uid.parse::<u32>().ok());
    }

    None
}
