// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::collections::HashSet;
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use tracing::debug;

use crate::document::PeerRecord;

/// Parse the first entry of an `Address` directive into the interface
/// address with its prefix.
pub fn interface_address(addr_field: &str) -> Option<IpNetwork> {
    let first = addr_field.split(',').next()?.trim();
    if first.is_empty() {
        return None;
    }
    first.parse().ok()
}

/// The network containing the interface, and the interface's own address.
pub fn interface_network_and_ip(addr_field: &str) -> Option<(IpNetwork, IpAddr)> {
    let iface = interface_address(addr_field)?;
    let network = IpNetwork::new(iface.network(), iface.prefix()).ok()?;
    Some((network, iface.ip()))
}

/// A network with the single-host prefix for this address family.
pub fn single_host(addr: IpAddr) -> IpNetwork {
    let prefix = if addr.is_ipv4() { 32 } else { 128 };
    IpNetwork::new(addr, prefix).expect("full-length prefix is always valid")
}

/// Accept either a CIDR or a bare address, widening the latter to a single
/// host network.
pub fn parse_peer_address(input: &str) -> Option<IpNetwork> {
    let input = input.trim();
    if input.contains('/') {
        input.parse().ok()
    } else {
        input.parse::<IpAddr>().ok().map(single_host)
    }
}

/// Network and broadcast (IPv4) or subnet-router anycast (IPv6) addresses
/// are not handed out, except on point-to-point sized networks.
fn is_reserved(network: IpNetwork, addr: IpAddr) -> bool {
    match network {
        IpNetwork::V4(v4) => {
            v4.prefix() < 31 && (addr == IpAddr::V4(v4.network()) || addr == IpAddr::V4(v4.broadcast()))
        }
        IpNetwork::V6(v6) => v6.prefix() < 127 && addr == IpAddr::V6(v6.network()),
    }
}

fn used_addresses(interface_ip: IpAddr, peers: &[PeerRecord]) -> HashSet<IpAddr> {
    let mut used = HashSet::from([interface_ip]);
    for peer in peers {
        for entry in peer.allowed_ip_entries() {
            match entry.parse::<IpNetwork>() {
                Ok(net) => {
                    used.insert(net.ip());
                }
                Err(_) => debug!(entry, "skipping malformed AllowedIPs entry"),
            }
        }
    }
    used
}

/// Lowest free host address in the interface network, as a single-host
/// network. `None` when the address field is unusable or the network is full.
pub fn next_free_address(addr_field: &str, peers: &[PeerRecord]) -> Option<IpNetwork> {
    let (network, interface_ip) = interface_network_and_ip(addr_field)?;
    let used = used_addresses(interface_ip, peers);

    let found = network
        .iter()
        .filter(|addr| !is_reserved(network, *addr))
        .find(|addr| !used.contains(addr))
        .map(single_host);

    debug!(
        %network,
        used = used.len(),
        found = ?found.map(|n| n.to_string()),
        "address allocation"
    );
    found
}
