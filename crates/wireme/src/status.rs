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

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;
use wireme_types::{InterfaceState, InterfaceView, LiveStatusEntry, PeerView};

use crate::allocate::interface_network_and_ip;
use crate::document::ConfigDocument;
use crate::identity::fingerprint;

/// Parse `wg show <iface> dump` output into entries keyed by public key.
///
/// The first row describes the interface itself and is skipped, as are rows
/// with fewer than eight fields.
pub fn parse_dump(dump: &str) -> HashMap<String, LiveStatusEntry> {
    let mut live = HashMap::new();
    for (i, row) in dump.lines().enumerate().skip(1) {
        let fields: Vec<&str> = row.split('\t').collect();
        let [public_key, _psk, endpoint, allowed_ips, handshake, rx, tx, keepalive, ..] =
            fields.as_slice()
        else {
            debug!(row = i, field_count = fields.len(), "skipping short dump row");
            continue;
        };
        live.insert(
            public_key.to_string(),
            LiveStatusEntry {
                endpoint: endpoint.to_string(),
                allowed_ips: allowed_ips.to_string(),
                latest_handshake: handshake.to_string(),
                rx_bytes: rx.to_string(),
                tx_bytes: tx.to_string(),
                persistent_keepalive: keepalive.to_string(),
            },
        );
    }
    live
}

/// Render a handshake epoch as an age relative to `now` (unix seconds).
pub fn format_handshake(epoch: &str, now: i64) -> String {
    let Ok(epoch) = epoch.trim().parse::<i64>() else {
        return "-".to_string();
    };
    if epoch == 0 {
        return "never".to_string();
    }
    let age = now.saturating_sub(epoch).max(0);
    match age {
        0..60 => format!("{age}s"),
        60..3600 => format!("{}m", age / 60),
        3600..86400 => format!("{}h", age / 3600),
        _ => format!("{}d", age / 86400),
    }
}

/// Merge static peers with live status. `live` is `None` when the runtime
/// could not be queried.
pub fn merge(
    name: &str,
    config_path: &Path,
    doc: &ConfigDocument,
    live: Option<&HashMap<String, LiveStatusEntry>>,
    state: InterfaceState,
    now: i64,
) -> InterfaceView {
    let iface = doc.interface();
    let (network, interface_ip) = iface
        .address
        .as_deref()
        .and_then(interface_network_and_ip)
        .map(|(net, ip)| (Some(net.to_string()), Some(ip.to_string())))
        .unwrap_or_default();

    let peers = doc
        .peers()
        .iter()
        .enumerate()
        .map(|(index, peer)| {
            let public_key = peer.public_key.clone();
            let entry = public_key
                .as_deref()
                .and_then(|pk| live.and_then(|l| l.get(pk)))
                .cloned();
            let handshake = format_handshake(
                entry.as_ref().map_or("0", |e| e.latest_handshake.as_str()),
                now,
            );
            let endpoint = peer
                .endpoint
                .clone()
                .or_else(|| entry.as_ref().map(|e| e.endpoint.clone()))
                .filter(|e| e != "(none)");

            PeerView {
                index,
                name: peer.metadata.name.clone(),
                created: peer.metadata.created.clone(),
                profile: peer.metadata.profile.clone(),
                note: peer.metadata.note.clone(),
                fingerprint: fingerprint(public_key.as_deref().unwrap_or_default()),
                public_key,
                allowed_ips: peer.allowed_ips.clone(),
                endpoint,
                has_preshared_key: peer.preshared_key.is_some(),
                handshake,
                live: entry,
            }
        })
        .collect();

    InterfaceView {
        name: name.to_string(),
        config_path: config_path.display().to_string(),
        address: iface.address.clone(),
        listen_port: iface.listen_port.clone(),
        dns: iface.dns.clone(),
        network,
        interface_ip,
        state,
        peers,
    }
}
