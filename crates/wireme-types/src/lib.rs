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

//! wireme-types: Shared view type definitions for wireme.
//!
//! This crate contains the data models produced when a WireGuard
//! configuration file is merged with live runtime status, shared between the
//! core library and the command line front end.

#![warn(missing_docs)]

pub mod status;

use serde::{Deserialize, Serialize};

pub use status::LiveStatusEntry;

/// Whether the runtime reports a live device for an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceState {
    /// The status query succeeded.
    Up,
    /// The status tool ran but reported no such device.
    Down,
    /// The status tool is missing or timed out.
    Unknown,
}

impl std::fmt::Display for InterfaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A configured WireGuard interface together with its peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceView {
    /// Interface name, taken from the config file stem (e.g. `wg0`).
    pub name: String,
    /// Path of the configuration file this view was parsed from.
    pub config_path: String,
    /// Raw `Address` directive.
    pub address: Option<String>,
    /// Raw `ListenPort` directive.
    pub listen_port: Option<String>,
    /// Raw `DNS` directive.
    pub dns: Option<String>,
    /// Network containing the interface address, with prefix.
    pub network: Option<String>,
    /// The interface's own VPN address, without prefix.
    pub interface_ip: Option<String>,
    /// Runtime state of the device.
    pub state: InterfaceState,
    /// Peers in file order.
    pub peers: Vec<PeerView>,
}

/// A single peer, static configuration merged with live status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerView {
    /// Position of the peer in the configuration file.
    pub index: usize,
    /// Human-readable name from the peer's metadata comments.
    pub name: Option<String>,
    /// Creation timestamp from the peer's metadata comments.
    pub created: Option<String>,
    /// Device profile (e.g. "desktop", "smartphone").
    pub profile: Option<String>,
    /// Free-form operator note.
    pub note: Option<String>,
    /// WireGuard public key.
    pub public_key: Option<String>,
    /// Short hash of the public key, used in saved credential filenames.
    pub fingerprint: String,
    /// Configured `AllowedIPs`.
    pub allowed_ips: Option<String>,
    /// Configured endpoint, falling back to the live endpoint.
    pub endpoint: Option<String>,
    /// Whether a pre-shared key is configured.
    pub has_preshared_key: bool,
    /// Handshake age rendered for display ("never", "42s", "3h", ...).
    pub handshake: String,
    /// Live session data, if the runtime knows this peer.
    pub live: Option<LiveStatusEntry>,
}

impl PeerView {
    /// Name for display, with a placeholder for unnamed peers.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("(unnamed)")
    }

    /// True when the runtime has never completed a handshake with this peer.
    pub fn never_connected(&self) -> bool {
        self.handshake == "never"
    }
}
