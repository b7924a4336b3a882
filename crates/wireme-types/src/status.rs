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

//! Runtime status as reported by `wg show <iface> dump`.

use serde::{Deserialize, Serialize};

/// One peer row of a runtime status dump. Values are kept exactly as the
/// tool printed them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveStatusEntry {
    /// Current endpoint, or `(none)`.
    pub endpoint: String,
    /// Comma-separated allowed IPs.
    pub allowed_ips: String,
    /// Unix epoch seconds of the latest handshake, `0` if none.
    pub latest_handshake: String,
    /// Bytes received from the peer.
    pub rx_bytes: String,
    /// Bytes sent to the peer.
    pub tx_bytes: String,
    /// Persistent keepalive interval, or `off`.
    pub persistent_keepalive: String,
}
