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

//! Client profiles and the defaults they imply for a generated client config.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;

use crate::allocate::{interface_network_and_ip, single_host};

const FALLBACK_NETWORK: &str = "10.0.0.0/24";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    /// Reach the server only.
    #[default]
    Desktop,
    /// Reach the whole VPN network, with DNS pushed.
    Smartphone,
}

#[derive(Debug, Error)]
#[error("unknown profile {0:?}, expected desktop or smartphone")]
pub struct UnknownProfile(String);

impl Profile {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Smartphone => "smartphone",
        }
    }

    /// AllowedIPs for the client side, given the server's `Address` field and
    /// the endpoint the client will dial.
    pub fn client_routes(self, addr_field: &str, endpoint: &str) -> String {
        let iface = interface_network_and_ip(addr_field);
        match self {
            Self::Desktop => iface
                .map(|(_, ip)| single_host(ip).to_string())
                .unwrap_or_default(),
            Self::Smartphone => {
                let network = iface.map_or_else(|| FALLBACK_NETWORK.to_string(), |(n, _)| n.to_string());
                match endpoint.parse::<SocketAddr>() {
                    Ok(addr) => format!("{network}, {}", single_host(addr.ip())),
                    Err(_) => network,
                }
            }
        }
    }

    pub fn default_dns(self, smartphone_dns: &str) -> Option<String> {
        match self {
            Self::Desktop => None,
            Self::Smartphone => Some(smartphone_dns.to_string()).filter(|d| !d.is_empty()),
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Profile {
    type Err = UnknownProfile;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "desktop" => Ok(Self::Desktop),
            "smartphone" => Ok(Self::Smartphone),
            _ => Err(UnknownProfile(s.to_string())),
        }
    }
}
