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

//! Line-preserving model of a wg-quick configuration file.
//!
//! The document keeps every raw line (terminator included) exactly as read.
//! Interface and peer fields are extracted on top of that, and each peer only
//! records the half-open range of line indices it owns.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, trace};

/// Prefix of the metadata tags wireme writes above each peer.
pub const META_PREFIX: &str = "wireme-";

static META_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#\s*wireme-([a-zA-Z0-9_-]+)\s*:\s*(.*)$").expect("metadata pattern compiles")
});

/// Match a `# wireme-<key>: <value>` comment, returning key and trimmed value.
pub fn parse_metadata(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if !line.starts_with('#') || !line.contains(META_PREFIX) {
        return None;
    }
    let caps = META_RE.captures(line)?;
    let key = caps.get(1)?.as_str();
    let value = caps.get(2)?.as_str().trim();
    Some((key, value))
}

/// True for lines that are empty or whitespace only.
pub fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceFields {
    pub address: Option<String>,
    pub listen_port: Option<String>,
    pub private_key: Option<String>,
    pub dns: Option<String>,
}

impl InterfaceFields {
    fn set(&mut self, key: &str, value: &str) -> bool {
        let slot = match key {
            "Address" => &mut self.address,
            "ListenPort" => &mut self.listen_port,
            "PrivateKey" => &mut self.private_key,
            "DNS" => &mut self.dns,
            _ => return false,
        };
        *slot = Some(value.to_string());
        true
    }
}

/// Metadata attached to a peer through `# wireme-*` comments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerMetadata {
    pub name: Option<String>,
    pub created: Option<String>,
    pub profile: Option<String>,
    pub note: Option<String>,
    /// Tags wireme does not interpret, kept for display.
    pub extra: BTreeMap<String, String>,
}

impl PeerMetadata {
    fn from_pending(pending: BTreeMap<String, String>) -> Self {
        let mut meta = Self::default();
        for (key, value) in pending {
            match key.as_str() {
                "name" => meta.name = Some(value),
                "created" => meta.created = Some(value),
                "profile" => meta.profile = Some(value),
                "note" => meta.note = Some(value),
                _ => {
                    meta.extra.insert(key, value);
                }
            }
        }
        meta
    }
}

/// A `[Peer]` section. Owns no text, only the line range `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub public_key: Option<String>,
    pub allowed_ips: Option<String>,
    pub endpoint: Option<String>,
    pub preshared_key: Option<String>,
    pub persistent_keepalive: Option<String>,
    pub metadata: PeerMetadata,
    /// Index of the `[Peer]` header line.
    pub start: usize,
    /// Index of the next section header, or the line count.
    pub end: usize,
}

impl PeerRecord {
    fn open(start: usize, metadata: PeerMetadata) -> Self {
        Self {
            public_key: None,
            allowed_ips: None,
            endpoint: None,
            preshared_key: None,
            persistent_keepalive: None,
            metadata,
            start,
            end: start,
        }
    }

    fn set(&mut self, key: &str, value: &str) -> bool {
        let slot = match key {
            "PublicKey" => &mut self.public_key,
            "AllowedIPs" => &mut self.allowed_ips,
            "Endpoint" => &mut self.endpoint,
            "PresharedKey" => &mut self.preshared_key,
            "PersistentKeepalive" => &mut self.persistent_keepalive,
            _ => return false,
        };
        *slot = Some(value.to_string());
        true
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Comma-separated `AllowedIPs` entries, trimmed, empties dropped.
    pub fn allowed_ip_entries(&self) -> impl Iterator<Item = &str> {
        self.allowed_ips
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Interface,
    Peer,
}

/// Parsed snapshot of a configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDocument {
    lines: Vec<String>,
    interface: InterfaceFields,
    peers: Vec<PeerRecord>,
}

impl ConfigDocument {
    /// Parse raw file text. Never fails: unknown or malformed lines are kept
    /// verbatim and simply leave fields unset.
    pub fn parse(text: &str) -> Self {
        let lines: Vec<String> = text.split_inclusive('\n').map(str::to_string).collect();

        let mut interface = InterfaceFields::default();
        let mut peers: Vec<PeerRecord> = Vec::new();
        let mut section = Section::None;
        let mut current: Option<PeerRecord> = None;
        let mut pending: BTreeMap<String, String> = BTreeMap::new();

        let mut close_peer = |current: &mut Option<PeerRecord>, end: usize| {
            if let Some(mut peer) = current.take() {
                peer.end = end;
                peers.push(peer);
            }
        };

        for (i, raw) in lines.iter().enumerate() {
            let line = raw.trim();

            if let Some((key, value)) = parse_metadata(line) {
                pending.insert(key.to_string(), value.to_string());
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                close_peer(&mut current, i);
                match line.to_ascii_lowercase().as_str() {
                    "[interface]" => section = Section::Interface,
                    "[peer]" => {
                        section = Section::Peer;
                        let metadata = PeerMetadata::from_pending(std::mem::take(&mut pending));
                        current = Some(PeerRecord::open(i, metadata));
                    }
                    other => {
                        trace!(line = i, section = other, "untracked section");
                        section = Section::None;
                    }
                }
                pending.clear();
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                if !line.is_empty() && !line.starts_with('#') {
                    trace!(line = i, "unrecognized line left untouched");
                }
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            let tracked = match section {
                Section::Interface => interface.set(key, value),
                Section::Peer => current.as_mut().is_some_and(|p| p.set(key, value)),
                Section::None => false,
            };
            if !tracked {
                trace!(line = i, key, "untracked directive");
            }
        }
        close_peer(&mut current, lines.len());

        debug!(
            line_count = lines.len(),
            peer_count = peers.len(),
            "parsed configuration"
        );

        Self {
            lines,
            interface,
            peers,
        }
    }

    /// Read and parse a configuration file. Invalid UTF-8 is replaced rather
    /// than rejected.
    pub async fn read(path: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Ok(Self::parse(&String::from_utf8_lossy(&bytes)))
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn interface(&self) -> &InterfaceFields {
        &self.interface
    }

    pub fn peers(&self) -> &[PeerRecord] {
        &self.peers
    }

    pub fn peer(&self, index: usize) -> Option<&PeerRecord> {
        self.peers.get(index)
    }

    /// Index of the first peer whose metadata name equals `name`.
    pub fn find_peer_by_name(&self, name: &str) -> Option<usize> {
        self.peers
            .iter()
            .position(|p| p.metadata.name.as_deref() == Some(name))
    }

    /// Raw lines owned by a peer.
    pub fn peer_lines(&self, peer: &PeerRecord) -> &[String] {
        &self.lines[peer.range()]
    }
}

impl fmt::Display for ConfigDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            f.write_str(line)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const SAMPLE: &str = "\
[Interface]
Address = 10.0.0.1/24
ListenPort = 51820
PrivateKey = c2VydmVyLXByaXZhdGUta2V5LWJ5dGVzLTMyLWxvbmc=
PostUp = iptables -A FORWARD -i %i -j ACCEPT

# wireme-name: laptop
# wireme-created: 2025-01-01T00:00:00Z
# wireme-profile: desktop
[Peer]
PublicKey = bGFwdG9wLXB1YmxpYy1rZXk=
AllowedIPs = 10.0.0.2/32

# hand-added
[peer]
PublicKey = cGhvbmUtcHVibGljLWtleQ==
AllowedIPs = 10.0.0.3/32, fd00::3/128
PersistentKeepalive = 25
";

    #[test]
    fn round_trip_is_byte_identical() {
        let doc = ConfigDocument::parse(SAMPLE);
        assert_eq!(doc.to_string(), SAMPLE);
    }

    #[test_case("" ; "empty")]
    #[test_case("[Interface]\nAddress = 10.0.0.1/24" ; "no trailing newline")]
    #[test_case("[Interface]\r\nAddress = 10.0.0.1/24\r\n" ; "crlf")]
    #[test_case("garbage\n\n[\n]\n[]\n= = =\n" ; "junk")]
    fn round_trip_edge_cases(text: &str) {
        assert_eq!(ConfigDocument::parse(text).to_string(), text);
    }

    #[test]
    fn interface_fields() {
        let doc = ConfigDocument::parse(SAMPLE);
        let iface = doc.interface();
        assert_eq!(iface.address.as_deref(), Some("10.0.0.1/24"));
        assert_eq!(iface.listen_port.as_deref(), Some("51820"));
        assert_eq!(
            iface.private_key.as_deref(),
            Some("c2VydmVyLXByaXZhdGUta2V5LWJ5dGVzLTMyLWxvbmc=")
        );
        assert_eq!(iface.dns, None);
    }

    #[test]
    fn peer_ranges_and_fields() {
        let doc = ConfigDocument::parse(SAMPLE);
        let peers = doc.peers();
        assert_eq!(peers.len(), 2);

        assert_eq!(peers[0].range(), 9..14);
        assert_eq!(peers[0].public_key.as_deref(), Some("bGFwdG9wLXB1YmxpYy1rZXk="));
        assert_eq!(peers[0].metadata.name.as_deref(), Some("laptop"));
        assert_eq!(peers[0].metadata.profile.as_deref(), Some("desktop"));
        assert_eq!(peers[0].metadata.note, None);

        assert_eq!(peers[1].range(), 14..18);
        assert_eq!(peers[1].persistent_keepalive.as_deref(), Some("25"));
        assert_eq!(peers[1].metadata, PeerMetadata::default());
        assert_eq!(
            peers[1].allowed_ip_entries().collect::<Vec<_>>(),
            vec!["10.0.0.3/32", "fd00::3/128"]
        );
        assert_eq!(doc.peer_lines(&peers[1])[0], "[peer]\n");
    }

    #[test]
    fn ranges_are_disjoint_and_sorted() {
        let doc = ConfigDocument::parse(SAMPLE);
        for pair in doc.peers().windows(2) {
            assert!(pair[0].end <= pair[1].start);
        }
        assert!(doc.peers().iter().all(|p| p.end <= doc.lines().len()));
    }

    #[test]
    fn unknown_section_closes_peer() {
        let text = "[Peer]\nPublicKey = a\n[Other]\nPublicKey = b\n";
        let doc = ConfigDocument::parse(text);
        assert_eq!(doc.peers().len(), 1);
        assert_eq!(doc.peers()[0].range(), 0..2);
        assert_eq!(doc.peers()[0].public_key.as_deref(), Some("a"));
    }

    #[test]
    fn metadata_cleared_by_interface_header() {
        let text = "# wireme-name: stale\n[Interface]\n[Peer]\nPublicKey = a\n";
        let doc = ConfigDocument::parse(text);
        assert_eq!(doc.peers()[0].metadata.name, None);
    }

    #[test]
    fn unknown_metadata_kept_as_extra() {
        let text = "# wireme-owner: ops\n# wireme-note:  keep me  \n[Peer]\n";
        let doc = ConfigDocument::parse(text);
        let meta = &doc.peers()[0].metadata;
        assert_eq!(meta.note.as_deref(), Some("keep me"));
        assert_eq!(meta.extra.get("owner").map(String::as_str), Some("ops"));
    }

    #[test]
    fn values_split_on_first_equals() {
        let text = "[Peer]\nPresharedKey = abc==\n";
        let doc = ConfigDocument::parse(text);
        assert_eq!(doc.peers()[0].preshared_key.as_deref(), Some("abc=="));
    }

    #[test]
    fn fields_outside_sections_ignored() {
        let doc = ConfigDocument::parse("Address = 10.0.0.1/24\n[Peer]\nAddress = x\n");
        assert_eq!(doc.interface().address, None);
        assert_eq!(doc.peers()[0].allowed_ips, None);
    }

    #[test]
    fn find_by_name() {
        let doc = ConfigDocument::parse(SAMPLE);
        assert_eq!(doc.find_peer_by_name("laptop"), Some(0));
        assert_eq!(doc.find_peer_by_name("phone"), None);
    }

    #[test_case("# wireme-name: laptop", Some(("name", "laptop")) ; "plain")]
    #[test_case("  #wireme-created:2025  ", Some(("created", "2025")) ; "tight spacing")]
    #[test_case("# wireme-bad key: x", None ; "space in key")]
    #[test_case("# name: laptop", None ; "no prefix")]
    #[test_case("PublicKey = wireme-x: y", None ; "not a comment")]
    fn metadata_pattern(line: &str, expected: Option<(&str, &str)>) {
        assert_eq!(parse_metadata(line), expected);
    }
}
