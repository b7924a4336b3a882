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

//! Client configurations saved next to the server config, one file per peer.

use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::identity::{Identity, fingerprint};

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern compiles"));
static DISALLOWED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9._-]").expect("name pattern compiles"));

const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to create {}: {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to list {}: {source}", path.display())]
    List { path: PathBuf, source: io::Error },
}

/// Reduce a free-form peer name to something safe for filenames and
/// metadata comments. Returns an empty string if nothing usable remains.
pub fn sanitize_name(name: &str) -> String {
    let dashed = WHITESPACE.replace_all(name.trim(), "-");
    let cleaned = DISALLOWED.replace_all(&dashed, "");
    let trimmed = cleaned.trim_matches(|c| matches!(c, '.' | '_' | '-'));
    trimmed.chars().take(MAX_NAME_LEN).collect()
}

/// Directory holding saved client configs for one interface.
pub fn interface_dir(clients_dir: &Path, interface: &str) -> PathBuf {
    clients_dir.join(interface)
}

pub fn file_name(name: &str, public_key: &str) -> String {
    format!("{name}--{}.conf", fingerprint(public_key))
}

fn collision_file_name(name: &str, public_key: &str, now: DateTime<Utc>) -> String {
    format!("{name}--{}--{}.conf", fingerprint(public_key), now.timestamp())
}

/// Inputs for a client-side wg-quick configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig<'a> {
    pub name: &'a str,
    pub created: &'a str,
    pub profile: &'a str,
    pub private_key: &'a str,
    pub address: &'a str,
    pub dns: Option<&'a str>,
    pub server_public_key: &'a str,
    pub preshared_key: Option<&'a str>,
    pub endpoint: &'a str,
    pub allowed_ips: Option<&'a str>,
    pub persistent_keepalive: u16,
}

impl ClientConfig<'_> {
    pub fn render(&self) -> String {
        let mut config = String::new();
        writeln!(config, "# name: {}", self.name).unwrap();
        writeln!(config, "# created: {}", self.created).unwrap();
        writeln!(config, "# profile: {}", self.profile).unwrap();
        writeln!(config, "[Interface]").unwrap();
        writeln!(config, "PrivateKey = {}", self.private_key.trim()).unwrap();
        writeln!(config, "Address = {}", self.address).unwrap();
        if let Some(dns) = self.dns.filter(|d| !d.is_empty()) {
            writeln!(config, "DNS = {dns}").unwrap();
        }
        writeln!(config).unwrap();
        writeln!(config, "[Peer]").unwrap();
        writeln!(config, "PublicKey = {}", self.server_public_key).unwrap();
        if let Some(psk) = self.preshared_key.filter(|p| !p.is_empty()) {
            writeln!(config, "PresharedKey = {psk}").unwrap();
        }
        writeln!(config, "Endpoint = {}", self.endpoint).unwrap();
        if let Some(allowed) = self.allowed_ips.filter(|a| !a.is_empty()) {
            writeln!(config, "AllowedIPs = {allowed}").unwrap();
        }
        writeln!(config, "PersistentKeepalive = {}", self.persistent_keepalive).unwrap();
        config
    }
}

async fn create_private(path: &Path, contents: &str) -> io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await?;
    file.write_all(contents.as_bytes()).await?;
    file.sync_all().await
}

/// Save a client config as `<name>--<fingerprint>.conf` under `dir`. An
/// existing file is never overwritten: a timestamp suffix is added instead.
#[tracing::instrument(skip_all, fields(dir = %dir.display(), name = %name))]
pub async fn save(
    dir: &Path,
    name: &str,
    public_key: &str,
    contents: &str,
    now: DateTime<Utc>,
) -> Result<PathBuf, CredentialError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| CredentialError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;

    let mut path = dir.join(file_name(name, public_key));
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        debug!(path = %path.display(), "credential file exists, adding timestamp suffix");
        path = dir.join(collision_file_name(name, public_key, now));
    }

    create_private(&path, contents)
        .await
        .map_err(|source| CredentialError::Write {
            path: path.clone(),
            source,
        })?;

    info!(path = %path.display(), "saved client config");
    Ok(path)
}

/// Saved `*.conf` files under `dir`, sorted. A missing directory is empty.
pub async fn list(dir: &Path) -> Result<Vec<PathBuf>, CredentialError> {
    let list_err = |source: io::Error| CredentialError::List {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(list_err(e)),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(list_err)? {
        let path = entry.path();
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if is_file && path.extension().is_some_and(|ext| ext == "conf") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// The first non-empty `PrivateKey` directive in a config, in any section.
pub fn private_key_from_text(text: &str) -> Option<&str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .find_map(|(key, value)| {
            let value = value.trim();
            (key.trim() == "PrivateKey" && !value.is_empty()).then_some(value)
        })
}

/// Saved configs under `dir` whose private key derives to `public_key`.
/// Unreadable files and bad keys are skipped.
pub async fn find_matching<I: Identity>(dir: &Path, public_key: &str) -> Vec<PathBuf> {
    let files = match list(dir).await {
        Ok(files) => files,
        Err(e) => {
            warn!(error = %e, "could not scan saved client configs");
            return Vec::new();
        }
    };

    let mut matches = Vec::new();
    for path in files {
        let text = match tokio::fs::read(&path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable client config");
                continue;
            }
        };
        let Some(private_key) = private_key_from_text(&text) else {
            continue;
        };
        match I::public_key(private_key) {
            Ok(derived) if derived == public_key => matches.push(path),
            Ok(_) => {}
            Err(e) => debug!(path = %path.display(), error = %e, "skipping client config with bad key"),
        }
    }
    debug!(count = matches.len(), "matched saved client configs");
    matches
}

#[derive(Debug, Default)]
pub struct RemovalReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, io::Error)>,
}

/// Delete exactly the given files, continuing past failures.
pub async fn remove(paths: &[PathBuf]) -> RemovalReport {
    let mut report = RemovalReport::default();
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                info!(path = %path.display(), "removed saved client config");
                report.removed.push(path.clone());
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to remove saved client config");
                report.failed.push((path.clone(), e));
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("Dad's Laptop", "Dads-Laptop" ; "spaces and quote")]
    #[test_case("  --phone.  ", "phone" ; "trim separators")]
    #[test_case("a\t\tb", "a-b" ; "whitespace run")]
    #[test_case("ünïcode", "ncode" ; "non ascii dropped")]
    #[test_case("!!!", "" ; "nothing left")]
    fn sanitizes(input: &str, expected: &str) {
        assert_eq!(sanitize_name(input), expected);
    }

    #[test]
    fn sanitize_truncates() {
        let long = "x".repeat(100);
        assert_eq!(sanitize_name(&long).len(), MAX_NAME_LEN);
    }

    #[test]
    fn file_name_has_fingerprint() {
        assert_eq!(file_name("phone", "abc"), "phone--ba7816bf.conf");
    }

    #[test_case("[Interface]\nPrivateKey = abc=\n", Some("abc=") ; "interface key")]
    #[test_case("# PrivateKey = commented\n[Peer]\nPrivateKey=x\n", Some("x") ; "skips comments")]
    #[test_case("PrivateKey =\nPrivateKey = y\n", Some("y") ; "skips empty value")]
    #[test_case("[Peer]\nPublicKey = z\n", None ; "absent")]
    fn extracts_private_key(text: &str, expected: Option<&str>) {
        assert_eq!(private_key_from_text(text), expected);
    }

    #[test]
    fn client_config_layout() {
        let config = ClientConfig {
            name: "phone",
            created: "2025-01-01T00:00:00Z",
            profile: "smartphone",
            private_key: "PRIV\n",
            address: "10.0.0.2/32",
            dns: Some("1.1.1.1"),
            server_public_key: "SPUB",
            preshared_key: None,
            endpoint: "vpn.example.com:51820",
            allowed_ips: Some("10.0.0.0/24"),
            persistent_keepalive: 25,
        };
        assert_eq!(
            config.render(),
            "# name: phone\n# created: 2025-01-01T00:00:00Z\n# profile: smartphone\n\
             [Interface]\nPrivateKey = PRIV\nAddress = 10.0.0.2/32\nDNS = 1.1.1.1\n\n\
             [Peer]\nPublicKey = SPUB\nEndpoint = vpn.example.com:51820\n\
             AllowedIPs = 10.0.0.0/24\nPersistentKeepalive = 25\n"
        );
    }
}
