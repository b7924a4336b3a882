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

//! Installing a client config received from a server operator.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;
use tracing::info;

use crate::mutate::{self, MutationError};

static IFACE_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#\s*iface\s*:\s*([a-zA-Z0-9_.-]+)\s*$").expect("iface hint pattern compiles")
});
static IFACE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_.-]{1,32}$").expect("iface name pattern compiles"));

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("invalid client config: {0}")]
    InvalidConfig(&'static str),

    #[error("invalid interface name {0:?}")]
    InvalidInterface(String),

    #[error("failed to create {}: {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Mutation(#[from] MutationError),
}

#[derive(Debug)]
pub struct InstallOutcome {
    pub path: PathBuf,
    /// Set when an existing config was replaced.
    pub backup: Option<PathBuf>,
}

/// Interface name from a `# iface: <name>` comment, if the config has one.
pub fn interface_hint(text: &str) -> Option<&str> {
    text.lines()
        .find_map(|line| IFACE_HINT.captures(line.trim())?.get(1))
        .map(|m| m.as_str())
}

pub fn valid_interface_name(name: &str) -> bool {
    IFACE_NAME.is_match(name)
}

/// Structural sanity check. Not a full grammar check.
pub fn validate_client_config(text: &str) -> Result<(), InstallError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(InstallError::InvalidConfig("empty config"));
    }
    if !text.contains("[Interface]") {
        return Err(InstallError::InvalidConfig("missing [Interface] section"));
    }
    if !text.contains("PrivateKey") {
        return Err(InstallError::InvalidConfig("missing PrivateKey"));
    }
    if !text.contains("[Peer]") {
        return Err(InstallError::InvalidConfig("missing [Peer] section"));
    }
    Ok(())
}

#[cfg(unix)]
async fn restrict(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn restrict(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Write `text` as `<wireguard_dir>/<interface>.conf` with mode 0600. An
/// existing file is backed up first and replaced atomically.
#[tracing::instrument(skip_all, fields(interface = %interface))]
pub async fn install(
    wireguard_dir: &Path,
    interface: &str,
    text: &str,
    now: DateTime<Utc>,
) -> Result<InstallOutcome, InstallError> {
    validate_client_config(text)?;
    if !valid_interface_name(interface) {
        return Err(InstallError::InvalidInterface(interface.to_string()));
    }

    tokio::fs::create_dir_all(wireguard_dir)
        .await
        .map_err(|source| InstallError::CreateDir {
            path: wireguard_dir.to_path_buf(),
            source,
        })?;

    let path = wireguard_dir.join(format!("{interface}.conf"));
    let contents = format!("{}\n", text.trim_end());
    let write_err = |source| InstallError::Write {
        path: path.clone(),
        source,
    };

    let backup = if tokio::fs::try_exists(&path).await.map_err(write_err)? {
        Some(mutate::commit(&path, &contents, now).await?)
    } else {
        mutate::write_atomic(&path, &contents)
            .await
            .map_err(write_err)?;
        None
    };
    restrict(&path).await.map_err(write_err)?;

    info!(
        path = %path.display(),
        backup = ?backup.as_ref().map(|b| b.display().to_string()),
        "installed client config"
    );
    Ok(InstallOutcome { path, backup })
}
