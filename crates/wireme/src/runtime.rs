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
use std::future::Future;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};
use wireme_types::{InterfaceState, LiveStatusEntry};

use crate::status::parse_dump;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{tool} not found in PATH")]
    ToolMissing { tool: &'static str },

    #[error("{tool} timed out after {}s", timeout.as_secs())]
    Timeout {
        tool: &'static str,
        timeout: Duration,
    },

    #[error("{tool} failed ({status}): {stderr}")]
    Failed {
        tool: &'static str,
        status: String,
        stderr: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RuntimeError {
    /// The tool could not give an answer at all, as opposed to answering
    /// with a failure.
    pub fn is_unavailable(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

/// The live WireGuard runtime, queried and updated through external tools.
pub trait Runtime {
    /// Raw `wg show <iface> dump` output.
    fn dump(
        interface: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<String, RuntimeError>> + Send;

    /// Load the on-disk config into the running interface without tearing
    /// down existing sessions.
    fn apply(
        interface: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    /// Bring an interface up from its config file.
    fn up(interface: &str, timeout: Duration)
    -> impl Future<Output = Result<(), RuntimeError>> + Send;

    /// Tear an interface down.
    fn down(
        interface: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    /// Best guess at this host's public IPv4 address.
    fn public_ipv4(
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<Ipv4Addr>, RuntimeError>> + Send;
}

/// `wg` and `wg-quick` from wireguard-tools.
pub struct WgTools;

impl Runtime for WgTools {
    async fn dump(interface: &str, timeout: Duration) -> Result<String, RuntimeError> {
        run("wg", &["show", interface, "dump"], None, timeout).await
    }

    async fn apply(interface: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let stripped = run("wg-quick", &["strip", interface], None, timeout).await?;
        run(
            "wg",
            &["syncconf", interface, "/dev/stdin"],
            Some(stripped.as_bytes()),
            timeout,
        )
        .await?;
        info!(interface, "applied configuration to running interface");
        Ok(())
    }

    async fn up(interface: &str, timeout: Duration) -> Result<(), RuntimeError> {
        run("wg-quick", &["up", interface], None, timeout).await?;
        info!(interface, "interface up");
        Ok(())
    }

    async fn down(interface: &str, timeout: Duration) -> Result<(), RuntimeError> {
        run("wg-quick", &["down", interface], None, timeout).await?;
        info!(interface, "interface down");
        Ok(())
    }

    async fn public_ipv4(timeout: Duration) -> Result<Option<Ipv4Addr>, RuntimeError> {
        let out = run(
            "ip",
            &["-4", "-o", "addr", "show", "scope", "global"],
            None,
            timeout,
        )
        .await?;
        Ok(pick_public_ipv4(&out))
    }
}

/// Choose an address from `ip -4 -o addr show` output. Globally routable
/// addresses win; otherwise the first listed address is returned.
pub fn pick_public_ipv4(output: &str) -> Option<Ipv4Addr> {
    let candidates: Vec<Ipv4Addr> = output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(3))
        .filter_map(|cidr| cidr.split('/').next()?.parse::<Ipv4Addr>().ok())
        .collect();

    candidates
        .iter()
        .find(|ip| !(ip.is_private() || ip.is_loopback() || ip.is_link_local()))
        .or(candidates.first())
        .copied()
}

async fn run(
    tool: &'static str,
    args: &[&str],
    input: Option<&[u8]>,
    timeout: Duration,
) -> Result<String, RuntimeError> {
    debug!(tool, ?args, "running external tool");

    let mut child = Command::new(tool)
        .args(args)
        .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => RuntimeError::ToolMissing { tool },
            _ => RuntimeError::Io(e),
        })?;

    let pipe = child.stdin.take();
    let feed = async move {
        if let (Some(mut pipe), Some(input)) = (pipe, input) {
            pipe.write_all(input).await?;
        }
        io::Result::Ok(())
    };

    let (fed, output) = tokio::time::timeout(timeout, async {
        tokio::join!(feed, child.wait_with_output())
    })
    .await
    .map_err(|_| {
        warn!(tool, timeout_secs = timeout.as_secs(), "external tool timed out");
        RuntimeError::Timeout { tool, timeout }
    })?;
    fed?;
    let output = output?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        debug!(tool, status = %output.status, stderr = %stderr, "external tool failed");
        return Err(RuntimeError::Failed {
            tool,
            status: output.status.to_string(),
            stderr,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim_end_matches('\n').to_string())
}

#[derive(Debug, Error)]
#[error("config saved, but apply failed (backup at {}): {source}", backup.display())]
pub struct ApplyFailed {
    pub backup: PathBuf,
    #[source]
    pub source: RuntimeError,
}

/// Apply a config that has already been written. The error carries the
/// backup taken before the write so the operator can roll back.
pub async fn apply_saved<R: Runtime>(
    interface: &str,
    timeout: Duration,
    backup: &Path,
) -> Result<(), ApplyFailed> {
    R::apply(interface, timeout).await.map_err(|source| {
        warn!(interface, backup = %backup.display(), error = %source, "apply failed");
        ApplyFailed {
            backup: backup.to_path_buf(),
            source,
        }
    })
}

/// `host:port` for client configs when none was given: the guessed public
/// address, or just `:port` when there is no guess.
pub async fn default_endpoint<R: Runtime>(listen_port: Option<&str>, timeout: Duration) -> String {
    let port = listen_port.map(str::trim).filter(|p| !p.is_empty()).unwrap_or("51820");
    match R::public_ipv4(timeout).await {
        Ok(Some(ip)) => format!("{ip}:{port}"),
        Ok(None) => {
            warn!("no global IPv4 address found, endpoint has no host");
            format!(":{port}")
        }
        Err(e) => {
            warn!(error = %e, "public address lookup failed, endpoint has no host");
            format!(":{port}")
        }
    }
}

/// Query the runtime for one interface. A failing query is not an error for
/// the caller: it only decides the reported state.
pub async fn live_status<R: Runtime>(
    interface: &str,
    timeout: Duration,
) -> (InterfaceState, Option<HashMap<String, LiveStatusEntry>>) {
    match R::dump(interface, timeout).await {
        Ok(dump) if !dump.is_empty() => (InterfaceState::Up, Some(parse_dump(&dump))),
        Ok(_) => (InterfaceState::Down, None),
        Err(e) if e.is_unavailable() => {
            warn!(interface, error = %e, "runtime status unavailable");
            (InterfaceState::Unknown, None)
        }
        Err(e) => {
            debug!(interface, error = %e, "interface not running");
            (InterfaceState::Down, None)
        }
    }
}
