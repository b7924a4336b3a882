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

//! Structural edits of a configuration file.
//!
//! Every edit is planned against a parsed [`ConfigDocument`] without touching
//! disk, then committed: the current file is copied to a timestamped backup,
//! and only if that succeeds is the new text written to a temporary sibling
//! and renamed over the original.

use std::fmt::Write as _;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::credentials;
use crate::document::{ConfigDocument, PeerRecord, is_blank, parse_metadata};
use crate::identity::{Identity, IdentityError};

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("interface PrivateKey not found in config")]
    MissingInterfaceKey,

    #[error("peer {index} does not exist ({count} peers in config)")]
    PeerNotFound { index: usize, count: usize },

    #[error("key derivation failed: {0}")]
    Identity(#[from] IdentityError),

    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to create backup {}: {source}", backup.display())]
    BackupFailed { backup: PathBuf, source: io::Error },

    #[error("failed to write {} (backup at {}): {source}", path.display(), backup.display())]
    WriteFailed {
        path: PathBuf,
        backup: PathBuf,
        source: io::Error,
    },
}

impl MutationError {
    /// True if the error happened before anything on disk was touched.
    pub fn nothing_written(&self) -> bool {
        !matches!(self, Self::WriteFailed { .. })
    }
}

type Result<T> = std::result::Result<T, MutationError>;

/// Key material and routing for a peer being added.
#[derive(Debug, Clone)]
pub struct NewPeer {
    pub private_key: String,
    pub preshared_key: Option<String>,
    pub allowed_ips: String,
}

/// Metadata comments written above a new `[Peer]` header.
#[derive(Debug, Clone)]
pub struct BlockMetadata {
    pub name: String,
    pub created: String,
    pub profile: String,
    pub note: Option<String>,
}

#[derive(Debug)]
pub struct AppendPlan {
    pub text: String,
    pub peer_public_key: String,
    pub interface_public_key: String,
}

#[derive(Debug)]
pub struct DeletePlan {
    pub text: String,
    /// Lines removed from the original document.
    pub removed: Range<usize>,
    pub public_key: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug)]
pub struct AppendOutcome {
    pub peer_public_key: String,
    pub interface_public_key: String,
    pub backup: PathBuf,
}

#[derive(Debug)]
pub struct DeleteOutcome {
    pub public_key: Option<String>,
    pub name: Option<String>,
    pub removed: Range<usize>,
    pub backup: PathBuf,
    /// Saved credential files whose private key belongs to the removed peer.
    /// They are reported, never deleted here.
    pub credential_matches: Vec<PathBuf>,
}

/// Render the lines appended for a new peer, leading blank line included.
pub fn render_peer_block(meta: &BlockMetadata, peer_public_key: &str, peer: &NewPeer) -> String {
    let mut block = String::from("\n");
    writeln!(block, "# wireme-name: {}", meta.name).unwrap();
    writeln!(block, "# wireme-created: {}", meta.created).unwrap();
    writeln!(block, "# wireme-profile: {}", meta.profile).unwrap();
    if let Some(note) = meta.note.as_deref().filter(|n| !n.is_empty()) {
        writeln!(block, "# wireme-note: {note}").unwrap();
    }
    writeln!(block, "[Peer]").unwrap();
    writeln!(block, "PublicKey = {peer_public_key}").unwrap();
    if let Some(psk) = peer.preshared_key.as_deref().filter(|p| !p.is_empty()) {
        writeln!(block, "PresharedKey = {psk}").unwrap();
    }
    writeln!(block, "AllowedIPs = {}", peer.allowed_ips).unwrap();
    block
}

/// Compute the text of `doc` with a new peer block appended. Existing lines
/// are carried over untouched.
pub fn plan_append<I: Identity>(
    doc: &ConfigDocument,
    peer: &NewPeer,
    meta: &BlockMetadata,
) -> Result<AppendPlan> {
    let interface_key = doc
        .interface()
        .private_key
        .as_deref()
        .filter(|k| !k.is_empty())
        .ok_or(MutationError::MissingInterfaceKey)?;

    let interface_public_key = I::public_key(interface_key)?;
    let peer_public_key = I::public_key(&peer.private_key)?;

    let mut text = doc.to_string();
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(&render_peer_block(meta, &peer_public_key, peer));

    debug!(
        name = %meta.name,
        allowed_ips = %peer.allowed_ips,
        "planned peer append"
    );
    Ok(AppendPlan {
        text,
        peer_public_key,
        interface_public_key,
    })
}

fn walk_back(lines: &[String], from: usize, floor: usize) -> usize {
    let mut at = from;
    while at > floor {
        let line = &lines[at - 1];
        if is_blank(line) || parse_metadata(line).is_some() {
            at -= 1;
        } else {
            break;
        }
    }
    at
}

/// Walk backwards from a `[Peer]` header over blank lines and metadata
/// comments, returning the first index to remove.
pub fn removal_start(lines: &[String], header: usize) -> usize {
    walk_back(lines, header, 0)
}

/// End of the removal range for a peer. Blank lines and metadata comments at
/// the tail of the peer's range lead into the next section and stay.
pub fn removal_end(lines: &[String], peer: &PeerRecord) -> usize {
    if peer.end >= lines.len() {
        return peer.end;
    }
    walk_back(lines, peer.end, peer.start + 1)
}

/// Compute the text of `doc` with peer `index` removed, together with the
/// blank and metadata lines directly above it. Metadata belonging to the
/// following peer is kept.
pub fn plan_delete(doc: &ConfigDocument, index: usize) -> Result<DeletePlan> {
    let peer = doc.peer(index).ok_or(MutationError::PeerNotFound {
        index,
        count: doc.peers().len(),
    })?;

    let lines = doc.lines();
    let removed = removal_start(lines, peer.start)..removal_end(lines, peer);

    let text: String = lines[..removed.start]
        .iter()
        .chain(&lines[removed.end..])
        .map(String::as_str)
        .collect();

    debug!(
        index,
        header = peer.start,
        removed_start = removed.start,
        removed_end = removed.end,
        "planned peer removal"
    );
    Ok(DeletePlan {
        text,
        removed,
        public_key: peer.public_key.clone(),
        name: peer.metadata.name.clone(),
    })
}

/// `<file>.bak-<YYYYMMDD-HHMMSS>` next to `path`.
pub fn backup_path(path: &Path, now: DateTime<Utc>) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".bak-{}", now.format("%Y%m%d-%H%M%S")));
    path.with_file_name(name)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = std::ffi::OsString::from(".");
    name.push(path.file_name().unwrap_or_default());
    name.push(format!(".wireme-tmp-{}", std::process::id()));
    path.with_file_name(name)
}

async fn copy_new(path: &Path, backup: &Path) -> io::Result<()> {
    let contents = tokio::fs::read(path).await?;
    let permissions = tokio::fs::metadata(path).await?.permissions();

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(backup).await?;

    let result = async {
        file.write_all(&contents).await?;
        file.sync_all().await?;
        tokio::fs::set_permissions(backup, permissions).await
    }
    .await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(backup).await;
    }
    result
}

/// Copy the current file to its timestamped backup. File mode is preserved.
///
/// An existing backup is never replaced: a second edit within the same
/// second fails with `BackupFailed` before anything is written.
pub async fn backup(path: &Path, now: DateTime<Utc>) -> Result<PathBuf> {
    let backup = backup_path(path, now);
    copy_new(path, &backup)
        .await
        .map_err(|source| MutationError::BackupFailed {
            backup: backup.clone(),
            source,
        })?;
    debug!(backup = %backup.display(), "created backup");
    Ok(backup)
}

pub(crate) async fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let tmp = temp_path(path);
    let permissions = tokio::fs::metadata(path).await.ok().map(|m| m.permissions());

    let result = async {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&tmp).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        if let Some(permissions) = permissions {
            tokio::fs::set_permissions(&tmp, permissions).await?;
        }
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

/// Back up `path`, then replace its contents with `new_text`. Nothing is
/// written if the backup fails.
#[tracing::instrument(skip_all, fields(path = %path.display()))]
pub async fn commit(path: &Path, new_text: &str, now: DateTime<Utc>) -> Result<PathBuf> {
    let backup = backup(path, now).await?;

    if let Err(source) = write_atomic(path, new_text).await {
        warn!(backup = %backup.display(), error = %source, "write failed after backup");
        return Err(MutationError::WriteFailed {
            path: path.to_path_buf(),
            backup,
            source,
        });
    }
    Ok(backup)
}

async fn read_document(path: &Path) -> Result<ConfigDocument> {
    ConfigDocument::read(path)
        .await
        .map_err(|source| MutationError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Append a peer to the configuration file at `path`.
#[tracing::instrument(skip_all, fields(path = %path.display(), name = %meta.name))]
pub async fn append_peer<I: Identity>(
    path: &Path,
    peer: &NewPeer,
    meta: &BlockMetadata,
    now: DateTime<Utc>,
) -> Result<AppendOutcome> {
    let doc = read_document(path).await?;
    let plan = plan_append::<I>(&doc, peer, meta)?;
    let backup = commit(path, &plan.text, now).await?;

    info!(
        peer_public_key = %plan.peer_public_key,
        backup = %backup.display(),
        "peer added"
    );
    Ok(AppendOutcome {
        peer_public_key: plan.peer_public_key,
        interface_public_key: plan.interface_public_key,
        backup,
    })
}

/// Remove peer `index` from the configuration file at `path`.
///
/// When `credentials_dir` is given, saved client configs for the removed peer
/// are looked up and returned in the outcome.
#[tracing::instrument(skip_all, fields(path = %path.display(), index = index))]
pub async fn delete_peer<I: Identity>(
    path: &Path,
    index: usize,
    credentials_dir: Option<&Path>,
    now: DateTime<Utc>,
) -> Result<DeleteOutcome> {
    let doc = read_document(path).await?;
    let plan = plan_delete(&doc, index)?;
    let backup = commit(path, &plan.text, now).await?;

    let credential_matches = match (credentials_dir, plan.public_key.as_deref()) {
        (Some(dir), Some(public_key)) => credentials::find_matching::<I>(dir, public_key).await,
        _ => Vec::new(),
    };

    info!(
        name = plan.name.as_deref().unwrap_or("(unnamed)"),
        removed_lines = plan.removed.len(),
        credential_matches = credential_matches.len(),
        backup = %backup.display(),
        "peer removed"
    );
    Ok(DeleteOutcome {
        public_key: plan.public_key,
        name: plan.name,
        removed: plan.removed,
        backup,
        credential_matches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use test_case::test_case;

    struct FakeIdentity;

    impl Identity for FakeIdentity {
        fn public_key(private_key: &str) -> std::result::Result<String, IdentityError> {
            if private_key == "bad" {
                return Err(IdentityError::InvalidKeyLength(3));
            }
            Ok(format!("pub({private_key})"))
        }

        fn generate_private_key() -> std::result::Result<String, IdentityError> {
            Ok("fresh".to_string())
        }

        fn generate_preshared_key() -> std::result::Result<String, IdentityError> {
            Ok("psk".to_string())
        }
    }

    const CONFIG: &str = "\
[Interface]
Address = 10.0.0.1/24
PrivateKey = server

# wireme-name: alpha
# wireme-created: 2025-01-01T00:00:00Z
# wireme-profile: desktop
[Peer]
PublicKey = pub(alpha)
AllowedIPs = 10.0.0.2/32

# wireme-name: beta
[Peer]
PublicKey = pub(beta)
AllowedIPs = 10.0.0.3/32
";

    fn meta(note: Option<&str>) -> BlockMetadata {
        BlockMetadata {
            name: "gamma".into(),
            created: "2025-02-03T04:05:06Z".into(),
            profile: "smartphone".into(),
            note: note.map(str::to_string),
        }
    }

    fn new_peer(psk: Option<&str>) -> NewPeer {
        NewPeer {
            private_key: "gamma".into(),
            preshared_key: psk.map(str::to_string),
            allowed_ips: "10.0.0.4/32".into(),
        }
    }

    #[test]
    fn block_layout() {
        let block = render_peer_block(&meta(Some("spare phone")), "PUB", &new_peer(Some("PSK")));
        assert_eq!(
            block,
            "\n# wireme-name: gamma\n# wireme-created: 2025-02-03T04:05:06Z\n\
             # wireme-profile: smartphone\n# wireme-note: spare phone\n[Peer]\n\
             PublicKey = PUB\nPresharedKey = PSK\nAllowedIPs = 10.0.0.4/32\n"
        );
    }

    #[test_case(None, None ; "no note no psk")]
    #[test_case(Some(""), Some("") ; "empty note and psk")]
    fn block_omits_optional_lines(note: Option<&str>, psk: Option<&str>) {
        let block = render_peer_block(&meta(note), "PUB", &new_peer(psk));
        assert!(!block.contains("wireme-note"));
        assert!(!block.contains("PresharedKey"));
    }

    #[test]
    fn append_keeps_existing_bytes() {
        let doc = ConfigDocument::parse(CONFIG);
        let plan = plan_append::<FakeIdentity>(&doc, &new_peer(None), &meta(None)).unwrap();
        assert!(plan.text.starts_with(CONFIG));
        assert_eq!(plan.peer_public_key, "pub(gamma)");
        assert_eq!(plan.interface_public_key, "pub(server)");

        let reparsed = ConfigDocument::parse(&plan.text);
        assert_eq!(reparsed.peers().len(), 3);
        let gamma = &reparsed.peers()[2];
        assert_eq!(gamma.metadata.name.as_deref(), Some("gamma"));
        assert_eq!(gamma.public_key.as_deref(), Some("pub(gamma)"));
        assert_eq!(gamma.end, reparsed.lines().len());
    }

    #[test]
    fn append_requires_interface_key() {
        let doc = ConfigDocument::parse("[Interface]\nAddress = 10.0.0.1/24\n");
        let err = plan_append::<FakeIdentity>(&doc, &new_peer(None), &meta(None)).unwrap_err();
        assert!(matches!(err, MutationError::MissingInterfaceKey));
    }

    #[test]
    fn append_surfaces_identity_failure() {
        let doc = ConfigDocument::parse(CONFIG);
        let mut peer = new_peer(None);
        peer.private_key = "bad".into();
        let err = plan_append::<FakeIdentity>(&doc, &peer, &meta(None)).unwrap_err();
        assert!(matches!(err, MutationError::Identity(_)));
    }

    #[test]
    fn delete_first_peer() {
        let doc = ConfigDocument::parse(CONFIG);
        let plan = plan_delete(&doc, 0).unwrap();
        // The blank line closing [Interface] goes with alpha's metadata; the
        // separator and metadata in front of beta stay.
        assert_eq!(plan.removed, 3..10);
        assert_eq!(plan.name.as_deref(), Some("alpha"));
        assert_eq!(
            plan.text,
            "[Interface]\nAddress = 10.0.0.1/24\nPrivateKey = server\n\n\
             # wireme-name: beta\n[Peer]\nPublicKey = pub(beta)\nAllowedIPs = 10.0.0.3/32\n"
        );
        let after = ConfigDocument::parse(&plan.text);
        assert_eq!(after.peers()[0].metadata.name.as_deref(), Some("beta"));
    }

    #[test]
    fn delete_last_peer_leaves_others_untouched() {
        let doc = ConfigDocument::parse(CONFIG);
        let plan = plan_delete(&doc, 1).unwrap();
        assert_eq!(plan.removed, 10..15);

        let after = ConfigDocument::parse(&plan.text);
        assert_eq!(after.peers().len(), 1);
        let alpha_before = doc.peer_lines(&doc.peers()[0]);
        let alpha_after = after.peer_lines(&after.peers()[0]);
        // Only trailing blank lines of alpha may be consumed.
        assert_eq!(&alpha_before[..3], alpha_after);
        assert_eq!(after.peers()[0].metadata.name.as_deref(), Some("alpha"));
    }

    #[test]
    fn delete_stops_at_ordinary_comment() {
        let text = "[Interface]\n# keep me\n\n[Peer]\nPublicKey = x\n";
        let doc = ConfigDocument::parse(text);
        let plan = plan_delete(&doc, 0).unwrap();
        assert_eq!(plan.text, "[Interface]\n# keep me\n");
    }

    #[test]
    fn delete_before_unknown_section_keeps_its_comments() {
        let text = "[Peer]\nPublicKey = x\n\n# wireme-name: orphan\n[Other]\nKey = v\n";
        let doc = ConfigDocument::parse(text);
        let plan = plan_delete(&doc, 0).unwrap();
        assert_eq!(plan.removed, 0..2);
        assert_eq!(plan.text, "\n# wireme-name: orphan\n[Other]\nKey = v\n");
    }

    #[test]
    fn delete_out_of_range() {
        let doc = ConfigDocument::parse(CONFIG);
        let err = plan_delete(&doc, 2).unwrap_err();
        assert!(matches!(err, MutationError::PeerNotFound { index: 2, count: 2 }));
    }

    #[test]
    fn append_then_delete_restores_original() {
        let doc = ConfigDocument::parse(CONFIG);
        let plan = plan_append::<FakeIdentity>(&doc, &new_peer(Some("k")), &meta(Some("n"))).unwrap();
        let appended = ConfigDocument::parse(&plan.text);
        let removed = plan_delete(&appended, 2).unwrap();
        assert_eq!(removed.text, CONFIG);
    }

    #[test]
    fn append_terminates_unterminated_last_line() {
        let doc = ConfigDocument::parse("[Interface]\nPrivateKey = server");
        let plan = plan_append::<FakeIdentity>(&doc, &new_peer(None), &meta(None)).unwrap();
        assert!(plan.text.starts_with("[Interface]\nPrivateKey = server\n\n# wireme-name: gamma\n"));

        let reparsed = ConfigDocument::parse(&plan.text);
        assert_eq!(reparsed.interface().private_key.as_deref(), Some("server"));
        assert_eq!(reparsed.peers().len(), 1);

        // Only the added terminator remains after removing the new peer.
        let removed = plan_delete(&reparsed, 0).unwrap();
        assert_eq!(removed.text, "[Interface]\nPrivateKey = server\n");
    }

    #[tokio::test]
    async fn backup_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg0.conf");
        std::fs::write(&path, "first").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        let first = backup(&path, now).await.unwrap();
        std::fs::write(&path, "second").unwrap();
        let err = backup(&path, now).await.unwrap_err();

        assert!(matches!(
            &err,
            MutationError::BackupFailed { source, .. } if source.kind() == io::ErrorKind::AlreadyExists
        ));
        assert!(err.nothing_written());
        assert_eq!(std::fs::read_to_string(&first).unwrap(), "first");
    }

    #[test]
    fn backup_name() {
        let now = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        let path = backup_path(Path::new("/etc/wireguard/wg0.conf"), now);
        assert_eq!(path, Path::new("/etc/wireguard/wg0.conf.bak-20250304-050607"));
    }

    #[test]
    fn temp_file_is_hidden_sibling() {
        let tmp = temp_path(Path::new("/etc/wireguard/wg0.conf"));
        assert_eq!(tmp.parent(), Some(Path::new("/etc/wireguard")));
        assert!(tmp.file_name().unwrap().to_string_lossy().starts_with(".wg0.conf.wireme-tmp-"));
    }
}
