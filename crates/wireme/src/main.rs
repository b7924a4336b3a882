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

use std::error::Error;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use wireme::allocate::{next_free_address, parse_peer_address};
use wireme::credentials::{self, ClientConfig};
use wireme::document::ConfigDocument;
use wireme::identity::{Identity, X25519, fingerprint};
use wireme::install;
use wireme::mutate::{self, BlockMetadata, NewPeer};
use wireme::profile::Profile;
use wireme::runtime::{self, Runtime, WgTools};
use wireme::settings::{self, WiremeToml};
use wireme::status;
use wireme_types::InterfaceView;

type CliResult<T = ()> = Result<T, Box<dyn Error>>;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    #[cfg(not(distribute))]
    {
        fmt()
            .pretty()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("GIT_VERSION"))]
#[command(about = "Add and remove peers in wg-quick configuration files")]
struct Args {
    /// Path to the settings file
    #[arg(short, long, default_value = settings::DEFAULT_PATH, global = true)]
    settings: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List configured interfaces and whether they are running
    Interfaces,

    /// Show an interface with its peers and live status
    Show {
        interface: String,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print the next free client address
    NextIp { interface: String },

    /// Append a new peer and generate its client config
    Add {
        interface: String,

        /// Peer name, sanitised for filenames
        #[arg(long)]
        name: String,

        #[arg(long, default_value_t = Profile::Desktop)]
        profile: Profile,

        /// Client address; a bare address becomes a single host
        #[arg(long)]
        address: Option<String>,

        /// Server endpoint the client dials, host:port
        #[arg(long)]
        endpoint: Option<String>,

        /// Client-side AllowedIPs, defaulting from the profile
        #[arg(long)]
        allowed_ips: Option<String>,

        /// Client-side DNS, defaulting from the profile
        #[arg(long)]
        dns: Option<String>,

        #[arg(long)]
        note: Option<String>,

        /// Do not generate a pre-shared key
        #[arg(long)]
        no_psk: bool,

        /// Load the new config into the running interface
        #[arg(long)]
        apply: bool,

        /// Save the client config under the clients directory
        #[arg(long)]
        save: bool,

        /// Print the client config to stdout
        #[arg(long)]
        print: bool,
    },

    /// Remove a peer
    Delete {
        interface: String,

        #[arg(long, conflicts_with = "name", required_unless_present = "name")]
        index: Option<usize>,

        #[arg(long)]
        name: Option<String>,

        /// Perform the removal instead of previewing it
        #[arg(long)]
        yes: bool,

        /// Also delete saved client configs for the removed peer
        #[arg(long)]
        purge_credentials: bool,

        /// Load the new config into the running interface
        #[arg(long)]
        apply: bool,
    },

    /// List saved client configs for an interface
    Credentials { interface: String },

    /// Install a client config received from a server operator
    Install {
        /// Client config file
        file: PathBuf,

        /// Interface name; defaults to the file's `# iface:` comment
        #[arg(long)]
        interface: Option<String>,
    },

    /// Bring an interface up with wg-quick
    Up { interface: String },

    /// Take an interface down with wg-quick
    Down { interface: String },
}

async fn read_config(path: &Path) -> CliResult<ConfigDocument> {
    ConfigDocument::read(path)
        .await
        .map_err(|e| format!("failed to read {}: {e}", path.display()).into())
}

async fn apply_or_report(settings: &WiremeToml, interface: &str, backup: &Path) {
    match runtime::apply_saved::<WgTools>(interface, settings.command_timeout(), backup).await {
        Ok(()) => eprintln!("applied to running interface {interface}"),
        Err(e) => eprintln!("{e}"),
    }
}

/// The new peer's private key exists only in the client config, so `add`
/// refuses to write anything unless the config goes somewhere.
fn require_key_destination(save: bool, print: bool) -> CliResult {
    if save || print {
        Ok(())
    } else {
        Err("pass --save and/or --print, otherwise the new peer's private key is lost".into())
    }
}

/// Print and/or save the client config. If saving fails the config is
/// printed anyway so the private key survives.
async fn deliver_client_config(
    out: &mut impl Write,
    save_dir: Option<&Path>,
    name: &str,
    public_key: &str,
    client: &str,
    print: bool,
    now: DateTime<Utc>,
) -> CliResult<Option<PathBuf>> {
    if print {
        write!(out, "{client}")?;
    }
    let Some(dir) = save_dir else {
        return Ok(None);
    };
    match credentials::save(dir, name, public_key, client, now).await {
        Ok(saved) => Ok(Some(saved)),
        Err(e) => {
            if !print {
                write!(out, "{client}")?;
            }
            Err(e.into())
        }
    }
}

async fn cmd_interfaces(settings: &WiremeToml) -> CliResult {
    for name in settings.interfaces().await? {
        let (state, _) = runtime::live_status::<WgTools>(&name, settings.command_timeout()).await;
        println!("{name}\t{state}");
    }
    Ok(())
}

fn print_view(view: &InterfaceView) {
    println!("{} ({})  {}", view.name, view.state, view.config_path);
    println!(
        "  address: {}  network: {}  listen port: {}",
        view.address.as_deref().unwrap_or("-"),
        view.network.as_deref().unwrap_or("-"),
        view.listen_port.as_deref().unwrap_or("-"),
    );
    if view.peers.is_empty() {
        println!("  no peers");
        return;
    }
    for peer in &view.peers {
        let (rx, tx) = peer
            .live
            .as_ref()
            .map_or(("-", "-"), |l| (l.rx_bytes.as_str(), l.tx_bytes.as_str()));
        println!(
            "  [{}] {:<20} {:<20} {:<10} {:<8} hs {:<6} rx {rx} tx {tx}  {}",
            peer.index,
            peer.display_name(),
            peer.allowed_ips.as_deref().unwrap_or("-"),
            peer.profile.as_deref().unwrap_or("-"),
            peer.fingerprint,
            peer.handshake,
            peer.endpoint.as_deref().unwrap_or("-"),
        );
    }
}

async fn cmd_show(settings: &WiremeToml, interface: &str, json: bool) -> CliResult {
    let path = settings.config_path(interface);
    let doc = read_config(&path).await?;
    let (state, live) = runtime::live_status::<WgTools>(interface, settings.command_timeout()).await;
    let view = status::merge(
        interface,
        &path,
        &doc,
        live.as_ref(),
        state,
        Utc::now().timestamp(),
    );

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print_view(&view);
    }
    Ok(())
}

async fn cmd_next_ip(settings: &WiremeToml, interface: &str) -> CliResult {
    let doc = read_config(&settings.config_path(interface)).await?;
    let addr_field = doc.interface().address.as_deref().unwrap_or_default();
    let next = next_free_address(addr_field, doc.peers())
        .ok_or("no free address in the interface network")?;
    println!("{next}");
    Ok(())
}

struct AddRequest {
    name: String,
    profile: Profile,
    address: Option<String>,
    endpoint: Option<String>,
    allowed_ips: Option<String>,
    dns: Option<String>,
    note: Option<String>,
    no_psk: bool,
    apply: bool,
    save: bool,
    print: bool,
}

async fn cmd_add(settings: &WiremeToml, interface: &str, req: AddRequest) -> CliResult {
    let path = settings.config_path(interface);
    let now = Utc::now();

    require_key_destination(req.save, req.print)?;
    let name = credentials::sanitize_name(&req.name);
    if name.is_empty() {
        return Err(format!("invalid peer name {:?}", req.name).into());
    }

    let doc = read_config(&path).await?;
    let iface = doc.interface();
    let addr_field = iface.address.clone().unwrap_or_default();

    let address = match req.address.as_deref() {
        Some(input) => {
            parse_peer_address(input).ok_or_else(|| format!("invalid client address {input:?}"))?
        }
        None => next_free_address(&addr_field, doc.peers())
            .ok_or("no free address in the interface network, pass --address")?,
    };

    let endpoint = match req.endpoint {
        Some(endpoint) => endpoint,
        None => {
            runtime::default_endpoint::<WgTools>(
                iface.listen_port.as_deref(),
                settings.command_timeout(),
            )
            .await
        }
    };
    let routes = req
        .allowed_ips
        .unwrap_or_else(|| req.profile.client_routes(&addr_field, &endpoint));
    let dns = req
        .dns
        .or_else(|| req.profile.default_dns(&settings.smartphone_dns));

    let peer = NewPeer {
        private_key: X25519::generate_private_key()?,
        preshared_key: if req.no_psk {
            None
        } else {
            Some(X25519::generate_preshared_key()?)
        },
        allowed_ips: address.to_string(),
    };
    let meta = BlockMetadata {
        name: name.clone(),
        created: wireme::created_timestamp(now),
        profile: req.profile.to_string(),
        note: req.note.map(|n| n.trim().to_string()),
    };

    let outcome = mutate::append_peer::<X25519>(&path, &peer, &meta, now).await?;
    eprintln!("added peer {name} ({})", outcome.peer_public_key);
    eprintln!("backup: {}", outcome.backup.display());

    let client = ClientConfig {
        name: &name,
        created: &meta.created,
        profile: &meta.profile,
        private_key: &peer.private_key,
        address: &peer.allowed_ips,
        dns: dns.as_deref(),
        server_public_key: &outcome.interface_public_key,
        preshared_key: peer.preshared_key.as_deref(),
        endpoint: &endpoint,
        allowed_ips: Some(routes.as_str()),
        persistent_keepalive: settings.persistent_keepalive,
    }
    .render();

    let save_dir = req
        .save
        .then(|| credentials::interface_dir(&settings.clients_dir, interface));
    let saved = deliver_client_config(
        &mut std::io::stdout().lock(),
        save_dir.as_deref(),
        &name,
        &outcome.peer_public_key,
        &client,
        req.print,
        now,
    )
    .await?;
    if let Some(saved) = saved {
        info!(path = %saved.display(), "client config saved");
        eprintln!("saved client config: {}", saved.display());
    }

    if req.apply {
        apply_or_report(settings, interface, &outcome.backup).await;
    }
    Ok(())
}

struct DeleteRequest {
    index: Option<usize>,
    name: Option<String>,
    yes: bool,
    purge_credentials: bool,
    apply: bool,
}

async fn cmd_delete(settings: &WiremeToml, interface: &str, req: DeleteRequest) -> CliResult {
    let path = settings.config_path(interface);
    let doc = read_config(&path).await?;
    let clients = credentials::interface_dir(&settings.clients_dir, interface);

    let index = match (req.index, req.name.as_deref()) {
        (Some(index), _) => index,
        (None, Some(name)) => doc
            .find_peer_by_name(name)
            .ok_or_else(|| format!("no peer named {name:?} in {}", path.display()))?,
        (None, None) => return Err("either --index or --name is required".into()),
    };

    if !req.yes {
        let peer = doc.peer(index).ok_or_else(|| {
            format!("peer {index} does not exist ({} peers)", doc.peers().len())
        })?;
        let public_key = peer.public_key.as_deref().unwrap_or_default();
        println!("would remove peer {index} from {}:", path.display());
        println!("  name: {}", peer.metadata.name.as_deref().unwrap_or("(unnamed)"));
        println!("  public key: {public_key}");
        println!("  allowed ips: {}", peer.allowed_ips.as_deref().unwrap_or("-"));
        for file in credentials::find_matching::<X25519>(&clients, public_key).await {
            println!("  saved client config: {}", file.display());
        }
        println!("re-run with --yes to remove it");
        return Ok(());
    }

    let outcome = mutate::delete_peer::<X25519>(&path, index, Some(&clients), Utc::now()).await?;
    println!(
        "removed peer {}",
        outcome.name.as_deref().unwrap_or("(unnamed)")
    );
    println!("backup: {}", outcome.backup.display());

    if req.purge_credentials {
        let report = credentials::remove(&outcome.credential_matches).await;
        for file in &report.removed {
            println!("deleted saved client config: {}", file.display());
        }
        for (file, e) in &report.failed {
            eprintln!("failed to delete {}: {e}", file.display());
        }
    } else {
        for file in &outcome.credential_matches {
            println!("kept saved client config: {}", file.display());
        }
    }

    if req.apply {
        apply_or_report(settings, interface, &outcome.backup).await;
    }
    Ok(())
}

/// Fingerprint of the peer a saved client config belongs to, or `unknown`.
async fn credential_fingerprint(file: &Path) -> String {
    let text = match tokio::fs::read(file).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!(path = %file.display(), error = %e, "unreadable client config");
            return "unknown".to_string();
        }
    };
    credentials::private_key_from_text(&text)
        .and_then(|key| X25519::public_key(key).ok())
        .map_or_else(|| "unknown".to_string(), |pk| fingerprint(&pk))
}

async fn cmd_credentials(settings: &WiremeToml, interface: &str) -> CliResult {
    let dir = credentials::interface_dir(&settings.clients_dir, interface);
    for file in credentials::list(&dir).await? {
        println!("{}\t{}", credential_fingerprint(&file).await, file.display());
    }
    Ok(())
}

async fn cmd_install(settings: &WiremeToml, file: &Path, interface: Option<String>) -> CliResult {
    let text = tokio::fs::read_to_string(file)
        .await
        .map_err(|e| format!("failed to read {}: {e}", file.display()))?;
    let interface = interface
        .or_else(|| install::interface_hint(&text).map(str::to_string))
        .ok_or("no --interface given and the config has no `# iface:` comment")?;

    let outcome = install::install(&settings.wireguard_dir, &interface, &text, Utc::now()).await?;
    println!("installed {}", outcome.path.display());
    if let Some(backup) = outcome.backup {
        println!("backup: {}", backup.display());
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> CliResult {
    init_tracing();
    let args = Args::parse();

    let settings = settings::load(&args.settings).await?;

    match args.command {
        Command::Interfaces => cmd_interfaces(&settings).await,
        Command::Show { interface, json } => cmd_show(&settings, &interface, json).await,
        Command::NextIp { interface } => cmd_next_ip(&settings, &interface).await,
        Command::Add {
            interface,
            name,
            profile,
            address,
            endpoint,
            allowed_ips,
            dns,
            note,
            no_psk,
            apply,
            save,
            print,
        } => {
            let req = AddRequest {
                name,
                profile,
                address,
                endpoint,
                allowed_ips,
                dns,
                note,
                no_psk,
                apply,
                save,
                print,
            };
            cmd_add(&settings, &interface, req).await
        }
        Command::Delete {
            interface,
            index,
            name,
            yes,
            purge_credentials,
            apply,
        } => {
            let req = DeleteRequest {
                index,
                name,
                yes,
                purge_credentials,
                apply,
            };
            cmd_delete(&settings, &interface, req).await
        }
        Command::Credentials { interface } => cmd_credentials(&settings, &interface).await,
        Command::Install { file, interface } => cmd_install(&settings, &file, interface).await,
        Command::Up { interface } => Ok(WgTools::up(&interface, settings.command_timeout()).await?),
        Command::Down { interface } => {
            Ok(WgTools::down(&interface, settings.command_timeout()).await?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const CLIENT: &str = "[Interface]\nPrivateKey = secret\n";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn add_needs_somewhere_for_the_key() {
        assert!(require_key_destination(false, false).is_err());
        assert!(require_key_destination(true, false).is_ok());
        assert!(require_key_destination(false, true).is_ok());
    }

    #[tokio::test]
    async fn failed_save_still_prints_config() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the clients directory should be.
        let blocker = dir.path().join("clients");
        std::fs::write(&blocker, "").unwrap();

        let mut out = Vec::new();
        let result = deliver_client_config(
            &mut out,
            Some(&blocker.join("wg0")),
            "phone",
            "abc",
            CLIENT,
            false,
            now(),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(String::from_utf8(out).unwrap(), CLIENT);
    }

    #[tokio::test]
    async fn saved_and_printed_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = Vec::new();
        let saved = deliver_client_config(&mut out, Some(dir.path()), "phone", "abc", CLIENT, true, now())
            .await
            .unwrap();

        assert_eq!(saved, Some(dir.path().join("phone--ba7816bf.conf")));
        assert_eq!(String::from_utf8(out).unwrap(), CLIENT);
    }

    #[tokio::test]
    async fn unreadable_credential_has_unknown_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let unreadable = dir.path().join("gone.conf");
        std::fs::create_dir(&unreadable).unwrap();
        assert_eq!(credential_fingerprint(&unreadable).await, "unknown");

        let key = X25519::generate_private_key().unwrap();
        let readable = dir.path().join("phone.conf");
        std::fs::write(&readable, format!("[Interface]\nPrivateKey = {key}\n")).unwrap();
        let expected = fingerprint(&X25519::public_key(&key).unwrap());
        assert_eq!(credential_fingerprint(&readable).await, expected);
    }
}
