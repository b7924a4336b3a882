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

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_PATH: &str = "/etc/wireme/wireme.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WiremeToml {
    pub wireguard_dir: PathBuf,
    pub clients_dir: PathBuf,
    pub command_timeout_secs: u64,
    pub persistent_keepalive: u16,
    pub smartphone_dns: String,
}

impl Default for WiremeToml {
    fn default() -> Self {
        Self {
            wireguard_dir: PathBuf::from("/etc/wireguard"),
            clients_dir: PathBuf::from("/etc/wireguard/clients"),
            command_timeout_secs: 20,
            persistent_keepalive: 25,
            smartphone_dns: "1.1.1.1".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings: {0}")]
    Read(#[from] io::Error),

    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid settings: {0}")]
    Invalid(String),
}

impl WiremeToml {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.command_timeout_secs == 0 {
            return Err(SettingsError::Invalid(
                "command_timeout_secs must be positive".into(),
            ));
        }
        if self.wireguard_dir.as_os_str().is_empty() {
            return Err(SettingsError::Invalid("wireguard_dir is empty".into()));
        }
        if self.clients_dir.as_os_str().is_empty() {
            return Err(SettingsError::Invalid("clients_dir is empty".into()));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn config_path(&self, interface: &str) -> PathBuf {
        self.wireguard_dir.join(format!("{interface}.conf"))
    }

    /// Sorted interface names, one per `*.conf` regular file in the
    /// WireGuard directory.
    pub async fn interfaces(&self) -> Result<Vec<String>, SettingsError> {
        let mut entries = tokio::fs::read_dir(&self.wireguard_dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "conf")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                names.push(stem.to_string());
            }
        }
        names.sort();
        debug!(count = names.len(), "discovered interfaces");
        Ok(names)
    }
}

pub async fn load(path: &Path) -> Result<WiremeToml, SettingsError> {
    debug!(path = %path.display(), "loading settings");

    let settings = match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let settings: WiremeToml = toml::from_str(&contents)?;
            info!(path = %path.display(), "loaded settings");
            settings
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "settings file not found, using defaults");
            WiremeToml::default()
        }
        Err(e) => return Err(SettingsError::Read(e)),
    };

    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn parse_empty_file() {
        let parsed: WiremeToml = toml::from_str("").unwrap();
        assert_eq!(parsed, WiremeToml::default());
    }

    #[test]
    fn round_trip_toml() {
        let settings = WiremeToml {
            clients_dir: PathBuf::from("/srv/clients"),
            persistent_keepalive: 15,
            ..Default::default()
        };
        let serialized = toml::to_string_pretty(&settings).unwrap();
        let parsed: WiremeToml = toml::from_str(&serialized).unwrap();
        assert_eq!(settings, parsed);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: WiremeToml = toml::from_str("command_timeout_secs = 5\n").unwrap();
        assert_eq!(parsed.command_timeout(), Duration::from_secs(5));
        assert_eq!(parsed.wireguard_dir, PathBuf::from("/etc/wireguard"));
    }

    #[test_case("command_timeout_secs = 0", false ; "zero timeout")]
    #[test_case("wireguard_dir = \"\"", false ; "empty wireguard dir")]
    #[test_case("clients_dir = \"\"", false ; "empty clients dir")]
    #[test_case("smartphone_dns = \"9.9.9.9\"", true ; "custom dns")]
    fn validation(toml_text: &str, valid: bool) {
        let parsed: WiremeToml = toml::from_str(toml_text).unwrap();
        assert_eq!(parsed.validate().is_ok(), valid);
    }

    #[test]
    fn config_path_joins_interface() {
        let settings = WiremeToml::default();
        assert_eq!(
            settings.config_path("wg0"),
            PathBuf::from("/etc/wireguard/wg0.conf")
        );
    }

    #[tokio::test]
    async fn discovers_conf_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("wg1.conf"), "").unwrap();
        std::fs::write(dir.path().join("wg0.conf"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        std::fs::write(dir.path().join("wg0.conf.bak-20250101-000000"), "").unwrap();
        std::fs::create_dir(dir.path().join("clients.conf")).unwrap();

        let settings = WiremeToml {
            wireguard_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        assert_eq!(settings.interfaces().await.unwrap(), vec!["wg0", "wg1"]);
    }

    #[tokio::test]
    async fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(settings, WiremeToml::default());
    }

    #[tokio::test]
    async fn invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wireme.toml");
        std::fs::write(&path, "command_timeout_secs = 0\n").unwrap();
        assert!(matches!(load(&path).await, Err(SettingsError::Invalid(_))));
    }
}
