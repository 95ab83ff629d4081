// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Settings for romfetch.
//!
//! Loaded from `~/.romfetch/config.json`. A missing file means defaults, a
//! missing field means that field's default. `ROMFETCH_*` environment
//! variables override the file, CLI flags override both.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 8787;

/// Credential file names looked up in the data directory.
pub const ONEFICHIER_KEY_FILE: &str = "1FichierAPI.txt";
pub const ALLDEBRID_KEY_FILE: &str = "AllDebridAPI.txt";
pub const REALDEBRID_KEY_FILE: &str = "RealDebridAPI.txt";

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root of the per-platform ROM folders.
    pub roms_dir: PathBuf,
    /// Destination for BIOS platforms. Falls back to `roms_dir`.
    pub bios_dir: Option<PathBuf>,
    /// Job ledger, ownership ledger and credential files live here.
    pub data_dir: PathBuf,
    /// Double the platform folder (`roms/<folder>/<folder>`) for symlinked trees.
    pub symlink_layout: bool,
    /// Platform display name -> folder name.
    pub platform_folders: HashMap<String, String>,
    /// Platforms whose downloads go to `bios_dir`.
    pub bios_platforms: Vec<String>,
    /// Platforms whose archives are always unpacked.
    pub extract_platforms: Vec<String>,
    /// Hosts routed through the locker resolver chain.
    pub locker_hosts: Vec<String>,
    pub credentials: Credentials,
    pub endpoints: ProviderEndpoints,
    pub transfer: TransferSettings,
    pub resolver: ResolverSettings,
    /// Queue worker poll interval.
    pub queue_poll_ms: u64,
    /// Ceiling for a duplicate requester waiting on an in-flight peer.
    pub duplicate_wait_secs: u64,
    pub server: ServerSettings,
    /// Rolling log file directory; stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

/// API keys for the locker and unlock services.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub onefichier: Option<String>,
    pub alldebrid: Option<String>,
    pub realdebrid: Option<String>,
}

/// Provider API base URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderEndpoints {
    pub onefichier: String,
    pub alldebrid: String,
    pub realdebrid: String,
    /// `agent` parameter sent to the AllDebrid API.
    pub alldebrid_agent: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            onefichier: "https://api.1fichier.com/v1".to_string(),
            alldebrid: "https://api.alldebrid.com/v4".to_string(),
            realdebrid: "https://api.real-debrid.com/rest/1.0".to_string(),
            alldebrid_agent: "romfetch".to_string(),
        }
    }
}

/// Transfer engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Write buffer size.
    pub chunk_size: usize,
    /// Minimum spacing between progress samples.
    pub progress_interval_ms: u64,
    /// Extra attempts for transient failures (timeouts, resets, 5xx, 429).
    pub transient_retries: u32,
    /// First backoff delay; doubles per attempt.
    pub retry_base_delay_ms: u64,
    pub connect_timeout_secs: u64,
    /// Per-read idle timeout on the body stream.
    pub read_timeout_secs: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: 128 * 1024,
            progress_interval_ms: 100,
            transient_retries: 3,
            retry_base_delay_ms: 1000,
            connect_timeout_secs: 30,
            read_timeout_secs: 60,
        }
    }
}

impl TransferSettings {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Resolver tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverSettings {
    /// Countdown tick; cancellation is checked once per tick.
    pub wait_tick_ms: u64,
    /// Form resubmissions in free mode.
    pub max_form_attempts: u32,
    /// Timeout for API calls and candidate link checks.
    pub request_timeout_secs: u64,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            wait_tick_ms: 1000,
            max_form_attempts: 3,
            request_timeout_secs: 15,
        }
    }
}

impl ResolverSettings {
    pub fn wait_tick(&self) -> Duration {
        Duration::from_millis(self.wait_tick_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Defaults to 127.0.0.1 (localhost only).
    pub bind_address: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        let base = config_dir();
        Self {
            roms_dir: base.join("roms"),
            bios_dir: None,
            data_dir: base.clone(),
            symlink_layout: false,
            platform_folders: HashMap::new(),
            bios_platforms: vec![
                "BIOS".to_string(),
                "- BIOS by TMCTV -".to_string(),
                "- BIOS".to_string(),
            ],
            extract_platforms: vec!["ps3".to_string(), "PlayStation 3".to_string()],
            locker_hosts: vec!["1fichier.com".to_string()],
            credentials: Credentials::default(),
            endpoints: ProviderEndpoints::default(),
            transfer: TransferSettings::default(),
            resolver: ResolverSettings::default(),
            queue_poll_ms: 1000,
            duplicate_wait_secs: 30 * 60,
            server: ServerSettings::default(),
            log_dir: None,
        }
    }
}

/// `~/.romfetch`, or `.romfetch` when there is no home directory.
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".romfetch"))
        .unwrap_or_else(|| PathBuf::from(".romfetch"))
}

impl Settings {
    /// Settings rooted at one directory. Used by tests and the `--root` flag.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            roms_dir: root.join("roms"),
            data_dir: root.join("data"),
            ..Self::default()
        }
    }

    /// Load from `path`, or from the default location when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| config_dir().join("config.json"));

        let mut settings = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Settings::default()
        };

        settings.apply_env();
        Ok(settings)
    }

    /// Write the settings back as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write config: {:?}", path))?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("ROMFETCH_ROMS_DIR") {
            self.roms_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("ROMFETCH_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(bind) = std::env::var("ROMFETCH_BIND") {
            self.server.bind_address = bind;
        }
        if let Some(port) = std::env::var("ROMFETCH_PORT").ok().and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("history.json")
    }

    pub fn ownership_path(&self) -> PathBuf {
        self.data_dir.join("downloaded_games.json")
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms)
    }

    pub fn duplicate_wait(&self) -> Duration {
        Duration::from_secs(self.duplicate_wait_secs)
    }

    /// True when `url`'s host is one of the configured locker hosts.
    pub fn is_locker_url(&self, url: &str) -> bool {
        let host = match reqwest::Url::parse(url) {
            Ok(parsed) => parsed.host_str().map(str::to_ascii_lowercase),
            Err(_) => None,
        };
        let Some(host) = host else {
            return false;
        };
        self.locker_hosts.iter().any(|locker| {
            let locker = locker.to_ascii_lowercase();
            host == locker || host.ends_with(&format!(".{}", locker))
        })
    }

    /// Current credentials: key files in `data_dir` win over config values.
    ///
    /// Read at the start of every job so keys can be rotated without a restart.
    pub fn current_credentials(&self) -> Credentials {
        Credentials {
            onefichier: read_key_file(&self.data_dir.join(ONEFICHIER_KEY_FILE))
                .or_else(|| non_empty(self.credentials.onefichier.as_deref())),
            alldebrid: read_key_file(&self.data_dir.join(ALLDEBRID_KEY_FILE))
                .or_else(|| non_empty(self.credentials.alldebrid.as_deref())),
            realdebrid: read_key_file(&self.data_dir.join(REALDEBRID_KEY_FILE))
                .or_else(|| non_empty(self.credentials.realdebrid.as_deref())),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

fn read_key_file(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    non_empty(Some(&content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, DEFAULT_PORT);
        assert_eq!(settings.server.bind_address, "127.0.0.1");
        assert_eq!(settings.queue_poll_ms, 1000);
        assert_eq!(settings.duplicate_wait(), Duration::from_secs(1800));
        assert_eq!(settings.transfer.progress_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"roms_dir": "/srv/roms", "server": {"port": 9000}}"#).unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.roms_dir, PathBuf::from("/srv/roms"));
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.bind_address, "127.0.0.1");
        assert_eq!(settings.locker_hosts, vec!["1fichier.com".to_string()]);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut settings = Settings::rooted_at(dir.path());
        settings.symlink_layout = true;
        settings.save(&path).unwrap();

        let loaded = Settings::load(Some(&path)).unwrap();
        assert!(loaded.symlink_layout);
        assert_eq!(loaded.roms_dir, dir.path().join("roms"));
    }

    #[test]
    fn test_locker_host_matching() {
        let settings = Settings::default();
        assert!(settings.is_locker_url("https://1fichier.com/?abcdefgh"));
        assert!(settings.is_locker_url("https://www.1FICHIER.com/?abcdefgh&af=123"));
        assert!(!settings.is_locker_url("https://myrient.erista.me/files/a.zip"));
        assert!(!settings.is_locker_url("https://not1fichier.com/x"));
        assert!(!settings.is_locker_url("not a url"));
    }

    #[test]
    fn test_key_file_overrides_config() {
        let dir = TempDir::new().unwrap();
        let mut settings = Settings::rooted_at(dir.path());
        settings.credentials.alldebrid = Some("from-config".to_string());
        settings.credentials.realdebrid = Some("   ".to_string());
        fs::create_dir_all(&settings.data_dir).unwrap();
        fs::write(settings.data_dir.join(ALLDEBRID_KEY_FILE), "from-file\n").unwrap();
        fs::write(settings.data_dir.join(ONEFICHIER_KEY_FILE), "").unwrap();

        let creds = settings.current_credentials();
        assert_eq!(creds.alldebrid.as_deref(), Some("from-file"));
        assert_eq!(creds.onefichier, None);
        assert_eq!(creds.realdebrid, None);
    }
}
