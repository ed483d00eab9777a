use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::ezshare::{ClientOptions, ListingRules, default_renames};
use crate::network::{NetworkLink, NetworkSetupLink, NoopLink};
use crate::sync::SyncOptions;
use crate::sync::policy::Policy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub wifi: WifiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Listing URL of the card's root directory.
    #[serde(default = "default_url")]
    pub url: String,
    /// Local mirror root; `~` is expanded.
    #[serde(default = "default_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub keep_old: bool,
    #[serde(default)]
    pub ignore: Vec<String>,
    /// Estimated number of downloads, 0 when unknown.
    #[serde(default)]
    pub expected_files: u64,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_listing_timeout")]
    pub listing_timeout_secs: u64,
    #[serde(default = "default_download_idle_timeout")]
    pub download_idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Exact-name rewrites applied to listing entries.
    #[serde(default = "default_renames")]
    pub rename: HashMap<String, String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            path: default_path(),
            overwrite: false,
            keep_old: false,
            ignore: Vec::new(),
            expected_files: 0,
            max_depth: default_max_depth(),
            listing_timeout_secs: default_listing_timeout(),
            download_idle_timeout_secs: default_download_idle_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            rename: default_renames(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiConfig {
    /// Join the card's access point before syncing.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ssid")]
    pub ssid: String,
    #[serde(default = "default_psk")]
    pub psk: String,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_connection_delay")]
    pub connection_delay_secs: u64,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ssid: default_ssid(),
            psk: default_psk(),
            retries: default_retries(),
            connection_delay_secs: default_connection_delay(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_url() -> String {
    "http://192.168.4.1/dir?dir=A:".into()
}
fn default_path() -> PathBuf {
    PathBuf::from("~/Documents/CPAP_Data/SD_card")
}
fn default_max_depth() -> usize {
    32
}
fn default_listing_timeout() -> u64 {
    5
}
fn default_download_idle_timeout() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_ssid() -> String {
    "ez Share".into()
}
fn default_psk() -> String {
    "88888888".into()
}
fn default_retries() -> u32 {
    3
}
fn default_connection_delay() -> u64 {
    5
}

pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(dir.join("ezshare-sync").join("config.toml"))
}

/// A parsed config and the file it came from, `None` for built-in defaults.
///
/// Loading happens before the subscriber is installed, so the caller logs
/// the source once tracing is up.
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: Config,
    pub source: Option<PathBuf>,
}

/// Load the config file. An explicitly named file must exist; the default
/// location may be absent, in which case built-in defaults apply.
pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig> {
    let (path, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (default_config_path()?, false),
    };

    if !explicit && !path.exists() {
        return Ok(LoadedConfig {
            config: Config::default(),
            source: None,
        });
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(LoadedConfig {
        config,
        source: Some(path),
    })
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &Path) -> Result<PathBuf> {
    let Ok(rest) = path.strip_prefix("~") else {
        return Ok(path.to_path_buf());
    };
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(rest))
}

impl Config {
    /// Check the settings a sync run depends on.
    pub fn validate(&self) -> Result<()> {
        self.root_url()?;

        let path = self.local_root()?;
        if !path.is_dir() {
            anyhow::bail!(
                "Invalid path: {} does not exist or is not a directory",
                path.display()
            );
        }
        if self.sync.max_depth == 0 {
            anyhow::bail!("sync.max_depth must be at least 1");
        }
        if self.wifi.enabled && self.wifi.ssid.is_empty() {
            anyhow::bail!("wifi.ssid must not be empty when wifi is enabled");
        }
        Ok(())
    }

    pub fn root_url(&self) -> Result<Url> {
        let url = Url::parse(&self.sync.url)
            .with_context(|| format!("Invalid card URL: {}", self.sync.url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("Card URL must be http or https: {url}");
        }
        Ok(url)
    }

    pub fn local_root(&self) -> Result<PathBuf> {
        expand_tilde(&self.sync.path)
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            listing_timeout: Duration::from_secs(self.sync.listing_timeout_secs),
            connect_timeout: Duration::from_secs(self.sync.connect_timeout_secs),
            download_idle_timeout: Duration::from_secs(self.sync.download_idle_timeout_secs),
        }
    }

    pub fn sync_options(&self) -> Result<SyncOptions> {
        Ok(SyncOptions {
            root_url: self.root_url()?,
            local_root: self.local_root()?,
            rules: ListingRules {
                ignore: self.sync.ignore.iter().cloned().collect::<HashSet<_>>(),
                rename: self.sync.rename.clone(),
            },
            policy: Policy {
                overwrite: self.sync.overwrite,
                keep_old: self.sync.keep_old,
            },
            expected_files: (self.sync.expected_files > 0).then_some(self.sync.expected_files),
            max_depth: self.sync.max_depth,
        })
    }

    pub fn network_link(&self) -> Box<dyn NetworkLink> {
        if !self.wifi.enabled {
            return Box::new(NoopLink);
        }
        Box::new(NetworkSetupLink {
            ssid: self.wifi.ssid.clone(),
            psk: self.wifi.psk.clone(),
            retries: self.wifi.retries,
            connection_delay: Duration::from_secs(self.wifi.connection_delay_secs),
        })
    }

    /// TOML rendering with the Wi-Fi key blanked out.
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if !shown.wifi.psk.is_empty() {
            shown.wifi.psk = "<redacted>".into();
        }
        toml::to_string_pretty(&shown).context("Failed to render config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.sync.url, "http://192.168.4.1/dir?dir=A:");
        assert_eq!(cfg.sync.listing_timeout_secs, 5);
        assert_eq!(cfg.sync.rename.get("STR.EDF").map(String::as_str), Some("STR.edf"));
        assert!(!cfg.wifi.enabled);
        assert_eq!(cfg.wifi.retries, 3);
    }

    #[test]
    fn parses_full_file() {
        let cfg: Config = toml::from_str(
            r#"
            [general]
            log_level = "debug"

            [sync]
            url = "http://10.0.0.5/dir?dir=A:"
            path = "/tmp/card"
            overwrite = true
            ignore = ["JOURNAL.JNL", "System Volume Information"]
            expected_files = 40

            [sync.rename]
            "STR.EDF" = "STR.edf"
            "IDENT.TGT" = "Identification.tgt"

            [wifi]
            enabled = true
            ssid = "card"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.general.log_level, "debug");
        assert!(cfg.sync.overwrite);
        assert!(!cfg.sync.keep_old);
        assert_eq!(cfg.sync.rename.len(), 2);
        assert_eq!(cfg.wifi.psk, "88888888");

        let opts = cfg.sync_options().unwrap();
        assert_eq!(opts.expected_files, Some(40));
        assert!(opts.rules.ignore.contains("JOURNAL.JNL"));
        assert!(opts.policy.overwrite);
        assert_eq!(opts.root_url.host_str(), Some("10.0.0.5"));
    }

    #[test]
    fn zero_expected_files_means_unknown() {
        let opts = Config::default().sync_options().unwrap();
        assert_eq!(opts.expected_files, None);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn explicit_file_is_reported_as_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sync]\nkeep_old = true\n").unwrap();

        let loaded = load_config(Some(&path)).unwrap();

        assert_eq!(loaded.source.as_deref(), Some(path.as_path()));
        assert!(loaded.config.sync.keep_old);
    }

    #[test]
    fn validate_checks_url_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.sync.path = dir.path().to_path_buf();
        cfg.validate().unwrap();

        cfg.sync.url = "ftp://192.168.4.1/".into();
        assert!(cfg.validate().is_err());

        cfg.sync.url = default_url();
        cfg.sync.path = dir.path().join("absent");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tilde_is_expanded() {
        let expanded = expand_tilde(Path::new("~/Documents/x")).unwrap();
        assert!(!expanded.starts_with("~"));
        assert!(expanded.ends_with("Documents/x"));
        assert_eq!(expand_tilde(Path::new("/abs")).unwrap(), PathBuf::from("/abs"));
    }

    #[test]
    fn redacted_output_hides_psk() {
        let rendered = Config::default().to_redacted_toml().unwrap();
        assert!(!rendered.contains("88888888"));
        assert!(rendered.contains("ez Share"));
    }
}
