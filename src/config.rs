//! Configuration: bootstrap values from `.env` and relay settings from `settings.json`.

use std::{
    collections::BTreeMap,
    env, fs,
    net::IpAddr,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::storage::LayerName;

/// Process settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory holding every layer, the audit log and `settings.json`.
    pub data_dir: PathBuf,
    /// Listen address, e.g. `127.0.0.1:3334`.
    pub bind: String,
    /// Public host name used in relay URLs.
    pub domain: String,
    /// Hex secret of the relay's own signing key.
    pub relay_secret_key: String,
    /// `tracing` env-filter directive.
    pub log_filter: String,
    /// Optional SOCKS proxy (host:port) for outbound fetches.
    pub tor_socks: Option<String>,
    /// Reverse proxies whose `X-Forwarded-For` header is honoured. Loopback peers always are.
    pub trusted_proxies: Vec<IpAddr>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let data_dir = PathBuf::from(env::var("DATA_DIR").context("DATA_DIR")?);
        let bind = env::var("BIND").context("BIND")?;
        let relay_secret_key = env::var("RELAY_SECRET_KEY").context("RELAY_SECRET_KEY")?;
        let domain = env::var("DOMAIN")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "localhost".into());
        let log_filter = env::var("LOG_FILTER")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "info".into());
        let tor_socks = env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty());
        let trusted_proxies = csv_strings(env::var("TRUSTED_PROXIES").unwrap_or_default())
            .into_iter()
            .map(|p| p.parse::<IpAddr>().with_context(|| format!("TRUSTED_PROXIES entry {p}")))
            .collect::<Result<Vec<IpAddr>>>()?;
        Ok(Self {
            data_dir,
            bind,
            domain,
            relay_secret_key,
            log_filter,
            tor_socks,
            trusted_proxies,
        })
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("management.jsonl")
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    input
        .as_ref()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Name and contact details advertised for one mount.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountInfo {
    pub name: String,
    pub description: String,
    pub icon: String,
    pub contact: String,
}

/// Promotion threshold: `min(cap, max(floor, members * percent / 100))`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurationSettings {
    pub percent: u64,
    pub floor: u64,
    pub cap: u64,
}

impl CurationSettings {
    pub fn threshold(&self, members: usize) -> u64 {
        let scaled = members as u64 * self.percent / 100;
        scaled.max(self.floor).min(self.cap)
    }
}

impl Default for CurationSettings {
    fn default() -> Self {
        Self {
            percent: 20,
            floor: 0,
            cap: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaywallSettings {
    /// Only protected events carrying `["t", tag]` are paywalled; empty means every protected event.
    pub tag: String,
    /// Zero turns the paywall off.
    pub amount_sats: u64,
    pub period_days: u64,
}

impl Default for PaywallSettings {
    fn default() -> Self {
        Self {
            tag: String::new(),
            amount_sats: 0,
            period_days: 30,
        }
    }
}

impl PaywallSettings {
    pub fn enabled(&self) -> bool {
        self.amount_sats > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupsSettings {
    pub enabled: bool,
}

impl Default for GroupsSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboxSettings {
    /// Maximum `p` tags on an inbox event.
    pub hellthread_limit: usize,
    /// Keys never admitted to the web of trust.
    pub specifically_blocked: Vec<String>,
    /// Relays asked for follow lists the local store lacks.
    pub wot_relays: Vec<String>,
    /// Hours between web-of-trust rebuilds.
    pub wot_refresh_hours: u64,
}

impl Default for InboxSettings {
    fn default() -> Self {
        Self {
            hellthread_limit: 10,
            specifically_blocked: Vec::new(),
            wot_relays: Vec::new(),
            wot_refresh_hours: 24,
        }
    }
}

/// Relay-wide settings persisted as pretty JSON in `settings.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Owner key; the only writer and reader of `/personal`.
    pub master: String,
    pub max_invites_per_person: usize,
    pub require_current_timestamp: bool,
    /// Kinds accepted by the generic chain; empty accepts every kind.
    pub allowed_kinds: Vec<u16>,
    pub blocked_pubkeys: Vec<String>,
    /// Keyed by mount name (`main`, `inbox`, `groups`, ...).
    pub info: BTreeMap<String, MountInfo>,
    pub popular: CurationSettings,
    pub topmost: CurationSettings,
    pub paywall: PaywallSettings,
    pub groups: GroupsSettings,
    pub inbox: InboxSettings,
    /// Featured event id per layer.
    pub pinned: BTreeMap<LayerName, String>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            master: String::new(),
            max_invites_per_person: 4,
            require_current_timestamp: false,
            allowed_kinds: Vec::new(),
            blocked_pubkeys: Vec::new(),
            info: BTreeMap::new(),
            popular: CurationSettings::default(),
            topmost: CurationSettings {
                percent: 40,
                floor: 0,
                cap: 3,
            },
            paywall: PaywallSettings::default(),
            groups: GroupsSettings::default(),
            inbox: InboxSettings::default(),
            pinned: BTreeMap::new(),
        }
    }
}

impl RelaySettings {
    /// Read `path`, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(data) => serde_json::from_str(&data)
                .with_context(|| format!("parsing {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Atomically write the settings as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent_dir)?;
        let tmp = tempfile::NamedTempFile::new_in(&parent_dir)?;
        serde_json::to_writer_pretty(&tmp, self)?;
        tmp.persist(path)?;
        Ok(())
    }

    pub fn mount_info(&self, mount: &str) -> MountInfo {
        self.info.get(mount).cloned().unwrap_or_default()
    }

    pub fn kind_allowed(&self, kind: u16) -> bool {
        self.allowed_kinds.is_empty() || self.allowed_kinds.contains(&kind)
    }

    pub fn is_blocked(&self, pubkey: &str) -> bool {
        self.blocked_pubkeys.iter().any(|p| p == pubkey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs, sync::Mutex};
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: [&str; 7] = [
        "DATA_DIR",
        "BIND",
        "DOMAIN",
        "RELAY_SECRET_KEY",
        "LOG_FILTER",
        "TOR_SOCKS",
        "TRUSTED_PROXIES",
    ];

    fn clear_env() {
        for v in VARS.iter() {
            env::remove_var(v);
        }
    }

    #[test]
    fn loads_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "DATA_DIR=/tmp/pyramid\n",
                "BIND=127.0.0.1:3334\n",
                "DOMAIN=relay.example.com\n",
                "RELAY_SECRET_KEY=0101010101010101010101010101010101010101010101010101010101010101\n",
                "LOG_FILTER=debug\n",
                "TOR_SOCKS=127.0.0.1:9050\n",
                "TRUSTED_PROXIES=10.0.0.1, ::1\n",
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/pyramid"));
        assert_eq!(cfg.bind, "127.0.0.1:3334");
        assert_eq!(cfg.domain, "relay.example.com");
        assert_eq!(cfg.log_filter, "debug");
        assert_eq!(cfg.tor_socks, Some("127.0.0.1:9050".into()));
        assert_eq!(
            cfg.trusted_proxies,
            vec!["10.0.0.1".parse::<IpAddr>().unwrap(), "::1".parse().unwrap()]
        );
        assert_eq!(cfg.log_path(), PathBuf::from("/tmp/pyramid/management.jsonl"));
    }

    #[test]
    fn defaults_when_optional_absent() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "DATA_DIR=/tmp\n",
                "BIND=127.0.0.1:3334\n",
                "RELAY_SECRET_KEY=01\n",
                "TOR_SOCKS=\n",
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.domain, "localhost");
        assert_eq!(cfg.log_filter, "info");
        assert!(cfg.tor_socks.is_none());
        assert!(cfg.trusted_proxies.is_empty());
    }

    #[test]
    fn missing_required_fields_error() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "BIND=127.0.0.1:3334\n").unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());

        clear_env();
        fs::write(
            &env_path,
            "DATA_DIR=/tmp\nBIND=127.0.0.1:3334\nRELAY_SECRET_KEY=01\nTRUSTED_PROXIES=proxy.lan\n",
        )
        .unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
    }

    #[test]
    fn csv_helper() {
        assert_eq!(csv_strings("a, b , ,c"), vec!["a", "b", "c"]);
        assert!(csv_strings("").is_empty());
    }

    #[test]
    fn relay_settings_fill_missing_fields() {
        let s: RelaySettings =
            serde_json::from_str(r#"{"master":"ab","paywall":{"amount_sats":21}}"#).unwrap();
        assert_eq!(s.master, "ab");
        assert_eq!(s.max_invites_per_person, 4);
        assert_eq!(s.paywall.amount_sats, 21);
        assert_eq!(s.paywall.period_days, 30);
        assert_eq!(s.topmost.cap, 3);
        assert!(s.groups.enabled);
    }

    #[test]
    fn relay_settings_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        assert_eq!(RelaySettings::load(&path).unwrap(), RelaySettings::default());
        let mut s = RelaySettings::default();
        s.pinned.insert(LayerName::Popular, "ff".repeat(32));
        s.info.insert(
            "inbox".into(),
            MountInfo {
                name: "inbox".into(),
                ..Default::default()
            },
        );
        s.save(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n  \"master\""));
        assert!(text.contains("\"popular\": \"ffff"));
        assert_eq!(RelaySettings::load(&path).unwrap(), s);
        assert_eq!(s.mount_info("inbox").name, "inbox");
        assert_eq!(s.mount_info("groups"), MountInfo::default());
    }

    #[test]
    fn threshold_formula() {
        let popular = CurationSettings::default();
        assert_eq!(popular.threshold(20), 2);
        assert_eq!(popular.threshold(1000), 2);
        assert_eq!(popular.threshold(9), 1);
        let floored = CurationSettings {
            percent: 10,
            floor: 3,
            cap: 50,
        };
        assert_eq!(floored.threshold(10), 3);
        assert_eq!(floored.threshold(100), 10);
    }
}
