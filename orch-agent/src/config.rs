//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Agent configuration. File: ~/.config/orch-agent/config.toml or /etc/orch-agent/config.toml.
/// Env overrides: ORCH_PORT, ORCH_DATA_DIR, ORCH_BROADCAST.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UDP port for discovery and inbound commands (default 30030).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bootstrap discovery target (default 255.255.255.255). May be an address or a hostname.
    #[serde(default = "default_broadcast")]
    pub broadcast: String,
    /// Directory holding config.json and device.log.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Bootstrap reply wait (default 1000 ms).
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    /// TCP connect bound (default 8000 ms).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per-chunk write bound while streaming a file (default 8000 ms).
    #[serde(default = "default_write_idle_ms")]
    pub write_idle_ms: u64,
    /// Push ends after this long without new bytes (default 5000 ms).
    #[serde(default = "default_receive_idle_ms")]
    pub receive_idle_ms: u64,
    /// Wake timer after a restart request (default 200 ms).
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// Update-engine polling interval (default 1 s).
    #[serde(default = "default_update_poll_ms")]
    pub update_poll_ms: u64,
    /// Default log filter when ORCH_LOG / RUST_LOG are unset.
    #[serde(default = "default_log")]
    pub log: String,
    /// Identity overrides.
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub hardware_model: Option<String>,
}

fn default_port() -> u16 {
    orch_core::DEFAULT_PORT
}
fn default_broadcast() -> String {
    orch_core::BROADCAST_ADDRESS.to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/orch-agent")
}
fn default_discovery_timeout_ms() -> u64 {
    1000
}
fn default_connect_timeout_ms() -> u64 {
    8000
}
fn default_write_idle_ms() -> u64 {
    8000
}
fn default_receive_idle_ms() -> u64 {
    5000
}
fn default_restart_delay_ms() -> u64 {
    200
}
fn default_update_poll_ms() -> u64 {
    1000
}
fn default_log() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            broadcast: default_broadcast(),
            data_dir: default_data_dir(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            write_idle_ms: default_write_idle_ms(),
            receive_idle_ms: default_receive_idle_ms(),
            restart_delay_ms: default_restart_delay_ms(),
            update_poll_ms: default_update_poll_ms(),
            log: default_log(),
            hostname: None,
            mac_address: None,
            hardware_model: None,
        }
    }
}

/// Bounds for every suspension point in the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub discovery: Duration,
    pub connect: Duration,
    pub write_idle: Duration,
    pub receive_idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Config::default().timeouts()
    }
}

impl Config {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            discovery: Duration::from_millis(self.discovery_timeout_ms),
            connect: Duration::from_millis(self.connect_timeout_ms),
            write_idle: Duration::from_millis(self.write_idle_ms),
            receive_idle: Duration::from_millis(self.receive_idle_ms),
        }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("device.log")
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("ORCH_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.port = p;
        }
    }
    if let Some(s) = var("ORCH_DATA_DIR") {
        if !s.is_empty() {
            c.data_dir = PathBuf::from(s);
        }
    }
    if let Some(s) = var("ORCH_BROADCAST") {
        if !s.is_empty() {
            c.broadcast = s;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/orch-agent/config.toml"));
    }
    out.push(PathBuf::from("/etc/orch-agent/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    config_paths()
        .into_iter()
        .find(|p| p.exists())
        .and_then(|p| parse_file(&p))
}

fn parse_file(path: &Path) -> Option<Config> {
    let s = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<Config>(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            // Logging is not up yet.
            eprintln!("orch-agent: ignoring {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.port, 30030);
        assert_eq!(c.broadcast, "255.255.255.255");
        let t = c.timeouts();
        assert_eq!(t.discovery, Duration::from_millis(1000));
        assert_eq!(t.connect, Duration::from_secs(8));
        assert_eq!(t.receive_idle, Duration::from_secs(5));
        assert_eq!(c.settings_path(), PathBuf::from("/var/lib/orch-agent/config.json"));
        assert_eq!(c.log_path(), PathBuf::from("/var/lib/orch-agent/device.log"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str("port = 31000\nhostname = \"bench-1\"\n").unwrap();
        assert_eq!(c.port, 31000);
        assert_eq!(c.hostname.as_deref(), Some("bench-1"));
        assert_eq!(c.connect_timeout_ms, 8000);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("prot = 1\n").is_err());
    }

    #[test]
    fn bad_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(parse_file(&path).is_none());
        std::fs::write(&path, "data_dir = \"/tmp/x\"").unwrap();
        assert_eq!(parse_file(&path).unwrap().data_dir, PathBuf::from("/tmp/x"));
    }

    #[test]
    fn env_overrides() {
        let mut c = Config::default();
        apply_env(&mut c, |k| match k {
            "ORCH_PORT" => Some("40000".into()),
            "ORCH_DATA_DIR" => Some("/data".into()),
            "ORCH_BROADCAST" => Some("10.0.0.255".into()),
            _ => None,
        });
        assert_eq!(c.port, 40000);
        assert_eq!(c.data_dir, PathBuf::from("/data"));
        assert_eq!(c.broadcast, "10.0.0.255");

        let mut c = Config::default();
        apply_env(&mut c, |k| (k == "ORCH_PORT").then(|| "nope".to_string()));
        assert_eq!(c.port, 30030);
    }
}
