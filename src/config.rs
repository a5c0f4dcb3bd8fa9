//! Agent configuration.
//!
//! Configuration is JSON, read from a file given on the command line or from
//! the `DDS_AGENT_CONFIG` environment variable. Every field has a default, so
//! an empty object (or no configuration at all) is valid. The commander's
//! address comes from a separate server-info file written by the commander.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

/// Name of the agent's own log file inside the work directory.
pub const LOG_FILE_NAME: &str = "dds-agent.log";

/// Top-level configuration for the agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Installation / working directory: logs, server info, identity.
    pub work_dir: PathBuf,

    /// Identity file. Defaults to `<work_dir>/dds-agent.uuid`.
    pub identity_file: Option<PathBuf>,

    /// Server-info file. Defaults to `<work_dir>/server_info.cfg`.
    pub server_info_file: Option<PathBuf>,

    /// Watchdog tick interval in seconds.
    pub idle_time_seconds: f64,

    /// How long starting a user task may take.
    pub task_timeout_seconds: u64,

    /// How long creating the log archive may take.
    pub archive_timeout_seconds: u64,

    /// Where to look for `tar`, in order.
    pub tar_candidates: Vec<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            identity_file: None,
            server_info_file: None,
            idle_time_seconds: DEFAULT_IDLE_TIME,
            task_timeout_seconds: 60,
            archive_timeout_seconds: 60,
            tar_candidates: [
                "/usr/bin/tar",
                "/usr/local/bin/tar",
                "/opt/local/bin/tar",
                "/bin/tar",
            ]
            .into_iter()
            .map(PathBuf::from)
            .collect(),
        }
    }
}

const DEFAULT_IDLE_TIME: f64 = 1800.0;

fn default_work_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_default().join(".DDS")
}

impl AgentConfig {
    /// Load from `DDS_AGENT_CONFIG` if set, else defaults; then apply
    /// environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("DDS_AGENT_CONFIG") {
            Ok(json) => Self::from_json(&json).context("Failed to parse DDS_AGENT_CONFIG")?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from a JSON file, then apply environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_json(&json)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    /// Apply `DDS_LOCATION` (work dir) and `DDS_AGENT_IDLE_TIME` (seconds).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("DDS_LOCATION").filter(|d| !d.is_empty()) {
            debug!(work_dir = %dir, "Work directory overridden by DDS_LOCATION");
            self.work_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup("DDS_AGENT_IDLE_TIME") {
            match raw.parse() {
                Ok(seconds) => self.idle_time_seconds = seconds,
                Err(e) => warn!(value = %raw, error = %e, "Ignoring invalid DDS_AGENT_IDLE_TIME"),
            }
        }
    }

    pub fn identity_file(&self) -> PathBuf {
        self.identity_file
            .clone()
            .unwrap_or_else(|| self.work_dir.join("dds-agent.uuid"))
    }

    pub fn server_info_file(&self) -> PathBuf {
        self.server_info_file
            .clone()
            .unwrap_or_else(|| self.work_dir.join("server_info.cfg"))
    }

    pub fn log_file(&self) -> PathBuf {
        self.work_dir.join(LOG_FILE_NAME)
    }

    /// Watchdog interval. Non-positive or invalid values fall back to the default.
    pub fn idle_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.idle_time_seconds)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or_else(|| Duration::from_secs_f64(DEFAULT_IDLE_TIME))
    }

    pub const fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_seconds)
    }

    pub const fn archive_timeout(&self) -> Duration {
        Duration::from_secs(self.archive_timeout_seconds)
    }
}

/// Commander endpoint read from the server-info file.
///
/// The file is INI-style; only `host` and `port` in the `[server]` section
/// are used:
///
/// ```text
/// [server]
/// host=commander.example.org
/// port=20000
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub host: String,
    pub port: u16,
}

impl ServerInfo {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read server info file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid server info file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut section = "";
        let mut host = None;
        let mut port = None;

        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = name.trim();
                continue;
            }
            if section != "server" {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "host" => host = Some(value.to_string()),
                "port" => {
                    port = Some(
                        value
                            .parse::<u16>()
                            .with_context(|| format!("Invalid server.port '{value}'"))?,
                    );
                }
                _ => {}
            }
        }

        Ok(Self {
            host: host
                .filter(|h| !h.is_empty())
                .context("Missing server.host")?,
            port: port.context("Missing server.port")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_object_gives_defaults() {
        let config = AgentConfig::from_json("{}").unwrap();
        assert_eq!(config.task_timeout(), Duration::from_secs(60));
        assert_eq!(config.archive_timeout(), Duration::from_secs(60));
        assert_eq!(config.idle_interval(), Duration::from_secs(1800));
        assert_eq!(config.tar_candidates.len(), 4);
        assert!(config.work_dir.ends_with(".DDS"));
    }

    #[test]
    fn derived_paths_follow_work_dir() {
        let config = AgentConfig::from_json(r#"{"work_dir": "/srv/dds"}"#).unwrap();
        assert_eq!(config.identity_file(), PathBuf::from("/srv/dds/dds-agent.uuid"));
        assert_eq!(config.server_info_file(), PathBuf::from("/srv/dds/server_info.cfg"));
        assert_eq!(config.log_file(), PathBuf::from("/srv/dds/dds-agent.log"));
    }

    #[test]
    fn explicit_paths_win() {
        let config = AgentConfig::from_json(
            r#"{"work_dir": "/srv/dds", "identity_file": "/var/lib/agent.uuid", "server_info_file": "/etc/dds/server.ini"}"#,
        )
        .unwrap();
        assert_eq!(config.identity_file(), PathBuf::from("/var/lib/agent.uuid"));
        assert_eq!(config.server_info_file(), PathBuf::from("/etc/dds/server.ini"));
    }

    #[test]
    fn overrides_apply() {
        let env = HashMap::from([
            ("DDS_LOCATION", "/tmp/dds-work"),
            ("DDS_AGENT_IDLE_TIME", "2.5"),
        ]);
        let mut config = AgentConfig::default();
        config.apply_overrides(|key| env.get(key).map(ToString::to_string));
        assert_eq!(config.work_dir, PathBuf::from("/tmp/dds-work"));
        assert_eq!(config.idle_interval(), Duration::from_millis(2500));
    }

    #[test]
    fn invalid_idle_override_is_ignored() {
        let mut config = AgentConfig::default();
        config.apply_overrides(|key| (key == "DDS_AGENT_IDLE_TIME").then(|| "soon".to_string()));
        assert_eq!(config.idle_interval(), Duration::from_secs(1800));
    }

    #[test]
    fn zero_idle_time_falls_back_to_default() {
        let config = AgentConfig::from_json(r#"{"idle_time_seconds": 0}"#).unwrap();
        assert_eq!(config.idle_interval(), Duration::from_secs(1800));
        let config = AgentConfig::from_json(r#"{"idle_time_seconds": -3}"#).unwrap();
        assert_eq!(config.idle_interval(), Duration::from_secs(1800));
    }

    #[test]
    fn config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        std::fs::write(&path, r#"{"task_timeout_seconds": 5}"#).unwrap();
        let config = AgentConfig::from_file(&path).unwrap();
        assert_eq!(config.task_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn parse_server_info() {
        let info = ServerInfo::parse(
            "# written by dds-commander\n[server]\nhost=node01.cluster\nport = 20001\n\n[other]\nport=1\n",
        )
        .unwrap();
        assert_eq!(
            info,
            ServerInfo {
                host: "node01.cluster".to_string(),
                port: 20001
            }
        );
    }

    #[test]
    fn server_info_requires_both_fields() {
        assert!(ServerInfo::parse("[server]\nhost=a\n").is_err());
        assert!(ServerInfo::parse("[server]\nport=1\n").is_err());
        assert!(ServerInfo::parse("host=a\nport=1\n").is_err());
        assert!(ServerInfo::parse("[server]\nhost=a\nport=http\n").is_err());
    }

    #[test]
    fn missing_server_info_file_is_an_error() {
        let err = ServerInfo::from_file(Path::new("/nonexistent/server_info.cfg")).unwrap_err();
        assert!(err.to_string().contains("server info"));
    }
}
