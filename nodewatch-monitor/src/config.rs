/**
 * CONFIG - JSON configuration file and report-token store
 *
 * ROLE:
 * Loads `node_monitor_config.json` (defaults for every missing key), exposes the
 * agent launch settings and owns the `report_tokens` map that the reconciler fills
 * and the reporter reads.
 *
 * PERSISTENCE:
 * The whole file is rewritten on every token change: serialize to a sibling temp
 * file, then rename over the target so a crash never leaves a truncated config.
 */

use crate::probe::framing::FramingMode;
use crate::state::{new_state, snapshot, Shared};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, warn};

pub const DEFAULT_CONFIG_FILE: &str = "node_monitor_config.json";

/// Lower bound applied to `settle_delay`.
pub const MIN_SETTLE_DELAY_SECS: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid agent extra_args: {0}")]
    ExtraArgs(#[from] shell_words::ParseError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// node name -> report token
    pub report_tokens: BTreeMap<String, String>,
    /// Seconds, per probe stage and per HTTP request.
    pub connection_timeout: u64,
    /// Seconds between two successive reports.
    pub node_delay: f64,
    pub max_retries: u32,
    pub log_level: String,
    pub local_api: String,
    pub settle_delay: u64,
    pub cycle_interval: u64,
    pub skip_unchanged_updates: bool,
    pub rpc_framing: FramingMode,
    pub probe_concurrency: usize,
    pub agent: AgentConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            report_tokens: BTreeMap::new(),
            connection_timeout: 5,
            node_delay: 1.0,
            max_retries: 3,
            log_level: "INFO".to_string(),
            local_api: "http://127.0.0.1:8080".to_string(),
            settle_delay: MIN_SETTLE_DELAY_SECS,
            cycle_interval: 300,
            skip_unchanged_updates: false,
            rpc_framing: FramingMode::default(),
            probe_concurrency: 32,
            agent: AgentConfig::default(),
        }
    }
}

impl MonitorConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout.max(1))
    }

    pub fn node_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.node_delay).unwrap_or(Duration::ZERO)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay)
    }

    /// Raises `settle_delay` to [`MIN_SETTLE_DELAY_SECS`]. Returns true when it was lower.
    pub fn clamp_settle_delay(&mut self) -> bool {
        if self.settle_delay < MIN_SETTLE_DELAY_SECS {
            self.settle_delay = MIN_SETTLE_DELAY_SECS;
            return true;
        }
        false
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval)
    }

    /// Maps the level names kept in the file (`DEBUG`, `WARNING`, ...) to a tracing directive.
    pub fn tracing_directive(&self) -> &'static str {
        match self.log_level.to_ascii_uppercase().as_str() {
            "DEBUG" => "debug",
            "WARNING" | "WARN" => "warn",
            "ERROR" => "error",
            "TRACE" => "trace",
            _ => "info",
        }
    }
}

/// How the monitor launches the management service and the per-node agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub bin_dir: PathBuf,
    pub service_binary: String,
    pub core_binary: String,
    pub launch_service: bool,
    pub probe_agents: bool,
    pub rpc_host: String,
    pub rpc_base_port: u16,
    /// Seconds
    pub startup_timeout: u64,
    /// Seconds
    pub grace_period: u64,
    /// Appended to every core agent command line, shell-quoted.
    pub extra_args: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bin_dir: PathBuf::from("bin"),
            service_binary: "easytier-uptime".to_string(),
            core_binary: "easytier-core".to_string(),
            launch_service: true,
            probe_agents: true,
            rpc_host: "127.0.0.1".to_string(),
            rpc_base_port: 15888,
            startup_timeout: 30,
            grace_period: 5,
            extra_args: String::new(),
        }
    }
}

impl AgentConfig {
    pub fn extra_args(&self) -> Result<Vec<String>, ConfigError> {
        Ok(shell_words::split(&self.extra_args)?)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period)
    }
}

/// Reads the config file. A missing, empty or invalid file yields defaults.
pub async fn load_config(path: &Path) -> MonitorConfig {
    if !path.exists() {
        warn!(path = %path.display(), "config file not found, using defaults");
        return MonitorConfig::default();
    }
    let txt = match fs::read_to_string(path).await {
        Ok(txt) => txt,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "config file unreadable, using defaults");
            return MonitorConfig::default();
        }
    };
    if txt.trim().is_empty() {
        return MonitorConfig::default();
    }
    serde_json::from_str(&txt).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "invalid config, using defaults");
        MonitorConfig::default()
    })
}

/// Writes the whole config through a temp file + rename.
pub async fn save_config(path: &Path, config: &MonitorConfig) -> Result<(), ConfigError> {
    let content = serde_json::to_string_pretty(config)?;
    let tmp = temp_path(path);
    fs::write(&tmp, content).await.map_err(|source| ConfigError::Io {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).await.map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.into());
    name.push(".tmp");
    path.with_file_name(name)
}

/// The loaded config plus the file it came from. The reconciler is the only writer.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    inner: Shared<MonitorConfig>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>, config: MonitorConfig) -> Self {
        Self {
            path: path.into(),
            inner: new_state(config),
        }
    }

    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let config = load_config(&path).await;
        Self::new(path, config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> MonitorConfig {
        snapshot(&self.inner)
    }

    pub fn report_token(&self, node_name: &str) -> Option<String> {
        self.inner.lock().report_tokens.get(node_name).cloned()
    }

    /// Persists a token, then records it in memory. Returns `false` when the token was
    /// already known. A failed save leaves memory untouched so the next harvest retries.
    pub async fn set_report_token(&self, node_name: &str, token: &str) -> Result<bool, ConfigError> {
        let staged = {
            let cfg = self.inner.lock();
            if cfg.report_tokens.get(node_name).map(String::as_str) == Some(token) {
                return Ok(false);
            }
            let mut staged = cfg.clone();
            staged.report_tokens.insert(node_name.to_string(), token.to_string());
            staged
        };
        save_config(&self.path, &staged).await?;
        self.inner
            .lock()
            .report_tokens
            .insert(node_name.to_string(), token.to_string());
        debug!(node = node_name, "report token saved");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let cfg = load_config(&dir.path().join("absent.json")).await;
        assert_eq!(cfg, MonitorConfig::default());
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.connection_timeout, 5);
    }

    #[tokio::test]
    async fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        std::fs::write(
            &path,
            r#"{"report_tokens": {"hk-1": "t1"}, "max_retries": 5, "rpc_framing": "brace_count"}"#,
        )
        .unwrap();

        let cfg = load_config(&path).await;
        assert_eq!(cfg.report_tokens.get("hk-1").map(String::as_str), Some("t1"));
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.rpc_framing, FramingMode::BraceCount);
        assert_eq!(cfg.node_delay, 1.0);
        assert_eq!(cfg.agent.rpc_base_port, 15888);
    }

    #[tokio::test]
    async fn test_invalid_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(load_config(&path).await, MonitorConfig::default());
    }

    #[tokio::test]
    async fn test_token_store_persists_whole_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        let store = ConfigStore::new(&path, MonitorConfig::default());

        assert!(store.set_report_token("hk-1", "abc").await.unwrap());
        assert!(!store.set_report_token("hk-1", "abc").await.unwrap());
        assert!(!dir.path().join("cfg.json.tmp").exists());

        let reloaded = ConfigStore::open(&path).await;
        assert_eq!(reloaded.report_token("hk-1").as_deref(), Some("abc"));
        assert_eq!(reloaded.current().log_level, "INFO");
    }

    #[tokio::test]
    async fn test_failed_save_is_retried_on_next_harvest() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("not-yet");
        let path = nested.join("cfg.json");
        let store = ConfigStore::new(&path, MonitorConfig::default());

        assert!(matches!(
            store.set_report_token("hk-1", "abc").await,
            Err(ConfigError::Io { .. })
        ));
        assert_eq!(store.report_token("hk-1"), None);

        std::fs::create_dir_all(&nested).unwrap();
        assert!(store.set_report_token("hk-1", "abc").await.unwrap());
        assert!(path.exists());
        assert_eq!(load_config(&path).await.report_tokens.get("hk-1").map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_settle_delay_clamp() {
        let mut cfg = MonitorConfig {
            settle_delay: 3,
            log_level: "WARNING".into(),
            ..MonitorConfig::default()
        };
        assert!(cfg.clamp_settle_delay());
        assert_eq!(cfg.settle_delay(), Duration::from_secs(30));
        assert!(!cfg.clamp_settle_delay());
        assert_eq!(cfg.tracing_directive(), "warn");
    }

    #[test]
    fn test_extra_args_are_shell_split() {
        let agent = AgentConfig {
            extra_args: r#"--hostname "edge probe" --no-tun"#.to_string(),
            ..AgentConfig::default()
        };
        assert_eq!(agent.extra_args().unwrap(), vec!["--hostname", "edge probe", "--no-tun"]);
    }
}
