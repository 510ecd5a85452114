use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::AgentProfile;

/// Top-level server config, loaded from TOML.
///
/// Every field has a default, so an empty file (or no file) is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub sessions: SessionsSection,
    pub process: ProcessSection,
    /// Agent profiles by name. Viewers pick one with `?agent=` on first attach.
    pub agents: BTreeMap<String, AgentProfile>,
    pub uploads: UploadsSection,
    pub debug: DebugSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            sessions: SessionsSection::default(),
            process: ProcessSection::default(),
            agents: BTreeMap::from([("claude".to_string(), AgentProfile::default())]),
            uploads: UploadsSection::default(),
            debug: DebugSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: SocketAddr,
    /// Period of the unsolicited status broadcast.
    pub status_interval_ms: u64,
    /// Outbound frames queued per viewer before it is disconnected.
    pub viewer_queue: usize,
    pub max_viewers: usize,
    /// PTY output kept for replay to newly attached viewers.
    pub replay_bytes: usize,
    /// Input frames buffered while the process is not running.
    pub pending_input: usize,
    /// Listening ports never reported in status snapshots.
    pub ignored_ports: Vec<u16>,
    /// Extra origins allowed to call the HTTP API cross-origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 7681)),
            status_interval_ms: 5_000,
            viewer_queue: 256,
            max_viewers: 64,
            replay_bytes: 256 * 1024,
            pending_input: 256,
            ignored_ports: Vec::new(),
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsSection {
    /// Parent of per-session working directories (`<root>/<id>`).
    pub workspace_root: PathBuf,
    /// Where session records (metadata + resume token) are kept.
    pub state_dir: PathBuf,
    /// Create a session when a viewer attaches to an unknown id.
    pub auto_create: bool,
    /// How often to check for removed working directories. 0 disables.
    pub reap_interval_ms: u64,
}

impl Default for SessionsSection {
    fn default() -> Self {
        let base = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ptyhub");
        Self {
            workspace_root: base.join("workspaces"),
            state_dir: base.join("sessions"),
            auto_create: true,
            reap_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSection {
    pub default_agent: String,
    pub validate_timeout_ms: u64,
    pub spawn_timeout_ms: u64,
    /// Time between SIGHUP and SIGKILL on teardown.
    pub grace_period_ms: u64,
    /// Branch the exit-time worktree comparison is made against.
    pub worktree_base: String,
    pub default_rows: u16,
    pub default_cols: u16,
}

impl Default for ProcessSection {
    fn default() -> Self {
        Self {
            default_agent: "claude".to_string(),
            validate_timeout_ms: 5_000,
            spawn_timeout_ms: 10_000,
            grace_period_ms: 3_000,
            worktree_base: "main".to_string(),
            default_rows: 24,
            default_cols: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadsSection {
    /// Upload directory, relative to the session working directory.
    pub dir: PathBuf,
    pub max_bytes: usize,
}

impl Default for UploadsSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("uploads"),
            max_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugSection {
    /// Telemetry events kept per debug channel.
    pub backlog: usize,
    pub query_timeout_ms: u64,
}

impl Default for DebugSection {
    fn default() -> Self {
        Self {
            backlog: 500,
            query_timeout_ms: 5_000,
        }
    }
}

impl ServerSection {
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }
}

impl ProcessSection {
    pub fn validate_timeout(&self) -> Duration {
        Duration::from_millis(self.validate_timeout_ms)
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl DebugSection {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl Config {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Load `path` if given and present, otherwise the default config.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Ok(Self::load(p)?.unwrap_or_default()),
            None => Ok(Self::default()),
        }
    }

    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("ptyhub").join("config.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.agents.contains_key(&self.process.default_agent) {
            return Err(ConfigError::Invalid(format!(
                "default agent '{}' has no [agents.{}] profile",
                self.process.default_agent, self.process.default_agent
            )));
        }
        if self.server.viewer_queue == 0 {
            return Err(ConfigError::Invalid("server.viewer_queue must be at least 1".into()));
        }
        for (name, agent) in &self.agents {
            if agent.program.is_empty() {
                return Err(ConfigError::Invalid(format!("agent '{name}' has an empty program")));
            }
        }
        Ok(())
    }

    /// Look up an agent profile, falling back to the default agent.
    pub fn agent(&self, name: Option<&str>) -> Option<(&str, &AgentProfile)> {
        let name = name.unwrap_or(&self.process.default_agent);
        self.agents.get_key_value(name).map(|(k, v)| (k.as_str(), v))
    }
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Check file permissions on a config file and warn if world-readable.
///
/// Agent profiles may carry API keys in their `env` tables.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}). \
             Agent env tables may hold secrets -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Returns true if the given file mode has the world-readable bit set.
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.viewer_queue, 256);
        assert_eq!(config.process.validate_timeout(), Duration::from_secs(5));
        assert!(config.agents.contains_key("claude"));
        config.validate().unwrap();
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let toml = r#"
            [server]
            bind = "0.0.0.0:9000"
            max_viewers = 4

            [process]
            default_agent = "shell"
            grace_period_ms = 500

            [agents.shell]
            program = "/bin/sh"
            fresh_args = []
            resume_args = []
            validate_args = []
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.server.max_viewers, 4);
        assert_eq!(config.server.status_interval_ms, 5_000);
        assert_eq!(config.process.grace_period(), Duration::from_millis(500));
        config.validate().unwrap();

        let (name, shell) = config.agent(None).unwrap();
        assert_eq!(name, "shell");
        assert_eq!(shell.program, "/bin/sh");
        assert!(!shell.can_validate());
    }

    #[test]
    fn unknown_default_agent_is_invalid() {
        let config: Config = toml::from_str("[process]\ndefault_agent = \"ghost\"\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(&dir.path().join("nope.toml")).unwrap().is_none());
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[server\nbind = 1").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(..)));
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn world_readable_bit() {
        assert!(is_world_readable(0o644));
        assert!(!is_world_readable(0o600));
    }
}
