//! Conversator configuration
//!
//! Environment-driven settings plus a JSON builder-registry document.
//! The builder document declares the remote agent servers the adapter layer
//! may dispatch to; unknown builder kinds fail startup rather than at
//! dispatch time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read builders file {path}: {source}")]
    BuildersFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse builders file {path}: {source}")]
    BuildersParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to parse env var {key}={value}")]
    EnvParse { key: String, value: String },
}

/// Timeout and retry policy for remote builder interactions.
/// Values are configurable through the environment; these are the defaults.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    /// Remote session creation.
    pub session_create: Duration,
    /// Per-message send.
    pub send_message: Duration,
    /// Stream silence before a reconnect attempt.
    pub stream_idle: Duration,
    /// How long to wait for the remote to confirm an abort.
    pub abort_confirm: Duration,
    /// Re-surface an unanswered gate after this long.
    pub gate_reminder: Duration,
    /// First reconnect backoff; doubles up to `reconnect_cap`.
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    /// Reconnects beyond this count within `reconnect_window` mark the
    /// session lost.
    pub max_reconnects_per_window: u32,
    pub reconnect_window: Duration,
    /// Fixed retry count for abort calls.
    pub abort_retries: u32,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            session_create: Duration::from_secs(30),
            send_message: Duration::from_secs(60),
            stream_idle: Duration::from_secs(120),
            abort_confirm: Duration::from_secs(10),
            gate_reminder: Duration::from_secs(120),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(30),
            max_reconnects_per_window: 5,
            reconnect_window: Duration::from_secs(60),
            abort_retries: 3,
        }
    }
}

/// Per-builder limits declared in the registry document.
#[derive(Debug, Clone, Deserialize)]
pub struct BuilderLimits {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_max_sessions() -> usize {
    4
}

impl Default for BuilderLimits {
    fn default() -> Self {
        Self { max_sessions: default_max_sessions() }
    }
}

/// One remote builder declaration from the registry document.
#[derive(Debug, Clone, Deserialize)]
pub struct BuilderDecl {
    pub name: String,
    pub kind: String,
    pub endpoint: String,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub limits: BuilderLimits,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the on-disk workspace (`state/`, `prompts/`, `cache/`).
    pub workspace_root: PathBuf,
    /// Port the fan-out HTTP server listens on.
    pub port: u16,
    pub builders: Vec<BuilderDecl>,
    pub timeouts: TimeoutPolicy,
    /// Coalescing window for info/success inbox delivery hints.
    pub coalesce_window: Duration,
    /// Maximum commands admitted concurrently before callers see Busy.
    pub command_queue_depth: usize,
    /// Conversation feed ring-buffer capacity.
    pub conversation_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let workspace_root =
            PathBuf::from(env_str("CONVERSATOR_WORKSPACE", ".conversator"));

        let builders = match std::env::var("CONVERSATOR_BUILDERS_FILE") {
            Ok(path) => load_builders(Path::new(&path))?,
            Err(_) => vec![BuilderDecl {
                name: "default".to_string(),
                kind: "opencode".to_string(),
                endpoint: env_str("CONVERSATOR_BUILDER_ENDPOINT", "http://localhost:4096"),
                default_model: None,
                limits: BuilderLimits::default(),
            }],
        };

        Ok(Self {
            workspace_root,
            port: env_parse("CONVERSATOR_PORT", 8080)?,
            builders,
            timeouts: TimeoutPolicy {
                session_create: env_secs("CONVERSATOR_SESSION_CREATE_TIMEOUT_SECS", 30)?,
                send_message: env_secs("CONVERSATOR_SEND_TIMEOUT_SECS", 60)?,
                stream_idle: env_secs("CONVERSATOR_STREAM_IDLE_TIMEOUT_SECS", 120)?,
                abort_confirm: env_secs("CONVERSATOR_ABORT_CONFIRM_TIMEOUT_SECS", 10)?,
                gate_reminder: env_secs("CONVERSATOR_GATE_REMINDER_SECS", 120)?,
                ..TimeoutPolicy::default()
            },
            coalesce_window: env_secs("CONVERSATOR_COALESCE_WINDOW_SECS", 10)?,
            command_queue_depth: env_parse("CONVERSATOR_COMMAND_QUEUE_DEPTH", 64)?,
            conversation_capacity: env_parse("CONVERSATOR_CONVERSATION_CAPACITY", 1024)?,
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.workspace_root.join("state").join("events.db")
    }

    pub fn prompts_root(&self) -> PathBuf {
        self.workspace_root.join("prompts")
    }

    pub fn cache_root(&self) -> PathBuf {
        self.workspace_root.join("cache")
    }
}

fn load_builders(path: &Path) -> Result<Vec<BuilderDecl>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::BuildersFile {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::BuildersParse {
        path: path.to_path_buf(),
        source,
    })
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(val) => val.parse::<T>().map_err(|_| ConfigError::EnvParse {
            key: key.to_string(),
            value: val,
        }),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(env_parse(key, default)?))
}
