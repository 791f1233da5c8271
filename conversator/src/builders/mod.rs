//! Builder adapters - uniform interface over remote agent servers.
//!
//! Each adapter variant implements the capability set the orchestrator
//! needs: create session, send message, stream events, abort, health. A
//! registry maps declared builder names to live adapter instances; selection
//! is a per-task decision recorded on dispatch.
//!
//! Adapters absorb remote errors and re-emit them as domain events through
//! the session consumer, so the state machine stays the only source of
//! status truth.

pub mod opencode;
pub mod sse;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use shared_types::{ArtifactRef, GateKind, RemoteSessionStatus};

use crate::config::{BuilderDecl, TimeoutPolicy};

#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    /// Connection-level failure; retry with backoff.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote timed out during {0}")]
    Timeout(String),

    /// The remote answered with a non-success status.
    #[error("remote rejected request ({status}): {message}")]
    Remote { status: u16, message: String },

    /// Malformed remote payload; logged with the raw body, never retried.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote session {0} not found")]
    SessionNotFound(String),
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Transport(_) | AdapterError::Timeout(_))
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AdapterError::Timeout(e.to_string())
        } else {
            AdapterError::Transport(e.to_string())
        }
    }
}

/// A recognized event observed on the remote stream. Translation is total:
/// every recognized remote frame maps to exactly one of these; unrecognized
/// frames are logged and dropped by the adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    Status { status: RemoteSessionStatus },
    Gate { gate_id: String, kind: GateKind, description: String, files: Vec<String> },
    Artifact { kind: String, path: String },
    Completed { artifacts: Vec<ArtifactRef> },
    Failed { reason: String },
}

/// Result of a session health probe during reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionHealth {
    Running,
    Terminal(RemoteSessionStatus),
    /// The remote no longer knows the session.
    Gone,
}

/// One live stream of remote events. The receiver yields frames until the
/// stream ends or errors; reconnecting is the consumer's responsibility.
pub type RemoteEventRx = mpsc::Receiver<Result<RemoteEvent, AdapterError>>;

/// Capability set every concrete builder adapter implements.
#[async_trait]
pub trait BuilderAdapter: Send + Sync {
    /// Declared name this adapter was registered under.
    fn name(&self) -> &str;

    /// Protocol family ("opencode", ...).
    fn kind(&self) -> &str;

    fn endpoint(&self) -> &str;

    /// Bound on concurrently live sessions for this builder.
    fn max_sessions(&self) -> usize {
        4
    }

    /// Service-level liveness, independent of any session.
    async fn ping(&self) -> bool;

    /// Create a remote session; returns the remote-assigned session id.
    async fn create_session(&self, task_id: &str) -> Result<String, AdapterError>;

    /// Send a text message into an existing session.
    async fn send_message(&self, session_id: &str, text: &str) -> Result<(), AdapterError>;

    /// Open the remote event stream filtered to one session.
    async fn stream_events(&self, session_id: &str) -> Result<RemoteEventRx, AdapterError>;

    async fn abort(&self, session_id: &str) -> Result<(), AdapterError>;

    async fn health(&self, session_id: &str) -> Result<SessionHealth, AdapterError>;

    /// Forward a gate decision to the remote.
    async fn resolve_gate(
        &self,
        session_id: &str,
        gate_id: &str,
        approve: bool,
    ) -> Result<(), AdapterError>;
}

/// Idempotency token for a dispatch: stable for the same task and frozen
/// contract, different once the contract changes.
pub fn dispatch_token(task_id: &str, handoff_digest: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(handoff_digest.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown builder kind '{kind}' for builder '{name}'")]
    UnknownKind { name: String, kind: String },
    #[error("duplicate builder name '{0}'")]
    DuplicateName(String),
    #[error("failed to construct adapter '{name}': {message}")]
    Construction { name: String, message: String },
}

/// Current health of one registered builder, for the fan-out surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BuilderHealth {
    pub name: String,
    pub kind: String,
    pub endpoint: String,
    pub healthy: bool,
}

/// Registry of live adapters keyed by declared builder name.
pub struct BuilderRegistry {
    adapters: HashMap<String, Arc<dyn BuilderAdapter>>,
}

impl std::fmt::Debug for BuilderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuilderRegistry")
            .field("adapters", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BuilderRegistry {
    pub fn from_config(
        decls: &[BuilderDecl],
        timeouts: &TimeoutPolicy,
    ) -> Result<Self, RegistryError> {
        let mut adapters: HashMap<String, Arc<dyn BuilderAdapter>> = HashMap::new();
        for decl in decls {
            if adapters.contains_key(&decl.name) {
                return Err(RegistryError::DuplicateName(decl.name.clone()));
            }
            let adapter: Arc<dyn BuilderAdapter> = match decl.kind.as_str() {
                "opencode" => Arc::new(
                    opencode::OpenCodeAdapter::new(decl.clone(), timeouts.clone()).map_err(
                        |e| RegistryError::Construction {
                            name: decl.name.clone(),
                            message: e.to_string(),
                        },
                    )?,
                ),
                other => {
                    return Err(RegistryError::UnknownKind {
                        name: decl.name.clone(),
                        kind: other.to_string(),
                    })
                }
            };
            adapters.insert(decl.name.clone(), adapter);
        }
        Ok(Self { adapters })
    }

    /// Build a registry from pre-constructed adapters (tests, embedding).
    pub fn from_adapters(adapters: Vec<Arc<dyn BuilderAdapter>>) -> Self {
        Self {
            adapters: adapters.into_iter().map(|a| (a.name().to_string(), a)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BuilderAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn health_all(&self) -> Vec<BuilderHealth> {
        let mut out = Vec::new();
        for name in self.names() {
            let adapter = &self.adapters[&name];
            out.push(BuilderHealth {
                name: name.clone(),
                kind: adapter.kind().to_string(),
                endpoint: adapter.endpoint().to_string(),
                healthy: adapter.ping().await,
            });
        }
        out
    }
}
