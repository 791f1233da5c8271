//! OpenCode builder adapter.
//!
//! Speaks the OpenCode server session API:
//!   POST /session                      create
//!   POST /session/:id/prompt_async     send a prompt to the build agent
//!   POST /session/:id/abort            cancel
//!   POST /session/:id/permissions/:pid answer a permission request
//!   GET  /session/status               per-session status map
//!   GET  /event                        server-sent event stream
//!
//! The SSE stream is shared across sessions; `stream_events` filters frames
//! down to the requested session and translates recognized frames into
//! [`RemoteEvent`]s. Unrecognized frame types are logged with their raw
//! payload and dropped.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use shared_types::{ArtifactRef, GateKind, RemoteSessionStatus};

use super::sse::SseDecoder;
use super::{AdapterError, BuilderAdapter, RemoteEvent, RemoteEventRx, SessionHealth};
use crate::config::{BuilderDecl, TimeoutPolicy};

pub struct OpenCodeAdapter {
    decl: BuilderDecl,
    timeouts: TimeoutPolicy,
    client: reqwest::Client,
}

impl OpenCodeAdapter {
    pub fn new(decl: BuilderDecl, timeouts: TimeoutPolicy) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AdapterError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { decl, timeouts, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.decl.endpoint.trim_end_matches('/'))
    }
}

#[async_trait]
impl BuilderAdapter for OpenCodeAdapter {
    fn name(&self) -> &str {
        &self.decl.name
    }

    fn kind(&self) -> &str {
        "opencode"
    }

    fn endpoint(&self) -> &str {
        &self.decl.endpoint
    }

    fn max_sessions(&self) -> usize {
        self.decl.limits.max_sessions
    }

    async fn ping(&self) -> bool {
        let request = self
            .client
            .get(self.url("/agent"))
            .timeout(std::time::Duration::from_secs(5));
        matches!(request.send().await, Ok(resp) if resp.status().is_success())
    }

    async fn create_session(&self, task_id: &str) -> Result<String, AdapterError> {
        let short: String = task_id.chars().take(8).collect();
        let response = self
            .client
            .post(self.url("/session"))
            .timeout(self.timeouts.session_create)
            .json(&serde_json::json!({ "title": format!("Task: {short}") }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AdapterError::Remote {
                status: status.as_u16(),
                message: "failed to create session".to_string(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AdapterError::Protocol(format!("bad create-session body: {e}")))?;
        body.get("id")
            .or_else(|| body.get("session_id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AdapterError::Protocol(format!("create-session body missing id: {body}")))
    }

    async fn send_message(&self, session_id: &str, text: &str) -> Result<(), AdapterError> {
        let mut payload = serde_json::json!({
            "agent": "build",
            "parts": [{"type": "text", "text": text}],
        });
        if let Some(model) = &self.decl.default_model {
            payload["model"] = Value::String(model.clone());
        }

        let response = self
            .client
            .post(self.url(&format!("/session/{session_id}/prompt_async")))
            .timeout(self.timeouts.send_message)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(AdapterError::SessionNotFound(session_id.to_string()));
        }
        if !status.is_success() {
            return Err(AdapterError::Remote {
                status: status.as_u16(),
                message: "failed to send prompt".to_string(),
            });
        }
        Ok(())
    }

    async fn stream_events(&self, session_id: &str) -> Result<RemoteEventRx, AdapterError> {
        let response = self.client.get(self.url("/event")).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AdapterError::Remote {
                status: status.as_u16(),
                message: "event stream refused".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(64);
        let session_id = session_id.to_string();
        let builder = self.decl.name.clone();

        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(AdapterError::from(e))).await;
                        return;
                    }
                };
                for frame in decoder.feed(&chunk) {
                    match translate_frame(&frame.data) {
                        Some((frame_session, event)) if frame_session == session_id => {
                            if tx.send(Ok(event)).await.is_err() {
                                return;
                            }
                        }
                        Some(_) => {} // another session's frame
                        None => {
                            tracing::debug!(
                                builder = %builder,
                                raw = %frame.data,
                                "Dropping unrecognized remote event"
                            );
                        }
                    }
                }
            }
            // Stream ended cleanly; the closed channel signals the consumer.
        });

        Ok(rx)
    }

    async fn abort(&self, session_id: &str) -> Result<(), AdapterError> {
        let response = self
            .client
            .post(self.url(&format!("/session/{session_id}/abort")))
            .timeout(self.timeouts.abort_confirm)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(AdapterError::SessionNotFound(session_id.to_string()));
        }
        if !status.is_success() {
            return Err(AdapterError::Remote {
                status: status.as_u16(),
                message: "abort refused".to_string(),
            });
        }
        Ok(())
    }

    async fn health(&self, session_id: &str) -> Result<SessionHealth, AdapterError> {
        let response = self
            .client
            .get(self.url("/session/status"))
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AdapterError::Remote {
                status: status.as_u16(),
                message: "status endpoint refused".to_string(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AdapterError::Protocol(format!("bad status body: {e}")))?;

        let Some(entry) = body.get(session_id) else {
            return Ok(SessionHealth::Gone);
        };
        let kind = entry
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AdapterError::Protocol(format!("status entry missing type: {entry}")))?;

        Ok(match kind {
            "completed" | "done" => SessionHealth::Terminal(RemoteSessionStatus::Completed),
            "failed" | "error" => SessionHealth::Terminal(RemoteSessionStatus::Failed),
            "aborted" => SessionHealth::Terminal(RemoteSessionStatus::Aborted),
            _ => SessionHealth::Running,
        })
    }

    async fn resolve_gate(
        &self,
        session_id: &str,
        gate_id: &str,
        approve: bool,
    ) -> Result<(), AdapterError> {
        let response = self
            .client
            .post(self.url(&format!("/session/{session_id}/permissions/{gate_id}")))
            .timeout(self.timeouts.send_message)
            .json(&serde_json::json!({ "response": if approve { "once" } else { "reject" } }))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(AdapterError::SessionNotFound(session_id.to_string()));
        }
        if !status.is_success() {
            return Err(AdapterError::Remote {
                status: status.as_u16(),
                message: "permission reply refused".to_string(),
            });
        }
        Ok(())
    }
}

/// Translate one raw SSE data payload into `(session_id, RemoteEvent)`.
/// Returns `None` for unrecognized frame types and malformed payloads.
fn translate_frame(raw: &str) -> Option<(String, RemoteEvent)> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let frame_type = value.get("type")?.as_str()?;
    let props = value.get("properties")?;

    match frame_type {
        "session.updated" => {
            let info = props.get("info").unwrap_or(props);
            let session_id = info.get("id").and_then(Value::as_str)?.to_string();
            let status = info.get("status").and_then(Value::as_str)?;
            let event = match status {
                "created" | "queued" => {
                    RemoteEvent::Status { status: RemoteSessionStatus::Created }
                }
                "running" | "busy" | "working" => {
                    RemoteEvent::Status { status: RemoteSessionStatus::Running }
                }
                "paused" => RemoteEvent::Status { status: RemoteSessionStatus::Paused },
                "completed" | "done" => RemoteEvent::Completed { artifacts: Vec::new() },
                "failed" | "error" => RemoteEvent::Failed {
                    reason: info
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("remote session failed")
                        .to_string(),
                },
                "aborted" => RemoteEvent::Status { status: RemoteSessionStatus::Aborted },
                _ => return None,
            };
            Some((session_id, event))
        }
        "permission.updated" => {
            let session_id = props.get("sessionID").and_then(Value::as_str)?.to_string();
            let gate_id = props.get("id").and_then(Value::as_str)?.to_string();
            let kind = match props.get("type").and_then(Value::as_str).unwrap_or("write") {
                "run" | "bash" | "command" => GateKind::Run,
                "destructive" => GateKind::Destructive,
                _ => GateKind::Write,
            };
            let description = props
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or("permission requested")
                .to_string();
            let files = props
                .get("metadata")
                .and_then(|m| m.get("files"))
                .and_then(Value::as_array)
                .map(|files| {
                    files.iter().filter_map(Value::as_str).map(str::to_string).collect()
                })
                .unwrap_or_default();
            Some((session_id, RemoteEvent::Gate { gate_id, kind, description, files }))
        }
        "artifact.created" => {
            let session_id = props.get("sessionID").and_then(Value::as_str)?.to_string();
            let kind =
                props.get("kind").and_then(Value::as_str).unwrap_or("artifact").to_string();
            let path = props.get("path").and_then(Value::as_str)?.to_string();
            Some((session_id, RemoteEvent::Artifact { kind, path }))
        }
        "session.error" => {
            let session_id = props.get("sessionID").and_then(Value::as_str)?.to_string();
            let reason = props
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("remote session error")
                .to_string();
            Some((session_id, RemoteEvent::Failed { reason }))
        }
        _ => None,
    }
}

/// Build an artifact pointer record for a path reported by the remote.
pub fn artifact_ref(kind: &str, path: &str) -> ArtifactRef {
    ArtifactRef { kind: kind.to_string(), path: path.to_string(), created_at: Utc::now() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_session_status_frames() {
        let raw = r#"{"type":"session.updated","properties":{"info":{"id":"s1","status":"running"}}}"#;
        let (session, event) = translate_frame(raw).unwrap();
        assert_eq!(session, "s1");
        assert_eq!(event, RemoteEvent::Status { status: RemoteSessionStatus::Running });
    }

    #[test]
    fn translates_completion_frame() {
        let raw = r#"{"type":"session.updated","properties":{"info":{"id":"s1","status":"completed"}}}"#;
        let (_, event) = translate_frame(raw).unwrap();
        assert!(matches!(event, RemoteEvent::Completed { .. }));
    }

    #[test]
    fn translates_permission_frame() {
        let raw = r#"{
            "type": "permission.updated",
            "properties": {
                "id": "perm-1",
                "sessionID": "s1",
                "type": "write",
                "title": "edit src/auth/mw.ts",
                "metadata": {"files": ["src/auth/mw.ts"]}
            }
        }"#;
        let (session, event) = translate_frame(raw).unwrap();
        assert_eq!(session, "s1");
        match event {
            RemoteEvent::Gate { gate_id, kind, files, .. } => {
                assert_eq!(gate_id, "perm-1");
                assert_eq!(kind, GateKind::Write);
                assert_eq!(files, vec!["src/auth/mw.ts"]);
            }
            other => panic!("expected gate, got {other:?}"),
        }
    }

    #[test]
    fn translates_error_frame() {
        let raw = r#"{"type":"session.error","properties":{"sessionID":"s1","error":"boom"}}"#;
        let (_, event) = translate_frame(raw).unwrap();
        assert_eq!(event, RemoteEvent::Failed { reason: "boom".to_string() });
    }

    #[test]
    fn unrecognized_frames_are_dropped() {
        assert!(translate_frame(r#"{"type":"message.updated","properties":{}}"#).is_none());
        assert!(translate_frame("not json").is_none());
        assert!(translate_frame(r#"{"no_type": true}"#).is_none());
    }
}
