//! Prompt workspace - per-topic directories and the freeze lifecycle.
//!
//! Layout under the workspace root:
//!   prompts/<topic>/working.md      mutable
//!   prompts/<topic>/handoff.md      write-once
//!   prompts/<topic>/handoff.json    write-once
//!   prompts/<topic>/artifacts/      append-only pointer targets
//!
//! Writes are serialized per topic; cross-topic writes proceed in parallel.
//! All file replacement goes through temp-file + rename so a crash never
//! leaves a half-written document, and the freeze produces both handoff
//! files or neither.

pub mod handoff;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use shared_types::ContextPointers;
use tokio::sync::Mutex;

pub use handoff::{render_handoff_md, WorkingPrompt, WorkingPromptPatch, STANDARD_CONSTRAINTS};

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("no working.md for topic {0}")]
    MissingWorking(String),
    #[error("topic {0} is frozen; working.md is immutable")]
    Frozen(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result of a freeze. `already_frozen` marks the idempotent re-request path:
/// the existing files are returned and no event should be re-emitted.
#[derive(Debug, Clone)]
pub struct FreezeOutcome {
    pub handoff_md_path: PathBuf,
    pub handoff_json_path: PathBuf,
    /// Hex sha-256 of handoff.json content.
    pub digest: String,
    pub already_frozen: bool,
}

pub struct PromptWorkspace {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PromptWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), locks: Mutex::new(HashMap::new()) }
    }

    pub fn topic_dir(&self, topic: &str) -> PathBuf {
        self.root.join(topic)
    }

    pub fn working_path(&self, topic: &str) -> PathBuf {
        self.topic_dir(topic).join("working.md")
    }

    pub fn handoff_md_path(&self, topic: &str) -> PathBuf {
        self.topic_dir(topic).join("handoff.md")
    }

    pub fn handoff_json_path(&self, topic: &str) -> PathBuf {
        self.topic_dir(topic).join("handoff.json")
    }

    /// Deterministic artifact naming: `<timestamp>-<slug>.<ext>`.
    pub fn artifact_path(&self, topic: &str, kind: &str, slug: &str) -> PathBuf {
        let ext = match kind {
            "diff" | "diff_summary" => "md",
            "test_output" | "log" => "txt",
            "spec" => "json",
            _ => "md",
        };
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
        self.topic_dir(topic).join("artifacts").join(format!("{stamp}-{slug}.{ext}"))
    }

    async fn topic_lock(&self, topic: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(topic.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Create working.md for a new topic if it does not exist yet.
    pub async fn init_working(&self, topic: &str, title: &str) -> Result<PathBuf, PromptError> {
        let lock = self.topic_lock(topic).await;
        let _guard = lock.lock().await;

        let path = self.working_path(topic);
        if !path.exists() {
            let prompt = WorkingPrompt::new(title);
            write_atomic(&path, prompt.to_markdown().as_bytes()).await?;
        }
        Ok(path)
    }

    /// Apply a patch to working.md, rewriting it atomically.
    /// Refused once the topic is frozen.
    pub async fn update_working(
        &self,
        topic: &str,
        patch: WorkingPromptPatch,
    ) -> Result<(PathBuf, WorkingPrompt), PromptError> {
        let lock = self.topic_lock(topic).await;
        let _guard = lock.lock().await;

        if self.is_frozen(topic) {
            return Err(PromptError::Frozen(topic.to_string()));
        }

        let path = self.working_path(topic);
        let mut prompt = if path.exists() {
            let raw = read_to_string(&path).await?;
            WorkingPrompt::from_markdown(&raw)
        } else {
            WorkingPrompt::default()
        };
        prompt.apply(patch);

        write_atomic(&path, prompt.to_markdown().as_bytes()).await?;
        Ok((path, prompt))
    }

    pub async fn read_working(&self, topic: &str) -> Result<WorkingPrompt, PromptError> {
        let path = self.working_path(topic);
        if !path.exists() {
            return Err(PromptError::MissingWorking(topic.to_string()));
        }
        let raw = read_to_string(&path).await?;
        Ok(WorkingPrompt::from_markdown(&raw))
    }

    /// Whether both handoff files exist for the topic.
    pub fn is_frozen(&self, topic: &str) -> bool {
        self.handoff_md_path(topic).exists() && self.handoff_json_path(topic).exists()
    }

    /// Freeze working.md into the immutable handoff pair.
    ///
    /// Atomic across both files: temps are written first, then renamed in
    /// sequence; if the second rename fails the first is removed. Idempotent:
    /// a topic with both files already present returns them unchanged.
    pub async fn freeze(
        &self,
        topic: &str,
        context_pointers: ContextPointers,
    ) -> Result<FreezeOutcome, PromptError> {
        let lock = self.topic_lock(topic).await;
        let _guard = lock.lock().await;

        let md_path = self.handoff_md_path(topic);
        let json_path = self.handoff_json_path(topic);

        if md_path.exists() && json_path.exists() {
            let digest = sha256_file(&json_path).await?;
            return Ok(FreezeOutcome {
                handoff_md_path: md_path,
                handoff_json_path: json_path,
                digest,
                already_frozen: true,
            });
        }

        // A crash between the two renames can leave a single orphan; remove
        // it so the either-both-or-neither invariant holds before retrying.
        for orphan in [&md_path, &json_path] {
            if orphan.exists() {
                tokio::fs::remove_file(orphan).await.map_err(|source| PromptError::Io {
                    path: orphan.clone(),
                    source,
                })?;
            }
        }

        let working_path = self.working_path(topic);
        if !working_path.exists() {
            return Err(PromptError::MissingWorking(topic.to_string()));
        }
        let prompt = WorkingPrompt::from_markdown(&read_to_string(&working_path).await?);

        let json_rel = format!("prompts/{topic}/handoff.json");
        let md_content = render_handoff_md(&prompt, &json_rel);
        let spec = prompt.to_execution_spec(context_pointers);
        let json_content = spec.to_json();

        let md_tmp = temp_sibling(&md_path);
        let json_tmp = temp_sibling(&json_path);
        write_file(&md_tmp, md_content.as_bytes()).await?;
        write_file(&json_tmp, json_content.as_bytes()).await?;

        rename(&md_tmp, &md_path).await?;
        if let Err(e) = rename(&json_tmp, &json_path).await {
            let _ = tokio::fs::remove_file(&md_path).await;
            let _ = tokio::fs::remove_file(&json_tmp).await;
            return Err(e);
        }

        let digest = hex_digest(json_content.as_bytes());
        tracing::info!(topic, digest = %digest, "Froze working prompt into handoff pair");

        Ok(FreezeOutcome {
            handoff_md_path: md_path,
            handoff_json_path: json_path,
            digest,
            already_frozen: false,
        })
    }

    /// Digest of the frozen contract, used for the dispatch token.
    pub async fn handoff_digest(&self, topic: &str) -> Result<String, PromptError> {
        sha256_file(&self.handoff_json_path(topic)).await
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp-{}", ulid::Ulid::new()))
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

async fn sha256_file(path: &Path) -> Result<String, PromptError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| PromptError::Io { path: path.to_path_buf(), source })?;
    Ok(hex_digest(&bytes))
}

async fn read_to_string(path: &Path) -> Result<String, PromptError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| PromptError::Io { path: path.to_path_buf(), source })
}

async fn write_file(path: &Path, content: &[u8]) -> Result<(), PromptError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| PromptError::Io { path: parent.to_path_buf(), source })?;
    }
    tokio::fs::write(path, content)
        .await
        .map_err(|source| PromptError::Io { path: path.to_path_buf(), source })
}

async fn rename(from: &Path, to: &Path) -> Result<(), PromptError> {
    tokio::fs::rename(from, to)
        .await
        .map_err(|source| PromptError::Io { path: to.to_path_buf(), source })
}

/// Overwrite a file atomically via temp + rename.
async fn write_atomic(path: &Path, content: &[u8]) -> Result<(), PromptError> {
    let tmp = temp_sibling(path);
    write_file(&tmp, content).await?;
    rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, PromptWorkspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = PromptWorkspace::new(dir.path().join("prompts"));
        (dir, ws)
    }

    #[tokio::test]
    async fn update_creates_and_mutates_working_md() {
        let (_dir, ws) = workspace();

        let (path, prompt) = ws
            .update_working(
                "abc12345",
                WorkingPromptPatch {
                    title: Some("JWT refresh fix".to_string()),
                    intent: Some("fails after 15m idle".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(path.exists());
        assert_eq!(prompt.title, "JWT refresh fix");

        let reread = ws.read_working("abc12345").await.unwrap();
        assert_eq!(reread.intent, "fails after 15m idle");
    }

    #[tokio::test]
    async fn freeze_produces_both_files_and_is_idempotent() {
        let (_dir, ws) = workspace();

        ws.update_working(
            "abc12345",
            WorkingPromptPatch {
                title: Some("x".to_string()),
                intent: Some("goal".to_string()),
                requirements: Some(vec!["done".to_string()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let first = ws.freeze("abc12345", ContextPointers::default()).await.unwrap();
        assert!(!first.already_frozen);
        assert!(first.handoff_md_path.exists());
        assert!(first.handoff_json_path.exists());

        let second = ws.freeze("abc12345", ContextPointers::default()).await.unwrap();
        assert!(second.already_frozen);
        assert_eq!(second.handoff_md_path, first.handoff_md_path);
        assert_eq!(second.digest, first.digest);
    }

    #[tokio::test]
    async fn update_refused_after_freeze() {
        let (_dir, ws) = workspace();
        ws.update_working(
            "abc12345",
            WorkingPromptPatch { intent: Some("goal".to_string()), ..Default::default() },
        )
        .await
        .unwrap();
        ws.freeze("abc12345", ContextPointers::default()).await.unwrap();

        let err = ws
            .update_working(
                "abc12345",
                WorkingPromptPatch { intent: Some("late".to_string()), ..Default::default() },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PromptError::Frozen(_)));
    }

    #[tokio::test]
    async fn freeze_without_working_md_fails() {
        let (_dir, ws) = workspace();
        let err = ws.freeze("nothere1", ContextPointers::default()).await.unwrap_err();
        assert!(matches!(err, PromptError::MissingWorking(_)));
    }

    #[tokio::test]
    async fn freeze_repairs_a_lone_orphan_file() {
        let (_dir, ws) = workspace();

        ws.update_working(
            "abc12345",
            WorkingPromptPatch { intent: Some("goal".to_string()), ..Default::default() },
        )
        .await
        .unwrap();

        // Simulate a crash that landed handoff.md but not handoff.json.
        write_file(&ws.handoff_md_path("abc12345"), b"<task>stale</task>").await.unwrap();

        let outcome = ws.freeze("abc12345", ContextPointers::default()).await.unwrap();
        assert!(!outcome.already_frozen);
        let md = tokio::fs::read_to_string(&outcome.handoff_md_path).await.unwrap();
        assert!(!md.contains("stale"));
        assert!(outcome.handoff_json_path.exists());
    }

    #[tokio::test]
    async fn frozen_spec_parses_and_digest_is_stable() {
        let (_dir, ws) = workspace();
        ws.update_working(
            "abc12345",
            WorkingPromptPatch { intent: Some("goal".to_string()), ..Default::default() },
        )
        .await
        .unwrap();

        let outcome = ws.freeze("abc12345", ContextPointers::default()).await.unwrap();
        let raw = tokio::fs::read_to_string(&outcome.handoff_json_path).await.unwrap();
        let spec = shared_types::ExecutionSpec::from_json(&raw).unwrap();
        assert_eq!(spec.goal, "goal");
        assert_eq!(spec.version, shared_types::EXECUTION_SPEC_VERSION);

        assert_eq!(ws.handoff_digest("abc12345").await.unwrap(), outcome.digest);
    }

    #[tokio::test]
    async fn working_updates_on_different_topics_run_in_parallel() {
        let (_dir, ws) = workspace();
        let ws = std::sync::Arc::new(ws);

        let mut handles = Vec::new();
        for i in 0..4 {
            let ws = ws.clone();
            handles.push(tokio::spawn(async move {
                ws.update_working(
                    &format!("topic{i:03}"),
                    WorkingPromptPatch { intent: Some(format!("goal {i}")), ..Default::default() },
                )
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for i in 0..4 {
            let prompt = ws.read_working(&format!("topic{i:03}")).await.unwrap();
            assert_eq!(prompt.intent, format!("goal {i}"));
        }
    }
}
