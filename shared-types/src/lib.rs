//! Shared types for the Conversator control plane
//!
//! These types are used by both:
//! - The core service (actors, adapters, fan-out API)
//! - External consumers (dashboard, voice layer) over WebSocket/HTTP
//!
//! Everything here is serde-serializable; the on-disk event format and the
//! handoff execution contract are defined in this crate so that readers
//! outside the core agree on the same wire shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Task
// ============================================================================

/// Task lifecycle status. Closed set; terminal states admit no transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Draft,
    Refining,
    ReadyToHandoff,
    HandedOff,
    Running,
    AwaitingGate,
    AwaitingUser,
    Done,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Draft => "draft",
            TaskStatus::Refining => "refining",
            TaskStatus::ReadyToHandoff => "ready_to_handoff",
            TaskStatus::HandedOff => "handed_off",
            TaskStatus::Running => "running",
            TaskStatus::AwaitingGate => "awaiting_gate",
            TaskStatus::AwaitingUser => "awaiting_user",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(TaskStatus::Draft),
            "refining" => Ok(TaskStatus::Refining),
            "ready_to_handoff" => Ok(TaskStatus::ReadyToHandoff),
            "handed_off" => Ok(TaskStatus::HandedOff),
            "running" => Ok(TaskStatus::Running),
            "awaiting_gate" => Ok(TaskStatus::AwaitingGate),
            "awaiting_user" => Ok(TaskStatus::AwaitingUser),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            "canceled" => Ok(TaskStatus::Canceled),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Task priority. Ordered: later variants outrank earlier ones.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// A unit of work tracked by the control plane. Mutated only via events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub working_prompt_path: Option<String>,
    pub handoff_prompt_path: Option<String>,
    pub handoff_spec_path: Option<String>,
    /// Pointer into the external task graph. Once set, never reassigned.
    pub external_task_id: Option<String>,
    pub builder_session_id: Option<String>,
    pub builder_kind: Option<String>,
    pub last_event_seq: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Builder sessions
// ============================================================================

/// Local view of a remote builder session's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuilderSessionStatus {
    Created,
    Running,
    Paused,
    WaitingPermission,
    Completed,
    Failed,
    Aborted,
}

impl BuilderSessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuilderSessionStatus::Completed
                | BuilderSessionStatus::Failed
                | BuilderSessionStatus::Aborted
        )
    }
}

/// Status values observed on the remote stream. A superset of
/// [`BuilderSessionStatus`]: `lost` marks a session the adapter can no longer
/// reach; it is mapped to `failed` on the local session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteSessionStatus {
    Created,
    Running,
    Paused,
    WaitingPermission,
    Completed,
    Failed,
    Aborted,
    Lost,
}

impl RemoteSessionStatus {
    pub fn to_session_status(self) -> BuilderSessionStatus {
        match self {
            RemoteSessionStatus::Created => BuilderSessionStatus::Created,
            RemoteSessionStatus::Running => BuilderSessionStatus::Running,
            RemoteSessionStatus::Paused => BuilderSessionStatus::Paused,
            RemoteSessionStatus::WaitingPermission => BuilderSessionStatus::WaitingPermission,
            RemoteSessionStatus::Completed => BuilderSessionStatus::Completed,
            RemoteSessionStatus::Failed | RemoteSessionStatus::Lost => BuilderSessionStatus::Failed,
            RemoteSessionStatus::Aborted => BuilderSessionStatus::Aborted,
        }
    }
}

/// Pointer record for an artifact produced by a builder run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub kind: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
}

/// A single in-flight interaction with one builder for one task.
/// Owned by exactly one task for its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderSession {
    /// Assigned by the remote builder, recorded locally.
    pub session_id: String,
    pub task_id: String,
    pub builder_kind: String,
    pub status: BuilderSessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub artifacts: Vec<ArtifactRef>,
    /// Idempotency token recorded at dispatch; repeat dispatches with the
    /// same token return this session instead of creating a new one.
    pub dispatch_token: String,
}

// ============================================================================
// Gates
// ============================================================================

/// Authorization checkpoint kinds requiring user approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Write,
    Run,
    Destructive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Approve,
    Deny,
}

// ============================================================================
// Events
// ============================================================================

/// Domain event types. Closed set; the strings are part of the on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    TaskCreated,
    WorkingPromptUpdated,
    QuestionsRaised,
    UserAnswered,
    HandoffFrozen,
    ExternalTaskLinked,
    BuilderDispatched,
    BuilderStatusChanged,
    GateRequested,
    GateApproved,
    GateDenied,
    BuildCompleted,
    BuildFailed,
    TaskCanceled,
    QuickDispatchRequested,
    QuickDispatchExecuted,
    QuickDispatchBlocked,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TaskCreated => "TaskCreated",
            EventType::WorkingPromptUpdated => "WorkingPromptUpdated",
            EventType::QuestionsRaised => "QuestionsRaised",
            EventType::UserAnswered => "UserAnswered",
            EventType::HandoffFrozen => "HandoffFrozen",
            EventType::ExternalTaskLinked => "ExternalTaskLinked",
            EventType::BuilderDispatched => "BuilderDispatched",
            EventType::BuilderStatusChanged => "BuilderStatusChanged",
            EventType::GateRequested => "GateRequested",
            EventType::GateApproved => "GateApproved",
            EventType::GateDenied => "GateDenied",
            EventType::BuildCompleted => "BuildCompleted",
            EventType::BuildFailed => "BuildFailed",
            EventType::TaskCanceled => "TaskCanceled",
            EventType::QuickDispatchRequested => "QuickDispatchRequested",
            EventType::QuickDispatchExecuted => "QuickDispatchExecuted",
            EventType::QuickDispatchBlocked => "QuickDispatchBlocked",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TaskCreated" => Ok(EventType::TaskCreated),
            "WorkingPromptUpdated" => Ok(EventType::WorkingPromptUpdated),
            "QuestionsRaised" => Ok(EventType::QuestionsRaised),
            "UserAnswered" => Ok(EventType::UserAnswered),
            "HandoffFrozen" => Ok(EventType::HandoffFrozen),
            "ExternalTaskLinked" => Ok(EventType::ExternalTaskLinked),
            "BuilderDispatched" => Ok(EventType::BuilderDispatched),
            "BuilderStatusChanged" => Ok(EventType::BuilderStatusChanged),
            "GateRequested" => Ok(EventType::GateRequested),
            "GateApproved" => Ok(EventType::GateApproved),
            "GateDenied" => Ok(EventType::GateDenied),
            "BuildCompleted" => Ok(EventType::BuildCompleted),
            "BuildFailed" => Ok(EventType::BuildFailed),
            "TaskCanceled" => Ok(EventType::TaskCanceled),
            "QuickDispatchRequested" => Ok(EventType::QuickDispatchRequested),
            "QuickDispatchExecuted" => Ok(EventType::QuickDispatchExecuted),
            "QuickDispatchBlocked" => Ok(EventType::QuickDispatchBlocked),
            other => Err(format!("unknown event type '{other}'")),
        }
    }
}

/// Optional pointers carried alongside an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventRefs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
}

impl EventRefs {
    pub fn is_empty(&self) -> bool {
        self.external_task_id.is_none() && self.session_id.is_none() && self.artifact_path.is_none()
    }
}

/// A persisted domain event. Append-only; never rewritten; never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Global sequence number, gap-free within a process epoch.
    pub seq: i64,
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refs: Option<EventRefs>,
    pub payload: serde_json::Value,
}

// ============================================================================
// Event payloads
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreatedPayload {
    pub title: String,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_prompt_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingPromptUpdatedPayload {
    pub path: String,
    /// Short delta summary supplied by the caller, never the full file.
    pub delta_summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionsRaisedPayload {
    pub questions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAnsweredPayload {
    pub answers: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffFrozenPayload {
    pub handoff_md_path: String,
    pub handoff_json_path: String,
    /// Hex sha-256 of handoff.json; feeds the dispatch token.
    pub digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalTaskLinkedPayload {
    pub external_task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderDispatchedPayload {
    pub session_id: String,
    pub builder_kind: String,
    pub dispatch_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderStatusChangedPayload {
    pub session_id: String,
    pub status: RemoteSessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRequestedPayload {
    pub session_id: String,
    /// Remote identifier for the pending permission, echoed on resolution.
    pub gate_id: String,
    pub kind: GateKind,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResolvedPayload {
    pub gate_id: String,
    pub decision: GateDecision,
    /// True when the resolution was synthesized (cancel auto-denies).
    #[serde(default)]
    pub auto: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildCompletedPayload {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildFailedPayload {
    pub session_id: Option<String>,
    pub reason: String,
}

/// Cooperative cancellation phases. `Pending` is appended immediately; one of
/// the other two follows once the remote abort resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPhase {
    Pending,
    Confirmed,
    Unconfirmed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCanceledPayload {
    pub reason: String,
    pub phase: CancelPhase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickDispatchRequestedPayload {
    pub operation: String,
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickDispatchExecutedPayload {
    pub operation: String,
    pub command: String,
    pub success: bool,
    /// Which executor ran the command ("local" for the voice layer).
    pub via: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickDispatchBlockedPayload {
    pub operation: String,
    pub command: String,
    pub reason: String,
}

// ============================================================================
// Inbox
// ============================================================================

/// Severity of a user-visible notification. Ordering matters for delivery:
/// `Blocking` sorts ahead of everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxSeverity {
    Info,
    Success,
    Warning,
    Error,
    Blocking,
}

/// A notification in the user's inbox. Created in response to specific event
/// types; acknowledged by user action; never otherwise mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxItem {
    pub inbox_id: String,
    pub severity: InboxSeverity,
    /// At most 140 characters.
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// The persisted event this item was derived from.
    pub event_seq: i64,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

pub const INBOX_SUMMARY_MAX: usize = 140;

/// Truncate a summary to the inbox limit on a char boundary.
pub fn clamp_summary(summary: &str) -> String {
    if summary.chars().count() <= INBOX_SUMMARY_MAX {
        return summary.to_string();
    }
    let truncated: String = summary.chars().take(INBOX_SUMMARY_MAX - 1).collect();
    format!("{truncated}…")
}

// ============================================================================
// Topics & snapshot
// ============================================================================

/// Derived view of one prompt topic directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicState {
    pub topic_slug: String,
    pub working_path: Option<String>,
    pub handoff_md_path: Option<String>,
    pub handoff_json_path: Option<String>,
    pub frozen: bool,
}

/// Consistent point-in-time view of derived state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub tasks: Vec<Task>,
    pub sessions: Vec<BuilderSession>,
    pub topics: Vec<TopicState>,
    pub inbox: Vec<InboxItem>,
    pub last_seq: i64,
}

// ============================================================================
// Transition table
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("invalid transition: {from:?} + {event} is not permitted")]
    Invalid { from: Option<TaskStatus>, event: EventType },
    #[error("task is in terminal state {status}")]
    Terminal { status: TaskStatus },
}

/// Compute the task status implied by applying `event` to a task currently in
/// `current` status (`None` = the task does not exist yet).
///
/// Returns `Ok(Some(status))` for a status change, `Ok(None)` for events that
/// are valid but do not move the task, and an error for transitions the event
/// log must reject before persistence.
pub fn next_status(
    current: Option<TaskStatus>,
    event: EventType,
    payload: &serde_json::Value,
) -> Result<Option<TaskStatus>, TransitionError> {
    use EventType::*;
    use TaskStatus::*;

    let invalid = || TransitionError::Invalid { from: current, event };

    let Some(status) = current else {
        return match event {
            TaskCreated => Ok(Some(Draft)),
            _ => Err(invalid()),
        };
    };

    if status.is_terminal() {
        // A confirm/unconfirm cancel event is observed after the pending
        // cancel already moved the task to canceled; it is a status no-op.
        if status == Canceled && event == TaskCanceled {
            let phase = payload.get("phase").and_then(|p| p.as_str());
            if matches!(phase, Some("confirmed") | Some("unconfirmed")) {
                return Ok(None);
            }
        }
        return Err(TransitionError::Terminal { status });
    }

    match event {
        TaskCreated => Err(invalid()),
        WorkingPromptUpdated => match status {
            Draft | Refining => Ok(Some(Refining)),
            _ => Err(invalid()),
        },
        QuestionsRaised => match status {
            Refining => Ok(Some(AwaitingUser)),
            _ => Err(invalid()),
        },
        UserAnswered => match status {
            AwaitingUser => Ok(Some(Refining)),
            _ => Err(invalid()),
        },
        HandoffFrozen => match status {
            Refining => Ok(Some(ReadyToHandoff)),
            _ => Err(invalid()),
        },
        ExternalTaskLinked => Ok(None),
        BuilderDispatched => match status {
            ReadyToHandoff => Ok(Some(HandedOff)),
            _ => Err(invalid()),
        },
        BuilderStatusChanged => {
            let remote = payload.get("status").and_then(|s| s.as_str());
            match remote {
                Some("running") => match status {
                    HandedOff | Running => Ok(Some(Running)),
                    // A gate can resolve while the stream reports running.
                    AwaitingGate => Ok(None),
                    _ => Err(invalid()),
                },
                Some("lost") => Ok(Some(Failed)),
                // Pauses and other intermediate statuses update the session
                // record without moving the task.
                _ => Ok(None),
            }
        }
        GateRequested => match status {
            Running => Ok(Some(AwaitingGate)),
            _ => Err(invalid()),
        },
        GateApproved | GateDenied => match status {
            AwaitingGate => Ok(Some(Running)),
            _ => Err(invalid()),
        },
        BuildCompleted => match status {
            Running | AwaitingGate => Ok(Some(Done)),
            _ => Err(invalid()),
        },
        BuildFailed => Ok(Some(Failed)),
        TaskCanceled => Ok(Some(Canceled)),
        QuickDispatchRequested | QuickDispatchExecuted | QuickDispatchBlocked => Err(invalid()),
    }
}

// ============================================================================
// Handoff execution contract (handoff.json)
// ============================================================================

/// Current major version of the handoff JSON schema. Readers must reject
/// documents with a higher major version.
pub const EXECUTION_SPEC_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoTarget {
    pub path: String,
    pub intent: String,
}

/// Gate flags recorded in the execution contract. Authoritative: the adapter
/// and the upstream builder honor them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateFlags {
    pub write: bool,
    pub run: bool,
    pub destructive: bool,
}

impl Default for GateFlags {
    fn default() -> Self {
        Self { write: true, run: true, destructive: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextPointers {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_task_id: Option<String>,
    #[serde(default)]
    pub artifact_paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Budgets {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_s: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpecError {
    #[error("unsupported handoff spec version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("malformed handoff spec: {0}")]
    Malformed(String),
}

/// The immutable execution contract written to `handoff.json` at freeze time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSpec {
    pub version: u32,
    pub goal: String,
    pub definition_of_done: Vec<String>,
    pub constraints: Vec<String>,
    #[serde(default)]
    pub repo_targets: Vec<RepoTarget>,
    #[serde(default)]
    pub expected_artifacts: Vec<String>,
    #[serde(default)]
    pub gates: GateFlags,
    #[serde(default)]
    pub context_pointers: ContextPointers,
    #[serde(default)]
    pub budgets: Budgets,
}

impl ExecutionSpec {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            version: EXECUTION_SPEC_VERSION,
            goal: goal.into(),
            definition_of_done: Vec::new(),
            constraints: Vec::new(),
            repo_targets: Vec::new(),
            expected_artifacts: vec!["diff summary".to_string(), "test output".to_string()],
            gates: GateFlags::default(),
            context_pointers: ContextPointers::default(),
            budgets: Budgets::default(),
        }
    }

    /// Parse a handoff.json document, rejecting unknown major versions.
    pub fn from_json(raw: &str) -> Result<Self, SpecError> {
        let probe: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| SpecError::Malformed(e.to_string()))?;
        let found = probe
            .get("version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| SpecError::Malformed("missing version".to_string()))?
            as u32;
        if found > EXECUTION_SPEC_VERSION {
            return Err(SpecError::UnsupportedVersion {
                found,
                supported: EXECUTION_SPEC_VERSION,
            });
        }
        serde_json::from_value(probe).map_err(|e| SpecError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn happy_path_transitions() {
        let none = json!({});
        assert_eq!(
            next_status(None, EventType::TaskCreated, &none).unwrap(),
            Some(TaskStatus::Draft)
        );
        assert_eq!(
            next_status(Some(TaskStatus::Draft), EventType::WorkingPromptUpdated, &none).unwrap(),
            Some(TaskStatus::Refining)
        );
        assert_eq!(
            next_status(Some(TaskStatus::Refining), EventType::QuestionsRaised, &none).unwrap(),
            Some(TaskStatus::AwaitingUser)
        );
        assert_eq!(
            next_status(Some(TaskStatus::AwaitingUser), EventType::UserAnswered, &none).unwrap(),
            Some(TaskStatus::Refining)
        );
        assert_eq!(
            next_status(Some(TaskStatus::Refining), EventType::HandoffFrozen, &none).unwrap(),
            Some(TaskStatus::ReadyToHandoff)
        );
        assert_eq!(
            next_status(Some(TaskStatus::ReadyToHandoff), EventType::BuilderDispatched, &none)
                .unwrap(),
            Some(TaskStatus::HandedOff)
        );
    }

    #[test]
    fn terminal_states_reject_everything() {
        let none = json!({});
        for status in [TaskStatus::Done, TaskStatus::Failed, TaskStatus::Canceled] {
            let err = next_status(Some(status), EventType::BuildCompleted, &none).unwrap_err();
            assert!(matches!(err, TransitionError::Terminal { .. }));
        }
    }

    #[test]
    fn cancel_confirm_is_noop_on_canceled_task() {
        let confirm = json!({"reason": "user", "phase": "confirmed"});
        assert_eq!(
            next_status(Some(TaskStatus::Canceled), EventType::TaskCanceled, &confirm).unwrap(),
            None
        );
        // A fresh pending cancel against an already-canceled task is invalid.
        let pending = json!({"reason": "user", "phase": "pending"});
        assert!(next_status(Some(TaskStatus::Canceled), EventType::TaskCanceled, &pending).is_err());
    }

    #[test]
    fn builder_status_running_and_lost() {
        let running = json!({"session_id": "s", "status": "running"});
        assert_eq!(
            next_status(Some(TaskStatus::HandedOff), EventType::BuilderStatusChanged, &running)
                .unwrap(),
            Some(TaskStatus::Running)
        );
        let lost = json!({"session_id": "s", "status": "lost"});
        assert_eq!(
            next_status(Some(TaskStatus::Running), EventType::BuilderStatusChanged, &lost).unwrap(),
            Some(TaskStatus::Failed)
        );
    }

    #[test]
    fn gate_flow() {
        let none = json!({});
        assert_eq!(
            next_status(Some(TaskStatus::Running), EventType::GateRequested, &none).unwrap(),
            Some(TaskStatus::AwaitingGate)
        );
        assert_eq!(
            next_status(Some(TaskStatus::AwaitingGate), EventType::GateApproved, &none).unwrap(),
            Some(TaskStatus::Running)
        );
        assert_eq!(
            next_status(Some(TaskStatus::AwaitingGate), EventType::BuildCompleted, &none).unwrap(),
            Some(TaskStatus::Done)
        );
    }

    #[test]
    fn dispatch_requires_ready_to_handoff() {
        let none = json!({});
        assert!(next_status(Some(TaskStatus::Draft), EventType::BuilderDispatched, &none).is_err());
        assert!(
            next_status(Some(TaskStatus::Running), EventType::BuilderDispatched, &none).is_err()
        );
    }

    #[test]
    fn event_type_round_trips_via_str() {
        let all = [
            EventType::TaskCreated,
            EventType::WorkingPromptUpdated,
            EventType::QuestionsRaised,
            EventType::UserAnswered,
            EventType::HandoffFrozen,
            EventType::ExternalTaskLinked,
            EventType::BuilderDispatched,
            EventType::BuilderStatusChanged,
            EventType::GateRequested,
            EventType::GateApproved,
            EventType::GateDenied,
            EventType::BuildCompleted,
            EventType::BuildFailed,
            EventType::TaskCanceled,
            EventType::QuickDispatchRequested,
            EventType::QuickDispatchExecuted,
            EventType::QuickDispatchBlocked,
        ];
        for ty in all {
            assert_eq!(ty.as_str().parse::<EventType>().unwrap(), ty);
        }
    }

    #[test]
    fn spec_rejects_future_major_version() {
        let raw = r#"{"version": 2, "goal": "x", "definition_of_done": [], "constraints": []}"#;
        let err = ExecutionSpec::from_json(raw).unwrap_err();
        assert!(matches!(err, SpecError::UnsupportedVersion { found: 2, .. }));
    }

    #[test]
    fn spec_round_trips() {
        let mut spec = ExecutionSpec::new("fix the refresh flow");
        spec.definition_of_done.push("tokens refresh after idle".to_string());
        spec.repo_targets.push(RepoTarget {
            path: "src/auth/mw.ts".to_string(),
            intent: "modify".to_string(),
        });
        let parsed = ExecutionSpec::from_json(&spec.to_json()).unwrap();
        assert_eq!(parsed, spec);
    }

    #[test]
    fn summary_clamped_to_limit() {
        let long = "x".repeat(300);
        let clamped = clamp_summary(&long);
        assert!(clamped.chars().count() <= INBOX_SUMMARY_MAX);
        assert_eq!(clamp_summary("short"), "short");
    }

    #[test]
    fn blocking_severity_sorts_highest() {
        assert!(InboxSeverity::Blocking > InboxSeverity::Error);
        assert!(InboxSeverity::Error > InboxSeverity::Warning);
        assert!(InboxSeverity::Warning > InboxSeverity::Success);
        assert!(InboxSeverity::Success > InboxSeverity::Info);
    }
}
