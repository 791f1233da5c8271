//! Pure projection of domain events onto derived state.
//!
//! The same `apply` function runs on the live append path, during boot
//! replay, and inside the determinism property tests, so incremental
//! application and full replay cannot diverge.

use std::collections::HashMap;

use serde_json::Value;
use shared_types::{
    clamp_summary, next_status, ArtifactRef, BuilderDispatchedPayload, BuilderSession,
    BuilderSessionStatus, BuilderStatusChangedPayload, BuildCompletedPayload, BuildFailedPayload,
    CancelPhase, Event, EventType, GateKind, GateRequestedPayload, HandoffFrozenPayload,
    InboxItem, InboxSeverity, Priority, QuickDispatchBlockedPayload, Snapshot, Task,
    TaskCanceledPayload, TaskCreatedPayload, TaskStatus, TopicState,
    WorkingPromptUpdatedPayload,
};

/// In-memory derived state owned by the event store actor.
#[derive(Debug, Default, Clone)]
pub struct DerivedState {
    pub tasks: HashMap<String, Task>,
    /// Keyed by session id. A task owns at most one in-flight session.
    pub sessions: HashMap<String, BuilderSession>,
    pub topics: HashMap<String, TopicState>,
    pub inbox: Vec<InboxItem>,
    /// Pending gate per task while in `awaiting_gate`.
    pub pending_gates: HashMap<String, GateRequestedPayload>,
    pub last_seq: i64,
}

impl DerivedState {
    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks.get(task_id).map(|t| t.status)
    }

    /// The task's session, if it has one that is not yet terminal.
    pub fn inflight_session(&self, task_id: &str) -> Option<&BuilderSession> {
        let task = self.tasks.get(task_id)?;
        let session_id = task.builder_session_id.as_deref()?;
        let session = self.sessions.get(session_id)?;
        (!session.status.is_terminal()).then_some(session)
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.task_id.cmp(&b.task_id)));
        let mut sessions: Vec<BuilderSession> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        let mut topics: Vec<TopicState> = self.topics.values().cloned().collect();
        topics.sort_by(|a, b| a.topic_slug.cmp(&b.topic_slug));
        let mut inbox = self.inbox.clone();
        inbox.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.event_seq.cmp(&b.event_seq)));
        Snapshot { tasks, sessions, topics, inbox, last_seq: self.last_seq }
    }
}

/// Slug identifying a task's prompt topic directory.
pub fn topic_slug(task_id: &str) -> String {
    task_id.chars().take(8).collect()
}

/// Apply one event to the derived state. Infallible: events were validated
/// before persistence, so malformed payloads on replay are skipped rather
/// than refused.
pub fn apply(state: &mut DerivedState, event: &Event) {
    state.last_seq = state.last_seq.max(event.seq);

    let Some(task_id) = event.task_id.clone() else {
        // Quick-dispatch events carry no task scope and no derived state.
        return;
    };

    match event.event_type {
        EventType::TaskCreated => {
            let payload: Option<TaskCreatedPayload> =
                serde_json::from_value(event.payload.clone()).ok();
            let (title, priority, working) = match payload {
                Some(p) => (p.title, p.priority, p.working_prompt_path),
                None => ("Untitled Task".to_string(), Priority::Normal, None),
            };
            state.tasks.insert(
                task_id.clone(),
                Task {
                    task_id: task_id.clone(),
                    title,
                    status: TaskStatus::Draft,
                    priority,
                    working_prompt_path: working.clone(),
                    handoff_prompt_path: None,
                    handoff_spec_path: None,
                    external_task_id: None,
                    builder_session_id: None,
                    builder_kind: None,
                    last_event_seq: event.seq,
                    created_at: event.time,
                    updated_at: event.time,
                },
            );
            state.topics.insert(
                topic_slug(&task_id),
                TopicState {
                    topic_slug: topic_slug(&task_id),
                    working_path: working,
                    handoff_md_path: None,
                    handoff_json_path: None,
                    frozen: false,
                },
            );
        }
        EventType::WorkingPromptUpdated => {
            let path = serde_json::from_value::<WorkingPromptUpdatedPayload>(event.payload.clone())
                .ok()
                .map(|p| p.path);
            with_task(state, &task_id, event, |task| {
                if let Some(path) = path.clone() {
                    task.working_prompt_path = Some(path);
                }
            });
            if let Some(topic) = state.topics.get_mut(&topic_slug(&task_id)) {
                if let Some(path) = path {
                    topic.working_path = Some(path);
                }
            }
        }
        EventType::HandoffFrozen => {
            let payload: Option<HandoffFrozenPayload> =
                serde_json::from_value(event.payload.clone()).ok();
            with_task(state, &task_id, event, |task| {
                if let Some(p) = &payload {
                    task.handoff_prompt_path = Some(p.handoff_md_path.clone());
                    task.handoff_spec_path = Some(p.handoff_json_path.clone());
                }
            });
            if let Some(topic) = state.topics.get_mut(&topic_slug(&task_id)) {
                topic.frozen = true;
                if let Some(p) = &payload {
                    topic.handoff_md_path = Some(p.handoff_md_path.clone());
                    topic.handoff_json_path = Some(p.handoff_json_path.clone());
                }
            }
        }
        EventType::ExternalTaskLinked => {
            let external = event
                .payload
                .get("external_task_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            with_task(state, &task_id, event, |task| {
                if task.external_task_id.is_none() {
                    task.external_task_id = external.clone();
                }
            });
        }
        EventType::BuilderDispatched => {
            let payload: Option<BuilderDispatchedPayload> =
                serde_json::from_value(event.payload.clone()).ok();
            with_task(state, &task_id, event, |task| {
                if let Some(p) = &payload {
                    task.builder_session_id = Some(p.session_id.clone());
                    task.builder_kind = Some(p.builder_kind.clone());
                }
            });
            if let Some(p) = payload {
                state.sessions.insert(
                    p.session_id.clone(),
                    BuilderSession {
                        session_id: p.session_id,
                        task_id: task_id.clone(),
                        builder_kind: p.builder_kind,
                        status: BuilderSessionStatus::Created,
                        started_at: event.time,
                        ended_at: None,
                        artifacts: Vec::new(),
                        dispatch_token: p.dispatch_token,
                    },
                );
            }
        }
        EventType::BuilderStatusChanged => {
            let payload: Option<BuilderStatusChangedPayload> =
                serde_json::from_value(event.payload.clone()).ok();
            with_task(state, &task_id, event, |_| {});
            if let Some(p) = payload {
                if let Some(session) = state.sessions.get_mut(&p.session_id) {
                    session.status = p.status.to_session_status();
                    if session.status.is_terminal() {
                        session.ended_at = Some(event.time);
                    }
                }
            }
        }
        EventType::GateRequested => {
            let payload: Option<GateRequestedPayload> =
                serde_json::from_value(event.payload.clone()).ok();
            with_task(state, &task_id, event, |_| {});
            if let Some(p) = payload {
                if let Some(session) = state.sessions.get_mut(&p.session_id) {
                    session.status = BuilderSessionStatus::WaitingPermission;
                }
                state.pending_gates.insert(task_id.clone(), p);
            }
        }
        EventType::GateApproved | EventType::GateDenied => {
            with_task(state, &task_id, event, |_| {});
            state.pending_gates.remove(&task_id);
            if let Some(session) = inflight_session_mut(state, &task_id) {
                session.status = BuilderSessionStatus::Running;
            }
        }
        EventType::BuildCompleted => {
            let payload: Option<BuildCompletedPayload> =
                serde_json::from_value(event.payload.clone()).ok();
            with_task(state, &task_id, event, |_| {});
            state.pending_gates.remove(&task_id);
            if let Some(p) = payload {
                if let Some(session) = state.sessions.get_mut(&p.session_id) {
                    session.status = BuilderSessionStatus::Completed;
                    session.ended_at = Some(event.time);
                    session.artifacts = p.artifacts;
                }
            }
        }
        EventType::BuildFailed => {
            let payload: Option<BuildFailedPayload> =
                serde_json::from_value(event.payload.clone()).ok();
            with_task(state, &task_id, event, |_| {});
            state.pending_gates.remove(&task_id);
            if let Some(session_id) = payload.and_then(|p| p.session_id) {
                if let Some(session) = state.sessions.get_mut(&session_id) {
                    session.status = BuilderSessionStatus::Failed;
                    session.ended_at = Some(event.time);
                }
            }
        }
        EventType::TaskCanceled => {
            let payload: Option<TaskCanceledPayload> =
                serde_json::from_value(event.payload.clone()).ok();
            with_task(state, &task_id, event, |_| {});
            state.pending_gates.remove(&task_id);
            // The session is marked aborted once the abort resolves, whether
            // the remote confirmed or not.
            if let Some(p) = payload {
                if !matches!(p.phase, CancelPhase::Pending) {
                    if let Some(session) = inflight_session_mut(state, &task_id) {
                        session.status = BuilderSessionStatus::Aborted;
                        session.ended_at = Some(event.time);
                    }
                }
            }
        }
        EventType::QuestionsRaised | EventType::UserAnswered => {
            with_task(state, &task_id, event, |_| {});
        }
        // Quick-dispatch events are task-unscoped and return early above.
        EventType::QuickDispatchRequested
        | EventType::QuickDispatchExecuted
        | EventType::QuickDispatchBlocked => {}
    }
}

/// Update a task's status per the transition table plus bookkeeping fields,
/// then run `extra` for event-specific field updates.
fn with_task<F: FnMut(&mut Task)>(
    state: &mut DerivedState,
    task_id: &str,
    event: &Event,
    mut extra: F,
) {
    let current = state.tasks.get(task_id).map(|t| t.status);
    let new_status = next_status(current, event.event_type, &event.payload).ok().flatten();
    if let Some(task) = state.tasks.get_mut(task_id) {
        if let Some(status) = new_status {
            task.status = status;
        }
        task.last_event_seq = event.seq;
        task.updated_at = event.time;
        extra(task);
    }
}

fn inflight_session_mut<'a>(
    state: &'a mut DerivedState,
    task_id: &str,
) -> Option<&'a mut BuilderSession> {
    let session_id = state.tasks.get(task_id)?.builder_session_id.clone()?;
    state.sessions.get_mut(&session_id)
}

// ============================================================================
// Inbox derivation
// ============================================================================

/// Derive the inbox item (if any) for a freshly validated event.
///
/// Exactly the event types named in the notifier contract produce items;
/// everything else produces none.
pub fn inbox_item_for(
    event: &Event,
    tasks: &HashMap<String, Task>,
    inbox_id: String,
) -> Option<InboxItem> {
    let title = event
        .task_id
        .as_deref()
        .and_then(|id| tasks.get(id))
        .map(|t| t.title.clone())
        .unwrap_or_else(|| "task".to_string());

    let (severity, summary, detail) = match event.event_type {
        EventType::BuildCompleted => {
            let artifacts: Vec<ArtifactRef> = event
                .payload
                .get("artifacts")
                .and_then(|a| serde_json::from_value(a.clone()).ok())
                .unwrap_or_default();
            let detail = (!artifacts.is_empty()).then(|| {
                artifacts.iter().map(|a| a.path.clone()).collect::<Vec<_>>().join("\n")
            });
            (InboxSeverity::Success, format!("Task '{title}' completed"), detail)
        }
        EventType::BuildFailed => {
            let reason = event
                .payload
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("build failed")
                .to_string();
            (
                InboxSeverity::Error,
                format!("Task '{title}' failed: {reason}"),
                Some(format!("event seq {}", event.seq)),
            )
        }
        EventType::GateRequested => {
            let kind = serde_json::from_value::<GateRequestedPayload>(event.payload.clone())
                .map(|p| p.kind)
                .unwrap_or(GateKind::Write);
            let kind = match kind {
                GateKind::Write => "write",
                GateKind::Run => "run",
                GateKind::Destructive => "destructive",
            };
            let description = event
                .payload
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string);
            (
                InboxSeverity::Blocking,
                format!("Task '{title}' requests {kind} approval"),
                description,
            )
        }
        EventType::TaskCanceled => {
            let phase = event
                .payload
                .get("phase")
                .and_then(Value::as_str)
                .unwrap_or("pending");
            match phase {
                "unconfirmed" => (
                    InboxSeverity::Warning,
                    format!("Task '{title}' canceled; remote abort unconfirmed"),
                    Some(format!("event seq {}", event.seq)),
                ),
                "confirmed" => {
                    (InboxSeverity::Info, format!("Task '{title}' cancellation confirmed"), None)
                }
                _ => (InboxSeverity::Info, format!("Task '{title}' cancellation requested"), None),
            }
        }
        EventType::BuilderStatusChanged => {
            let status = event.payload.get("status").and_then(Value::as_str);
            if status != Some("lost") {
                return None;
            }
            (
                InboxSeverity::Error,
                format!("Lost contact with the builder working on '{title}'"),
                Some(format!("event seq {}", event.seq)),
            )
        }
        EventType::QuickDispatchBlocked => {
            let payload: QuickDispatchBlockedPayload =
                serde_json::from_value(event.payload.clone()).ok()?;
            (
                InboxSeverity::Warning,
                clamp_summary(&format!("Quick dispatch blocked: {}", payload.command)),
                Some(payload.reason),
            )
        }
        _ => return None,
    };

    Some(InboxItem {
        inbox_id,
        severity,
        summary: clamp_summary(&summary),
        detail,
        task_id: event.task_id.clone(),
        event_seq: event.seq,
        created_at: event.time,
        read_at: None,
    })
}

/// Deliverable-order comparison: blocking first, then creation order.
pub fn delivery_order(a: &InboxItem, b: &InboxItem) -> std::cmp::Ordering {
    let a_block = a.severity == InboxSeverity::Blocking;
    let b_block = b.severity == InboxSeverity::Blocking;
    b_block
        .cmp(&a_block)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.event_seq.cmp(&b.event_seq))
}
