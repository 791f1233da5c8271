//! Shared test harness: an in-process core wired to a scriptable mock
//! builder, plus polling helpers for the async assertions.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ractor::{Actor, ActorRef};
use tokio::sync::{mpsc, Mutex};

use conversator::actors::{
    AppendOutcome, CommandError, DispatchOutcome, EventStoreActor, EventStoreArguments,
    EventStoreMsg, HandoffPaths, NotifierActor, NotifierArguments, NotifierMsg,
    OrchestratorActor, OrchestratorArguments, OrchestratorMsg,
};
use conversator::builders::{
    AdapterError, BuilderAdapter, BuilderRegistry, RemoteEvent, RemoteEventRx, SessionHealth,
};
use conversator::config::TimeoutPolicy;
use conversator::prompts::{PromptWorkspace, WorkingPromptPatch};
use shared_types::{GateDecision, Priority, Task, TaskStatus};

// ============================================================================
// Mock builder
// ============================================================================

#[derive(Default)]
struct MockInner {
    next_session: u32,
    sessions: Vec<String>,
    messages: HashMap<String, Vec<String>>,
    abort_calls: HashMap<String, u32>,
    gate_replies: Vec<(String, String, bool)>,
    streams: HashMap<String, Vec<mpsc::Sender<Result<RemoteEvent, AdapterError>>>>,
    health: HashMap<String, SessionHealth>,
    /// When false, abort succeeds but the remote never confirms with an
    /// aborted frame or stream close.
    confirm_aborts: bool,
}

pub struct MockBuilder {
    name: String,
    max_sessions: std::sync::atomic::AtomicUsize,
    inner: Mutex<MockInner>,
}

impl MockBuilder {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            max_sessions: std::sync::atomic::AtomicUsize::new(8),
            inner: Mutex::new(MockInner { confirm_aborts: true, ..Default::default() }),
        })
    }

    pub async fn set_confirm_aborts(&self, confirm: bool) {
        self.inner.lock().await.confirm_aborts = confirm;
    }

    pub fn set_max_sessions(&self, limit: usize) {
        self.max_sessions.store(limit, std::sync::atomic::Ordering::SeqCst);
    }

    pub async fn set_health(&self, session_id: &str, health: SessionHealth) {
        self.inner.lock().await.health.insert(session_id.to_string(), health);
    }

    pub async fn register_session(&self, session_id: &str) {
        self.inner.lock().await.sessions.push(session_id.to_string());
    }

    pub async fn sessions(&self) -> Vec<String> {
        self.inner.lock().await.sessions.clone()
    }

    pub async fn messages(&self, session_id: &str) -> Vec<String> {
        self.inner.lock().await.messages.get(session_id).cloned().unwrap_or_default()
    }

    pub async fn abort_calls(&self, session_id: &str) -> u32 {
        self.inner.lock().await.abort_calls.get(session_id).copied().unwrap_or(0)
    }

    pub async fn gate_replies(&self) -> Vec<(String, String, bool)> {
        self.inner.lock().await.gate_replies.clone()
    }

    /// Push one frame to every open stream for the session.
    pub async fn emit(&self, session_id: &str, event: RemoteEvent) {
        let senders = {
            let inner = self.inner.lock().await;
            inner.streams.get(session_id).cloned().unwrap_or_default()
        };
        for tx in senders {
            let _ = tx.send(Ok(event.clone())).await;
        }
    }

    /// Close every open stream for the session (drops the senders).
    pub async fn close_streams(&self, session_id: &str) {
        self.inner.lock().await.streams.remove(session_id);
    }

    pub async fn has_open_stream(&self, session_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .streams
            .get(session_id)
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }
}

#[async_trait]
impl BuilderAdapter for MockBuilder {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "mock"
    }

    fn endpoint(&self) -> &str {
        "mock://builder"
    }

    fn max_sessions(&self) -> usize {
        self.max_sessions.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn ping(&self) -> bool {
        true
    }

    async fn create_session(&self, _task_id: &str) -> Result<String, AdapterError> {
        let mut inner = self.inner.lock().await;
        inner.next_session += 1;
        let session_id = format!("mock-session-{}", inner.next_session);
        inner.sessions.push(session_id.clone());
        Ok(session_id)
    }

    async fn send_message(&self, session_id: &str, text: &str) -> Result<(), AdapterError> {
        self.inner
            .lock()
            .await
            .messages
            .entry(session_id.to_string())
            .or_default()
            .push(text.to_string());
        Ok(())
    }

    async fn stream_events(&self, session_id: &str) -> Result<RemoteEventRx, AdapterError> {
        let (tx, rx) = mpsc::channel(64);
        self.inner
            .lock()
            .await
            .streams
            .entry(session_id.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn abort(&self, session_id: &str) -> Result<(), AdapterError> {
        let (senders, confirm) = {
            let mut inner = self.inner.lock().await;
            *inner.abort_calls.entry(session_id.to_string()).or_default() += 1;
            (
                inner.streams.get(session_id).cloned().unwrap_or_default(),
                inner.confirm_aborts,
            )
        };
        if confirm {
            for tx in senders {
                let _ = tx
                    .send(Ok(RemoteEvent::Status {
                        status: shared_types::RemoteSessionStatus::Aborted,
                    }))
                    .await;
            }
        }
        Ok(())
    }

    async fn health(&self, session_id: &str) -> Result<SessionHealth, AdapterError> {
        let inner = self.inner.lock().await;
        if let Some(health) = inner.health.get(session_id) {
            return Ok(health.clone());
        }
        if inner.sessions.iter().any(|s| s == session_id) {
            Ok(SessionHealth::Running)
        } else {
            Ok(SessionHealth::Gone)
        }
    }

    async fn resolve_gate(
        &self,
        session_id: &str,
        gate_id: &str,
        approve: bool,
    ) -> Result<(), AdapterError> {
        self.inner.lock().await.gate_replies.push((
            session_id.to_string(),
            gate_id.to_string(),
            approve,
        ));
        Ok(())
    }
}

// ============================================================================
// Core harness
// ============================================================================

pub fn test_timeouts() -> TimeoutPolicy {
    TimeoutPolicy {
        session_create: Duration::from_secs(5),
        send_message: Duration::from_secs(5),
        stream_idle: Duration::from_secs(5),
        abort_confirm: Duration::from_millis(400),
        gate_reminder: Duration::from_secs(60),
        reconnect_base: Duration::from_millis(10),
        reconnect_cap: Duration::from_millis(40),
        max_reconnects_per_window: 3,
        reconnect_window: Duration::from_secs(10),
        abort_retries: 2,
    }
}

pub struct TestCore {
    pub store: ActorRef<EventStoreMsg>,
    pub orchestrator: ActorRef<OrchestratorMsg>,
    pub notifier: ActorRef<NotifierMsg>,
    pub builder: Arc<MockBuilder>,
    pub registry: Arc<BuilderRegistry>,
    pub prompts: Arc<PromptWorkspace>,
    _tmp: Option<tempfile::TempDir>,
}

impl TestCore {
    pub async fn shutdown(&self) {
        self.orchestrator.stop(None);
        self.notifier.stop(None);
        self.store.stop(None);
    }
}

pub async fn boot_core() -> TestCore {
    let tmp = tempfile::tempdir().unwrap();
    boot_core_inner(EventStoreArguments::InMemory, tmp.path().to_path_buf(), Some(tmp)).await
}

/// Boot against a persistent database and prompt directory, for restart
/// scenarios. Caller owns the directory.
pub async fn boot_core_at(root: &std::path::Path) -> TestCore {
    let db = root.join("state").join("events.db");
    boot_core_inner(
        EventStoreArguments::File(db.to_string_lossy().to_string()),
        root.to_path_buf(),
        None,
    )
    .await
}

async fn boot_core_inner(
    store_args: EventStoreArguments,
    root: std::path::PathBuf,
    tmp: Option<tempfile::TempDir>,
) -> TestCore {
    let (store, _) = Actor::spawn(None, EventStoreActor, store_args).await.unwrap();

    let (notifier, _) = Actor::spawn(
        None,
        NotifierActor,
        NotifierArguments { coalesce_window: Duration::from_millis(50) },
    )
    .await
    .unwrap();
    store.cast(EventStoreMsg::SetNotifier { notifier: notifier.clone() }).unwrap();

    let builder = MockBuilder::new("default");
    let registry = Arc::new(BuilderRegistry::from_adapters(vec![
        builder.clone() as Arc<dyn BuilderAdapter>
    ]));
    let prompts = Arc::new(PromptWorkspace::new(root.join("prompts")));

    let (orchestrator, _) = Actor::spawn(
        None,
        OrchestratorActor,
        OrchestratorArguments {
            event_store: store.clone(),
            prompts: prompts.clone(),
            registry: registry.clone(),
            context: Arc::new(conversator::context::NoopContextLookup),
            timeouts: test_timeouts(),
        },
    )
    .await
    .unwrap();

    TestCore { store, orchestrator, notifier, builder, registry, prompts, _tmp: tmp }
}

// ============================================================================
// Command helpers
// ============================================================================

pub async fn create_task(core: &TestCore, title: &str) -> Task {
    ractor::call!(core.orchestrator, |reply| OrchestratorMsg::CreateTask {
        title: title.to_string(),
        priority: Priority::Normal,
        command_id: None,
        reply
    })
    .unwrap()
    .unwrap()
}

pub async fn update_prompt(core: &TestCore, task_id: &str, intent: &str) {
    ractor::call!(core.orchestrator, |reply| OrchestratorMsg::UpdateWorkingPrompt {
        task_id: task_id.to_string(),
        delta_summary: "initial capture".to_string(),
        patch: WorkingPromptPatch { intent: Some(intent.to_string()), ..Default::default() },
        command_id: None,
        reply
    })
    .unwrap()
    .unwrap();
}

pub async fn raise_questions(core: &TestCore, task_id: &str, questions: &[&str]) {
    ractor::call!(core.orchestrator, |reply| OrchestratorMsg::RaiseQuestions {
        task_id: task_id.to_string(),
        questions: questions.iter().map(|q| q.to_string()).collect(),
        command_id: None,
        reply
    })
    .unwrap()
    .unwrap();
}

pub async fn answer_questions(core: &TestCore, task_id: &str, answers: serde_json::Value) {
    ractor::call!(core.orchestrator, |reply| OrchestratorMsg::AnswerQuestions {
        task_id: task_id.to_string(),
        answers,
        command_id: None,
        reply
    })
    .unwrap()
    .unwrap();
}

pub async fn freeze_prompt(core: &TestCore, task_id: &str) -> HandoffPaths {
    ractor::call!(core.orchestrator, |reply| OrchestratorMsg::FreezePrompt {
        task_id: task_id.to_string(),
        command_id: None,
        reply
    })
    .unwrap()
    .unwrap()
}

pub async fn dispatch(core: &TestCore, task_id: &str) -> DispatchOutcome {
    try_dispatch(core, task_id).await.unwrap()
}

pub async fn try_dispatch(
    core: &TestCore,
    task_id: &str,
) -> Result<DispatchOutcome, CommandError> {
    ractor::call!(core.orchestrator, |reply| OrchestratorMsg::Dispatch {
        task_id: task_id.to_string(),
        builder_kind: "default".to_string(),
        command_id: None,
        reply
    })
    .unwrap()
}

pub async fn resolve_gate(core: &TestCore, task_id: &str, decision: GateDecision) {
    ractor::call!(core.orchestrator, |reply| OrchestratorMsg::ResolveGate {
        task_id: task_id.to_string(),
        decision,
        command_id: None,
        reply
    })
    .unwrap()
    .unwrap();
}

pub async fn cancel(core: &TestCore, task_id: &str, reason: &str) {
    ractor::call!(core.orchestrator, |reply| OrchestratorMsg::Cancel {
        task_id: task_id.to_string(),
        reason: reason.to_string(),
        command_id: None,
        reply
    })
    .unwrap()
    .unwrap();
}

/// Drive a fresh task through refine + freeze, ready for dispatch.
pub async fn ready_task(core: &TestCore, title: &str) -> Task {
    let task = create_task(core, title).await;
    update_prompt(core, &task.task_id, "captured intent").await;
    freeze_prompt(core, &task.task_id).await;
    get_task(core, &task.task_id).await
}

// ============================================================================
// Query + polling helpers
// ============================================================================

pub async fn get_task(core: &TestCore, task_id: &str) -> Task {
    ractor::call!(core.store, |reply| EventStoreMsg::GetTask {
        task_id: task_id.to_string(),
        reply
    })
    .unwrap()
    .unwrap()
}

pub async fn event_types(core: &TestCore) -> Vec<String> {
    ractor::call!(core.store, |reply| EventStoreMsg::GetEvents {
        task_id: None,
        since_seq: 0,
        limit: i64::MAX,
        reply
    })
    .unwrap()
    .unwrap()
    .into_iter()
    .map(|e| e.event_type.as_str().to_string())
    .collect()
}

pub async fn wait_for_status(core: &TestCore, task_id: &str, status: TaskStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let task = get_task(core, task_id).await;
        if task.status == status {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "task {task_id} never reached {status}; stuck at {} with events {:?}",
                task.status,
                event_types(core).await
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait until the consumer has attached a live stream for the session.
pub async fn wait_for_stream(builder: &MockBuilder, session_id: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !builder.has_open_stream(session_id).await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for a stream on session {session_id}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait until the log holds `count` events of the given type.
pub async fn wait_for_event_count(core: &TestCore, event_type: &str, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let types = event_types(core).await;
        if types.iter().filter(|t| *t == event_type).count() >= count {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {count} {event_type} events; log: {types:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait until the mock has recorded exactly the expected gate replies.
pub async fn wait_for_gate_replies(core: &TestCore, expected: Vec<(String, String, bool)>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let replies = core.builder.gate_replies().await;
        if replies == expected {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for gate replies {expected:?}; saw {replies:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn assert_outcome_appended(outcome: &AppendOutcome) {
    assert!(matches!(outcome, AppendOutcome::Appended(_)));
}
