//! OrchestratorActor - the task command surface.
//!
//! Translates external commands (voice tool calls, dashboard actions) into
//! validated events appended through the event store, and interprets
//! observations published by builder-session consumers. It is the only
//! component that constructs status-changing events; the store's validator
//! is the final authority on transitions.
//!
//! Every command accepts an optional client command id. A repeated command id
//! observes its original outcome and appends nothing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};

use shared_types::{
    ArtifactRef, BuilderDispatchedPayload, BuilderSession, BuilderStatusChangedPayload,
    BuildCompletedPayload, BuildFailedPayload, CancelPhase, EventRefs, EventType, GateDecision,
    GateKind, GateRequestedPayload, GateResolvedPayload, HandoffFrozenPayload, Priority,
    QuestionsRaisedPayload, QuickDispatchBlockedPayload, QuickDispatchExecutedPayload,
    QuickDispatchRequestedPayload, RemoteSessionStatus, Task, TaskCanceledPayload,
    TaskCreatedPayload, TaskStatus, UserAnsweredPayload, WorkingPromptUpdatedPayload,
};

use crate::builders::{dispatch_token, BuilderRegistry, SessionHealth};
use crate::config::TimeoutPolicy;
use crate::context::ContextLookup;
use crate::prompts::{PromptWorkspace, WorkingPromptPatch};
use crate::quick_dispatch::{classify, QuickOperation, QuickVerdict};

use super::builder_session::{BuilderSessionActor, BuilderSessionArgs, BuilderSessionMsg};
use super::event_store::{AppendEvent, AppendOutcome, EventStoreError, EventStoreMsg};
use super::projection::topic_slug;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CommandError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// The command queue is above its high-water mark; retry later.
    #[error("busy")]
    Busy,

    #[error("storage: {0}")]
    Storage(String),

    #[error("builder: {0}")]
    Builder(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl From<EventStoreError> for CommandError {
    fn from(e: EventStoreError) -> Self {
        match e {
            EventStoreError::Conflict(msg) => CommandError::Conflict(msg),
            EventStoreError::Validation(msg) => CommandError::Validation(msg),
            EventStoreError::ReadOnly => {
                CommandError::Storage("event store is read-only".to_string())
            }
            EventStoreError::Storage(msg) => CommandError::Storage(msg),
            EventStoreError::Serialization(msg) => CommandError::Internal(msg),
        }
    }
}

impl From<crate::prompts::PromptError> for CommandError {
    fn from(e: crate::prompts::PromptError) -> Self {
        match e {
            crate::prompts::PromptError::Frozen(_) => CommandError::Conflict(e.to_string()),
            crate::prompts::PromptError::MissingWorking(_) => {
                CommandError::Validation(e.to_string())
            }
            crate::prompts::PromptError::Io { .. } => CommandError::Storage(e.to_string()),
        }
    }
}

impl From<crate::builders::AdapterError> for CommandError {
    fn from(e: crate::builders::AdapterError) -> Self {
        CommandError::Builder(e.to_string())
    }
}

impl<T> From<ractor::RactorErr<T>> for CommandError {
    fn from(e: ractor::RactorErr<T>) -> Self {
        CommandError::Internal(e.to_string())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HandoffPaths {
    pub handoff_md_path: String,
    pub handoff_json_path: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DispatchOutcome {
    pub session_id: String,
    /// True when an identical dispatch token matched the in-flight session.
    pub reused: bool,
}

/// Observation forwarded by a builder-session consumer. The orchestrator
/// turns these into domain events; consumers never touch derived state.
#[derive(Debug, Clone)]
pub enum RemoteObservation {
    Status(RemoteSessionStatus),
    Gate { gate_id: String, kind: GateKind, description: String, files: Vec<String> },
    Completed { artifacts: Vec<ArtifactRef> },
    Failed { reason: String },
    /// The stream could not be re-established within policy.
    Lost { reason: String },
}

pub enum OrchestratorMsg {
    CreateTask {
        title: String,
        priority: Priority,
        command_id: Option<String>,
        reply: RpcReplyPort<Result<Task, CommandError>>,
    },
    UpdateWorkingPrompt {
        task_id: String,
        delta_summary: String,
        patch: WorkingPromptPatch,
        command_id: Option<String>,
        reply: RpcReplyPort<Result<String, CommandError>>,
    },
    RaiseQuestions {
        task_id: String,
        questions: Vec<String>,
        command_id: Option<String>,
        reply: RpcReplyPort<Result<(), CommandError>>,
    },
    AnswerQuestions {
        task_id: String,
        answers: serde_json::Value,
        command_id: Option<String>,
        reply: RpcReplyPort<Result<(), CommandError>>,
    },
    FreezePrompt {
        task_id: String,
        command_id: Option<String>,
        reply: RpcReplyPort<Result<HandoffPaths, CommandError>>,
    },
    Dispatch {
        task_id: String,
        builder_kind: String,
        command_id: Option<String>,
        reply: RpcReplyPort<Result<DispatchOutcome, CommandError>>,
    },
    ResolveGate {
        task_id: String,
        decision: GateDecision,
        command_id: Option<String>,
        reply: RpcReplyPort<Result<(), CommandError>>,
    },
    Cancel {
        task_id: String,
        reason: String,
        command_id: Option<String>,
        reply: RpcReplyPort<Result<(), CommandError>>,
    },
    LinkExternal {
        task_id: String,
        external_task_id: String,
        command_id: Option<String>,
        reply: RpcReplyPort<Result<(), CommandError>>,
    },
    QuickDispatch {
        operation: QuickOperation,
        command: String,
        reply: RpcReplyPort<Result<QuickVerdict, CommandError>>,
    },
    ReportQuickResult {
        operation: QuickOperation,
        command: String,
        success: bool,
        via: String,
        reply: RpcReplyPort<Result<(), CommandError>>,
    },
    /// Probe recorded sessions after a restart and resume or settle them.
    Reconcile { reply: RpcReplyPort<usize> },

    // Observations from builder-session consumers.
    Observe { task_id: String, session_id: String, observation: RemoteObservation },
    AbortResolved { task_id: String, confirmed: bool },
    SessionStopped { task_id: String },
}

impl std::fmt::Debug for OrchestratorMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OrchestratorMsg::CreateTask { .. } => "CreateTask",
            OrchestratorMsg::UpdateWorkingPrompt { .. } => "UpdateWorkingPrompt",
            OrchestratorMsg::RaiseQuestions { .. } => "RaiseQuestions",
            OrchestratorMsg::AnswerQuestions { .. } => "AnswerQuestions",
            OrchestratorMsg::FreezePrompt { .. } => "FreezePrompt",
            OrchestratorMsg::Dispatch { .. } => "Dispatch",
            OrchestratorMsg::ResolveGate { .. } => "ResolveGate",
            OrchestratorMsg::Cancel { .. } => "Cancel",
            OrchestratorMsg::LinkExternal { .. } => "LinkExternal",
            OrchestratorMsg::QuickDispatch { .. } => "QuickDispatch",
            OrchestratorMsg::ReportQuickResult { .. } => "ReportQuickResult",
            OrchestratorMsg::Reconcile { .. } => "Reconcile",
            OrchestratorMsg::Observe { .. } => "Observe",
            OrchestratorMsg::AbortResolved { .. } => "AbortResolved",
            OrchestratorMsg::SessionStopped { .. } => "SessionStopped",
        };
        f.write_str(name)
    }
}

pub struct OrchestratorArguments {
    pub event_store: ActorRef<EventStoreMsg>,
    pub prompts: Arc<PromptWorkspace>,
    pub registry: Arc<BuilderRegistry>,
    pub context: Arc<dyn ContextLookup>,
    pub timeouts: TimeoutPolicy,
}

pub struct OrchestratorState {
    event_store: ActorRef<EventStoreMsg>,
    prompts: Arc<PromptWorkspace>,
    registry: Arc<BuilderRegistry>,
    context: Arc<dyn ContextLookup>,
    timeouts: TimeoutPolicy,
    /// Live stream consumers, one per dispatched task.
    consumers: HashMap<String, ActorRef<BuilderSessionMsg>>,
}

#[derive(Debug, Default)]
pub struct OrchestratorActor;

#[async_trait]
impl Actor for OrchestratorActor {
    type Msg = OrchestratorMsg;
    type State = OrchestratorState;
    type Arguments = OrchestratorArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(actor_id = %myself.get_id(), "OrchestratorActor starting");
        Ok(OrchestratorState {
            event_store: args.event_store,
            prompts: args.prompts,
            registry: args.registry,
            context: args.context,
            timeouts: args.timeouts,
            consumers: HashMap::new(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            OrchestratorMsg::CreateTask { title, priority, command_id, reply } => {
                let _ = reply.send(self.create_task(state, title, priority, command_id).await);
            }
            OrchestratorMsg::UpdateWorkingPrompt {
                task_id,
                delta_summary,
                patch,
                command_id,
                reply,
            } => {
                let _ = reply.send(
                    self.update_working_prompt(state, &task_id, delta_summary, patch, command_id)
                        .await,
                );
            }
            OrchestratorMsg::RaiseQuestions { task_id, questions, command_id, reply } => {
                let result = self
                    .append_simple(
                        state,
                        EventType::QuestionsRaised,
                        task_id,
                        serde_json::to_value(QuestionsRaisedPayload { questions }),
                        None,
                        command_id,
                    )
                    .await;
                let _ = reply.send(result);
            }
            OrchestratorMsg::AnswerQuestions { task_id, answers, command_id, reply } => {
                let result = self
                    .append_simple(
                        state,
                        EventType::UserAnswered,
                        task_id,
                        serde_json::to_value(UserAnsweredPayload { answers }),
                        None,
                        command_id,
                    )
                    .await;
                let _ = reply.send(result);
            }
            OrchestratorMsg::FreezePrompt { task_id, command_id, reply } => {
                let _ = reply.send(self.freeze_prompt(state, &task_id, command_id).await);
            }
            OrchestratorMsg::Dispatch { task_id, builder_kind, command_id, reply } => {
                let _ = reply.send(
                    self.dispatch(state, &myself, &task_id, &builder_kind, command_id).await,
                );
            }
            OrchestratorMsg::ResolveGate { task_id, decision, command_id, reply } => {
                let _ =
                    reply.send(self.resolve_gate(state, &task_id, decision, command_id).await);
            }
            OrchestratorMsg::Cancel { task_id, reason, command_id, reply } => {
                let _ = reply.send(self.cancel(state, &task_id, reason, command_id).await);
            }
            OrchestratorMsg::LinkExternal { task_id, external_task_id, command_id, reply } => {
                let refs = EventRefs {
                    external_task_id: Some(external_task_id.clone()),
                    ..Default::default()
                };
                let result = self
                    .append_simple(
                        state,
                        EventType::ExternalTaskLinked,
                        task_id,
                        Ok(serde_json::json!({ "external_task_id": external_task_id })),
                        Some(refs),
                        command_id,
                    )
                    .await;
                let _ = reply.send(result);
            }
            OrchestratorMsg::QuickDispatch { operation, command, reply } => {
                let _ = reply.send(self.quick_dispatch(state, operation, command).await);
            }
            OrchestratorMsg::ReportQuickResult { operation, command, success, via, reply } => {
                let payload = serde_json::to_value(QuickDispatchExecutedPayload {
                    operation: operation.as_str().to_string(),
                    command,
                    success,
                    via,
                });
                let result = match payload {
                    Ok(payload) => self
                        .append(
                            state,
                            AppendEvent {
                                event_type: EventType::QuickDispatchExecuted,
                                task_id: None,
                                refs: None,
                                payload,
                                command_id: None,
                            },
                        )
                        .await
                        .map(|_| ()),
                    Err(e) => Err(CommandError::Internal(e.to_string())),
                };
                let _ = reply.send(result);
            }
            OrchestratorMsg::Reconcile { reply } => {
                let count = self.reconcile(state, &myself).await;
                let _ = reply.send(count);
            }
            OrchestratorMsg::Observe { task_id, session_id, observation } => {
                self.observe(state, &task_id, &session_id, observation).await;
            }
            OrchestratorMsg::AbortResolved { task_id, confirmed } => {
                self.abort_resolved(state, &task_id, confirmed).await;
            }
            OrchestratorMsg::SessionStopped { task_id } => {
                state.consumers.remove(&task_id);
            }
        }
        Ok(())
    }
}

impl OrchestratorActor {
    async fn append(
        &self,
        state: &OrchestratorState,
        event: AppendEvent,
    ) -> Result<AppendOutcome, CommandError> {
        let outcome = ractor::call!(state.event_store, |reply| EventStoreMsg::Append {
            event,
            reply
        })??;
        Ok(outcome)
    }

    /// Append a single task-scoped event built from a serialized payload.
    async fn append_simple(
        &self,
        state: &OrchestratorState,
        event_type: EventType,
        task_id: String,
        payload: Result<serde_json::Value, serde_json::Error>,
        refs: Option<EventRefs>,
        command_id: Option<String>,
    ) -> Result<(), CommandError> {
        let payload = payload.map_err(|e| CommandError::Internal(e.to_string()))?;
        self.append(
            state,
            AppendEvent { event_type, task_id: Some(task_id), refs, payload, command_id },
        )
        .await
        .map(|_| ())
    }

    async fn get_task(
        &self,
        state: &OrchestratorState,
        task_id: &str,
    ) -> Result<Task, CommandError> {
        ractor::call!(state.event_store, |reply| EventStoreMsg::GetTask {
            task_id: task_id.to_string(),
            reply
        })?
        .ok_or_else(|| CommandError::NotFound(format!("task {task_id}")))
    }

    async fn get_session(
        &self,
        state: &OrchestratorState,
        session_id: &str,
    ) -> Result<Option<BuilderSession>, CommandError> {
        Ok(ractor::call!(state.event_store, |reply| EventStoreMsg::GetSession {
            session_id: session_id.to_string(),
            reply
        })?)
    }

    async fn create_task(
        &self,
        state: &OrchestratorState,
        title: String,
        priority: Priority,
        command_id: Option<String>,
    ) -> Result<Task, CommandError> {
        let task_id = uuid::Uuid::new_v4().to_string();
        let topic = topic_slug(&task_id);
        let working_path = state.prompts.init_working(&topic, &title).await?;

        let outcome = self
            .append(
                state,
                AppendEvent::new(
                    EventType::TaskCreated,
                    Some(task_id.clone()),
                    TaskCreatedPayload {
                        title,
                        priority,
                        working_prompt_path: Some(working_path.to_string_lossy().to_string()),
                    },
                )
                .map_err(|e| CommandError::Internal(e.to_string()))?
                .with_command_id(command_id),
            )
            .await?;

        // A duplicate command id refers to the originally created task.
        let effective_id = outcome
            .event()
            .task_id
            .clone()
            .unwrap_or(task_id);
        self.get_task(state, &effective_id).await
    }

    async fn update_working_prompt(
        &self,
        state: &OrchestratorState,
        task_id: &str,
        delta_summary: String,
        patch: WorkingPromptPatch,
        command_id: Option<String>,
    ) -> Result<String, CommandError> {
        let task = self.get_task(state, task_id).await?;
        // Check before touching the file: a frozen prompt is immutable.
        if !matches!(task.status, TaskStatus::Draft | TaskStatus::Refining) {
            return Err(CommandError::Conflict(format!(
                "working prompt of task {task_id} is not editable in status {}",
                task.status
            )));
        }

        let topic = topic_slug(task_id);
        let (path, _) = state.prompts.update_working(&topic, patch).await?;
        let path = path.to_string_lossy().to_string();

        let outcome = self
            .append(
                state,
                AppendEvent::new(
                    EventType::WorkingPromptUpdated,
                    Some(task_id.to_string()),
                    WorkingPromptUpdatedPayload { path: path.clone(), delta_summary },
                )
                .map_err(|e| CommandError::Internal(e.to_string()))?
                .with_command_id(command_id),
            )
            .await?;

        match outcome {
            AppendOutcome::Appended(_) => Ok(path),
            AppendOutcome::Duplicate(event) => Ok(event
                .payload
                .get("path")
                .and_then(|p| p.as_str())
                .unwrap_or(&path)
                .to_string()),
        }
    }

    async fn freeze_prompt(
        &self,
        state: &OrchestratorState,
        task_id: &str,
        command_id: Option<String>,
    ) -> Result<HandoffPaths, CommandError> {
        let task = self.get_task(state, task_id).await?;
        let topic = topic_slug(task_id);

        // Idempotent re-request after a successful freeze.
        if task.status == TaskStatus::ReadyToHandoff {
            if let (Some(md), Some(json)) = (&task.handoff_prompt_path, &task.handoff_spec_path) {
                return Ok(HandoffPaths {
                    handoff_md_path: md.clone(),
                    handoff_json_path: json.clone(),
                });
            }
        }
        if task.status != TaskStatus::Refining {
            return Err(CommandError::Conflict(format!(
                "task {task_id} cannot freeze from status {}",
                task.status
            )));
        }

        // Pointer-first context: record paths from the retrieval store, not
        // their content.
        let working = state.prompts.read_working(&topic).await?;
        let hits = state.context.lookup_context(&working.intent, 5).await;
        let pointers = shared_types::ContextPointers {
            external_task_id: task.external_task_id.clone(),
            artifact_paths: hits.into_iter().map(|h| h.path).collect(),
        };
        let outcome = state.prompts.freeze(&topic, pointers).await?;

        let paths = HandoffPaths {
            handoff_md_path: outcome.handoff_md_path.to_string_lossy().to_string(),
            handoff_json_path: outcome.handoff_json_path.to_string_lossy().to_string(),
        };

        self.append(
            state,
            AppendEvent::new(
                EventType::HandoffFrozen,
                Some(task_id.to_string()),
                HandoffFrozenPayload {
                    handoff_md_path: paths.handoff_md_path.clone(),
                    handoff_json_path: paths.handoff_json_path.clone(),
                    digest: outcome.digest,
                },
            )
            .map_err(|e| CommandError::Internal(e.to_string()))?
            .with_command_id(command_id),
        )
        .await?;

        Ok(paths)
    }

    async fn dispatch(
        &self,
        state: &mut OrchestratorState,
        myself: &ActorRef<OrchestratorMsg>,
        task_id: &str,
        builder_kind: &str,
        command_id: Option<String>,
    ) -> Result<DispatchOutcome, CommandError> {
        let task = self.get_task(state, task_id).await?;
        let adapter = state
            .registry
            .get(builder_kind)
            .ok_or_else(|| CommandError::Validation(format!("unknown builder '{builder_kind}'")))?;

        let topic = topic_slug(task_id);
        let digest = state
            .prompts
            .handoff_digest(&topic)
            .await
            .map_err(|_| CommandError::Conflict(format!("task {task_id} has no frozen handoff")))?;
        let token = dispatch_token(task_id, &digest);

        // Idempotency: an identical token against the in-flight session is a
        // no-op; a differing token is a conflict.
        if let Some(session_id) = &task.builder_session_id {
            if let Some(session) = self.get_session(state, session_id).await? {
                if !session.status.is_terminal() {
                    if session.dispatch_token == token {
                        return Ok(DispatchOutcome {
                            session_id: session.session_id,
                            reused: true,
                        });
                    }
                    return Err(CommandError::Conflict(format!(
                        "task {task_id} already has an in-flight session with different contents"
                    )));
                }
            }
        }

        if task.status != TaskStatus::ReadyToHandoff {
            return Err(CommandError::Conflict(format!(
                "task {task_id} cannot dispatch from status {}",
                task.status
            )));
        }

        // Bounded session pool per builder.
        let sessions =
            ractor::call!(state.event_store, |reply| EventStoreMsg::ListSessions { reply })?;
        let live = sessions
            .iter()
            .filter(|s| s.builder_kind == builder_kind && !s.status.is_terminal())
            .count();
        if live >= adapter.max_sessions() {
            return Err(CommandError::Busy);
        }

        let session_id = adapter.create_session(task_id).await?;

        // Pointer-first handoff: reference the frozen artifacts rather than
        // inlining them.
        let message = format!(
            "Execute the frozen handoff for task {task_id}.\n\
             Handoff document: {}\n\
             Execution contract: {}",
            task.handoff_prompt_path.as_deref().unwrap_or("handoff.md"),
            task.handoff_spec_path.as_deref().unwrap_or("handoff.json"),
        );
        if let Err(e) = adapter.send_message(&session_id, &message).await {
            let _ = adapter.abort(&session_id).await;
            return Err(e.into());
        }

        let outcome = self
            .append(
                state,
                AppendEvent::new(
                    EventType::BuilderDispatched,
                    Some(task_id.to_string()),
                    BuilderDispatchedPayload {
                        session_id: session_id.clone(),
                        builder_kind: builder_kind.to_string(),
                        dispatch_token: token,
                    },
                )
                .map_err(|e| CommandError::Internal(e.to_string()))?
                .with_refs(EventRefs { session_id: Some(session_id.clone()), ..Default::default() })
                .with_command_id(command_id),
            )
            .await?;

        if let AppendOutcome::Duplicate(event) = &outcome {
            let prior_session = event
                .payload
                .get("session_id")
                .and_then(|s| s.as_str())
                .unwrap_or(&session_id)
                .to_string();
            // The remote session we just opened is surplus; shut it down.
            let _ = adapter.abort(&session_id).await;
            return Ok(DispatchOutcome { session_id: prior_session, reused: true });
        }

        self.spawn_consumer(state, myself, task_id, &session_id, adapter).await;
        tracing::info!(task_id, session_id = %session_id, builder = builder_kind, "Dispatched task to builder");

        Ok(DispatchOutcome { session_id, reused: false })
    }

    async fn spawn_consumer(
        &self,
        state: &mut OrchestratorState,
        myself: &ActorRef<OrchestratorMsg>,
        task_id: &str,
        session_id: &str,
        adapter: Arc<dyn crate::builders::BuilderAdapter>,
    ) {
        let args = BuilderSessionArgs {
            task_id: task_id.to_string(),
            session_id: session_id.to_string(),
            adapter,
            orchestrator: myself.clone(),
            timeouts: state.timeouts.clone(),
        };
        match Actor::spawn(None, BuilderSessionActor, args).await {
            Ok((consumer, _)) => {
                state.consumers.insert(task_id.to_string(), consumer);
            }
            Err(e) => {
                tracing::error!(task_id, error = %e, "Failed to spawn builder session consumer");
            }
        }
    }

    async fn resolve_gate(
        &self,
        state: &OrchestratorState,
        task_id: &str,
        decision: GateDecision,
        command_id: Option<String>,
    ) -> Result<(), CommandError> {
        let _ = self.get_task(state, task_id).await?;
        let gate = ractor::call!(state.event_store, |reply| EventStoreMsg::PendingGate {
            task_id: task_id.to_string(),
            reply
        })?
        .ok_or_else(|| CommandError::Validation(format!("task {task_id} has no pending gate")))?;

        let event_type = match decision {
            GateDecision::Approve => EventType::GateApproved,
            GateDecision::Deny => EventType::GateDenied,
        };
        let outcome = self
            .append(
                state,
                AppendEvent::new(
                    event_type,
                    Some(task_id.to_string()),
                    GateResolvedPayload { gate_id: gate.gate_id.clone(), decision, auto: false },
                )
                .map_err(|e| CommandError::Internal(e.to_string()))?
                .with_refs(EventRefs {
                    session_id: Some(gate.session_id.clone()),
                    ..Default::default()
                })
                .with_command_id(command_id),
            )
            .await?;

        if matches!(outcome, AppendOutcome::Appended(_)) {
            if let Some(consumer) = state.consumers.get(task_id) {
                let _ = consumer.cast(BuilderSessionMsg::ResolveGate {
                    gate_id: gate.gate_id,
                    approve: decision == GateDecision::Approve,
                });
            }
        }
        Ok(())
    }

    async fn cancel(
        &self,
        state: &OrchestratorState,
        task_id: &str,
        reason: String,
        command_id: Option<String>,
    ) -> Result<(), CommandError> {
        let task = self.get_task(state, task_id).await?;
        if task.status.is_terminal() {
            return Err(CommandError::Conflict(format!(
                "task {task_id} is already terminal ({})",
                task.status
            )));
        }

        // A cancellation while a gate is pending auto-denies it first.
        if task.status == TaskStatus::AwaitingGate {
            if let Some(gate) = ractor::call!(state.event_store, |reply| {
                EventStoreMsg::PendingGate { task_id: task_id.to_string(), reply }
            })? {
                self.append(
                    state,
                    AppendEvent::new(
                        EventType::GateDenied,
                        Some(task_id.to_string()),
                        GateResolvedPayload {
                            gate_id: gate.gate_id.clone(),
                            decision: GateDecision::Deny,
                            auto: true,
                        },
                    )
                    .map_err(|e| CommandError::Internal(e.to_string()))?,
                )
                .await?;
                if let Some(consumer) = state.consumers.get(task_id) {
                    let _ = consumer.cast(BuilderSessionMsg::ResolveGate {
                        gate_id: gate.gate_id,
                        approve: false,
                    });
                }
            }
        }

        let outcome = self
            .append(
                state,
                AppendEvent::new(
                    EventType::TaskCanceled,
                    Some(task_id.to_string()),
                    TaskCanceledPayload { reason: reason.clone(), phase: CancelPhase::Pending },
                )
                .map_err(|e| CommandError::Internal(e.to_string()))?
                .with_command_id(command_id),
            )
            .await?;

        if matches!(outcome, AppendOutcome::Appended(_)) {
            match state.consumers.get(task_id) {
                Some(consumer) => {
                    let _ = consumer.cast(BuilderSessionMsg::Abort);
                }
                None => {
                    // Nothing remote to abort: resolve the cancel at once.
                    self.append_cancel_resolution(state, task_id, true).await;
                }
            }
        }
        Ok(())
    }

    async fn abort_resolved(
        &self,
        state: &mut OrchestratorState,
        task_id: &str,
        confirmed: bool,
    ) {
        self.append_cancel_resolution(state, task_id, confirmed).await;
        state.consumers.remove(task_id);
    }

    async fn append_cancel_resolution(
        &self,
        state: &OrchestratorState,
        task_id: &str,
        confirmed: bool,
    ) {
        let phase = if confirmed { CancelPhase::Confirmed } else { CancelPhase::Unconfirmed };
        let event = AppendEvent::new(
            EventType::TaskCanceled,
            Some(task_id.to_string()),
            TaskCanceledPayload { reason: "abort resolution".to_string(), phase },
        );
        match event {
            Ok(event) => {
                if let Err(e) = self.append(state, event).await {
                    tracing::warn!(task_id, error = %e, "Failed to append cancel resolution");
                }
            }
            Err(e) => tracing::warn!(task_id, error = %e, "Failed to build cancel resolution"),
        }
    }

    async fn quick_dispatch(
        &self,
        state: &OrchestratorState,
        operation: QuickOperation,
        command: String,
    ) -> Result<QuickVerdict, CommandError> {
        self.append(
            state,
            AppendEvent::new(
                EventType::QuickDispatchRequested,
                None,
                QuickDispatchRequestedPayload {
                    operation: operation.as_str().to_string(),
                    command: command.clone(),
                },
            )
            .map_err(|e| CommandError::Internal(e.to_string()))?,
        )
        .await?;

        let verdict = classify(operation, &command);
        if let QuickVerdict::Blocked { reason } = &verdict {
            self.append(
                state,
                AppendEvent::new(
                    EventType::QuickDispatchBlocked,
                    None,
                    QuickDispatchBlockedPayload {
                        operation: operation.as_str().to_string(),
                        command,
                        reason: reason.clone(),
                    },
                )
                .map_err(|e| CommandError::Internal(e.to_string()))?,
            )
            .await?;
        }
        Ok(verdict)
    }

    /// Turn a remote observation into domain events. Conflicts against
    /// already-terminal tasks are expected during shutdown races and are
    /// logged, not propagated.
    async fn observe(
        &self,
        state: &mut OrchestratorState,
        task_id: &str,
        session_id: &str,
        observation: RemoteObservation,
    ) {
        let result = self.observe_inner(state, task_id, session_id, observation).await;
        if let Err(e) = result {
            match e {
                CommandError::Conflict(msg) => {
                    tracing::debug!(task_id, %msg, "Ignored late remote observation");
                }
                other => {
                    tracing::warn!(task_id, error = %other, "Failed to record remote observation");
                }
            }
        }
    }

    async fn observe_inner(
        &self,
        state: &mut OrchestratorState,
        task_id: &str,
        session_id: &str,
        observation: RemoteObservation,
    ) -> Result<(), CommandError> {
        let refs = EventRefs { session_id: Some(session_id.to_string()), ..Default::default() };

        match observation {
            RemoteObservation::Status(status) => {
                // A remote-initiated abort (not one we asked for) is terminal.
                if status == RemoteSessionStatus::Aborted {
                    self.append(
                        state,
                        AppendEvent::new(
                            EventType::BuildFailed,
                            Some(task_id.to_string()),
                            BuildFailedPayload {
                                session_id: Some(session_id.to_string()),
                                reason: "session aborted by remote".to_string(),
                            },
                        )
                        .map_err(|e| CommandError::Internal(e.to_string()))?
                        .with_refs(refs),
                    )
                    .await?;
                    return Ok(());
                }
                // Drop duplicate status frames (reconnects replay them).
                if let Some(session) = self.get_session(state, session_id).await? {
                    if session.status == status.to_session_status()
                        && status != RemoteSessionStatus::Running
                    {
                        return Ok(());
                    }
                    let task = self.get_task(state, task_id).await?;
                    if status == RemoteSessionStatus::Running
                        && task.status == TaskStatus::Running
                    {
                        return Ok(());
                    }
                }
                self.append(
                    state,
                    AppendEvent::new(
                        EventType::BuilderStatusChanged,
                        Some(task_id.to_string()),
                        BuilderStatusChangedPayload {
                            session_id: session_id.to_string(),
                            status,
                            reason: None,
                        },
                    )
                    .map_err(|e| CommandError::Internal(e.to_string()))?
                    .with_refs(refs),
                )
                .await?;
            }
            RemoteObservation::Gate { gate_id, kind, description, files } => {
                self.ensure_running(state, task_id, session_id).await?;
                self.append(
                    state,
                    AppendEvent::new(
                        EventType::GateRequested,
                        Some(task_id.to_string()),
                        GateRequestedPayload {
                            session_id: session_id.to_string(),
                            gate_id,
                            kind,
                            description,
                            files,
                        },
                    )
                    .map_err(|e| CommandError::Internal(e.to_string()))?
                    .with_refs(refs),
                )
                .await?;
            }
            RemoteObservation::Completed { artifacts } => {
                self.ensure_running(state, task_id, session_id).await?;
                let artifact_path = artifacts.first().map(|a| a.path.clone());
                self.append(
                    state,
                    AppendEvent::new(
                        EventType::BuildCompleted,
                        Some(task_id.to_string()),
                        BuildCompletedPayload { session_id: session_id.to_string(), artifacts },
                    )
                    .map_err(|e| CommandError::Internal(e.to_string()))?
                    .with_refs(EventRefs {
                        session_id: Some(session_id.to_string()),
                        artifact_path,
                        ..Default::default()
                    }),
                )
                .await?;
            }
            RemoteObservation::Failed { reason } => {
                self.append(
                    state,
                    AppendEvent::new(
                        EventType::BuildFailed,
                        Some(task_id.to_string()),
                        BuildFailedPayload {
                            session_id: Some(session_id.to_string()),
                            reason,
                        },
                    )
                    .map_err(|e| CommandError::Internal(e.to_string()))?
                    .with_refs(refs),
                )
                .await?;
            }
            RemoteObservation::Lost { reason } => {
                self.append(
                    state,
                    AppendEvent::new(
                        EventType::BuilderStatusChanged,
                        Some(task_id.to_string()),
                        BuilderStatusChangedPayload {
                            session_id: session_id.to_string(),
                            status: RemoteSessionStatus::Lost,
                            reason: Some(reason),
                        },
                    )
                    .map_err(|e| CommandError::Internal(e.to_string()))?
                    .with_refs(refs),
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Some builders emit a gate or completion before any running frame;
    /// bridge the handed_off -> running transition so the event validates.
    async fn ensure_running(
        &self,
        state: &OrchestratorState,
        task_id: &str,
        session_id: &str,
    ) -> Result<(), CommandError> {
        let task = self.get_task(state, task_id).await?;
        if task.status == TaskStatus::HandedOff {
            self.append(
                state,
                AppendEvent::new(
                    EventType::BuilderStatusChanged,
                    Some(task_id.to_string()),
                    BuilderStatusChangedPayload {
                        session_id: session_id.to_string(),
                        status: RemoteSessionStatus::Running,
                        reason: None,
                    },
                )
                .map_err(|e| CommandError::Internal(e.to_string()))?
                .with_refs(EventRefs {
                    session_id: Some(session_id.to_string()),
                    ..Default::default()
                }),
            )
            .await?;
        }
        Ok(())
    }

    /// Reconciliation after restart: probe every non-terminal task that has
    /// a recorded session. Still running resumes its stream; terminal
    /// synthesizes the matching terminal event; gone fails the task.
    async fn reconcile(
        &self,
        state: &mut OrchestratorState,
        myself: &ActorRef<OrchestratorMsg>,
    ) -> usize {
        let snapshot = match ractor::call!(state.event_store, |reply| EventStoreMsg::Snapshot {
            reply
        }) {
            Ok(snap) => snap,
            Err(e) => {
                tracing::error!(error = %e, "Reconcile could not snapshot state");
                return 0;
            }
        };

        let mut reconciled = 0;
        for task in snapshot.tasks.iter().filter(|t| !t.status.is_terminal()) {
            let (Some(session_id), Some(builder_kind)) =
                (&task.builder_session_id, &task.builder_kind)
            else {
                continue;
            };
            let Some(adapter) = state.registry.get(builder_kind) else {
                tracing::warn!(
                    task_id = %task.task_id,
                    builder = %builder_kind,
                    "Recorded builder is no longer configured; failing task"
                );
                self.observe(
                    state,
                    &task.task_id,
                    session_id,
                    RemoteObservation::Lost { reason: "builder no longer configured".to_string() },
                )
                .await;
                continue;
            };

            reconciled += 1;
            match adapter.health(session_id).await {
                Ok(SessionHealth::Running) => {
                    tracing::info!(task_id = %task.task_id, session_id = %session_id, "Resuming builder stream");
                    self.spawn_consumer(state, myself, &task.task_id, session_id, adapter).await;
                }
                Ok(SessionHealth::Terminal(status)) => {
                    let observation = match status {
                        RemoteSessionStatus::Completed => {
                            RemoteObservation::Completed { artifacts: Vec::new() }
                        }
                        RemoteSessionStatus::Aborted => RemoteObservation::Failed {
                            reason: "session aborted while offline".to_string(),
                        },
                        _ => RemoteObservation::Failed {
                            reason: "session failed while offline".to_string(),
                        },
                    };
                    self.observe(state, &task.task_id, session_id, observation).await;
                }
                Ok(SessionHealth::Gone) => {
                    self.observe(
                        state,
                        &task.task_id,
                        session_id,
                        RemoteObservation::Lost {
                            reason: "session unknown to remote after restart".to_string(),
                        },
                    )
                    .await;
                }
                Err(e) => {
                    self.observe(
                        state,
                        &task.task_id,
                        session_id,
                        RemoteObservation::Lost { reason: format!("health probe failed: {e}") },
                    )
                    .await;
                }
            }
        }
        reconciled
    }
}
