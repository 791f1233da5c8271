//! Application supervisor - root of the supervision tree.
//!
//! ApplicationSupervisor (one_for_one)
//! ├── NotifierActor
//! └── OrchestratorActor
//!
//! The event store is spawned by `main` before the supervisor so that boot
//! replay completes before any child can accept commands; the supervisor
//! late-binds the notifier into the store once both are up.

use std::sync::Arc;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};

use crate::actors::{
    EventStoreMsg, NotifierActor, NotifierArguments, NotifierMsg, OrchestratorActor,
    OrchestratorArguments, OrchestratorMsg,
};
use crate::builders::BuilderRegistry;
use crate::config::Config;
use crate::context::ContextLookup;
use crate::prompts::PromptWorkspace;

#[derive(Debug, Default)]
pub struct ApplicationSupervisor;

pub struct SupervisorArguments {
    pub event_store: ActorRef<EventStoreMsg>,
    pub prompts: Arc<PromptWorkspace>,
    pub registry: Arc<BuilderRegistry>,
    pub context: Arc<dyn ContextLookup>,
    pub config: Config,
}

pub struct SupervisorState {
    pub orchestrator: ActorRef<OrchestratorMsg>,
    pub notifier: ActorRef<NotifierMsg>,
    pub actor_started: u64,
    pub actor_failed: u64,
    pub actor_terminated: u64,
    pub last_failure: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SupervisorHealth {
    pub orchestrator_alive: bool,
    pub notifier_alive: bool,
    pub actor_started: u64,
    pub actor_failed: u64,
    pub actor_terminated: u64,
    pub last_failure: Option<String>,
}

pub enum SupervisorMsg {
    /// Child actor refs for wiring the fan-out layer.
    GetRefs {
        reply: RpcReplyPort<(ActorRef<OrchestratorMsg>, ActorRef<NotifierMsg>)>,
    },
    GetHealth { reply: RpcReplyPort<SupervisorHealth> },
}

impl std::fmt::Debug for SupervisorMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SupervisorMsg::GetRefs { .. } => "GetRefs",
            SupervisorMsg::GetHealth { .. } => "GetHealth",
        };
        f.write_str(name)
    }
}

#[async_trait]
impl Actor for ApplicationSupervisor {
    type Msg = SupervisorMsg;
    type State = SupervisorState;
    type Arguments = SupervisorArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(supervisor = %myself.get_id(), "ApplicationSupervisor starting");

        let (notifier, _) = Actor::spawn_linked(
            None,
            NotifierActor,
            NotifierArguments { coalesce_window: args.config.coalesce_window },
            myself.get_cell(),
        )
        .await
        .map_err(|e| ActorProcessingErr::from(format!("failed to spawn notifier: {e}")))?;

        args.event_store
            .cast(EventStoreMsg::SetNotifier { notifier: notifier.clone() })
            .map_err(|e| ActorProcessingErr::from(format!("failed to bind notifier: {e}")))?;

        let (orchestrator, _) = Actor::spawn_linked(
            None,
            OrchestratorActor,
            OrchestratorArguments {
                event_store: args.event_store.clone(),
                prompts: args.prompts,
                registry: args.registry,
                context: args.context,
                timeouts: args.config.timeouts.clone(),
            },
            myself.get_cell(),
        )
        .await
        .map_err(|e| ActorProcessingErr::from(format!("failed to spawn orchestrator: {e}")))?;

        Ok(SupervisorState {
            orchestrator,
            notifier,
            actor_started: 0,
            actor_failed: 0,
            actor_terminated: 0,
            last_failure: None,
        })
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        event: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match &event {
            SupervisionEvent::ActorStarted(_) => state.actor_started += 1,
            SupervisionEvent::ActorFailed(cell, failure) => {
                state.actor_failed += 1;
                state.last_failure = Some(format!("actor_id={} error={failure}", cell.get_id()));
                tracing::error!(
                    supervisor = %myself.get_id(),
                    actor_id = %cell.get_id(),
                    error = %failure,
                    "Supervised actor failed"
                );
            }
            SupervisionEvent::ActorTerminated(cell, _, _) => {
                state.actor_terminated += 1;
                tracing::info!(
                    supervisor = %myself.get_id(),
                    actor_id = %cell.get_id(),
                    "Supervised actor terminated"
                );
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMsg::GetRefs { reply } => {
                let _ = reply.send((state.orchestrator.clone(), state.notifier.clone()));
            }
            SupervisorMsg::GetHealth { reply } => {
                let _ = reply.send(SupervisorHealth {
                    orchestrator_alive: state.orchestrator.get_status()
                        == ractor::ActorStatus::Running,
                    notifier_alive: state.notifier.get_status() == ractor::ActorStatus::Running,
                    actor_started: state.actor_started,
                    actor_failed: state.actor_failed,
                    actor_terminated: state.actor_terminated,
                    last_failure: state.last_failure.clone(),
                });
            }
        }
        Ok(())
    }
}
