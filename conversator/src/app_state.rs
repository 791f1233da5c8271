//! Shared handle over the actor system for the fan-out layer.

use std::sync::Arc;

use ractor::ActorRef;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::actors::{CommandError, EventStoreMsg, NotifierMsg, OrchestratorMsg};
use crate::builders::BuilderRegistry;
use crate::conversation::ConversationLog;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    event_store: ActorRef<EventStoreMsg>,
    orchestrator: ActorRef<OrchestratorMsg>,
    notifier: ActorRef<NotifierMsg>,
    registry: Arc<BuilderRegistry>,
    conversation: Arc<ConversationLog>,
    /// Admission control for write commands; exhausted permits mean Busy.
    command_gate: Arc<Semaphore>,
}

impl AppState {
    pub fn new(
        event_store: ActorRef<EventStoreMsg>,
        orchestrator: ActorRef<OrchestratorMsg>,
        notifier: ActorRef<NotifierMsg>,
        registry: Arc<BuilderRegistry>,
        conversation: Arc<ConversationLog>,
        command_queue_depth: usize,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                event_store,
                orchestrator,
                notifier,
                registry,
                conversation,
                command_gate: Arc::new(Semaphore::new(command_queue_depth.max(1))),
            }),
        }
    }

    pub fn event_store(&self) -> ActorRef<EventStoreMsg> {
        self.inner.event_store.clone()
    }

    pub fn orchestrator(&self) -> ActorRef<OrchestratorMsg> {
        self.inner.orchestrator.clone()
    }

    pub fn notifier(&self) -> ActorRef<NotifierMsg> {
        self.inner.notifier.clone()
    }

    pub fn registry(&self) -> Arc<BuilderRegistry> {
        self.inner.registry.clone()
    }

    pub fn conversation(&self) -> Arc<ConversationLog> {
        self.inner.conversation.clone()
    }

    /// Admit a write command, or reject with Busy above the high-water mark.
    pub fn command_permit(&self) -> Result<OwnedSemaphorePermit, CommandError> {
        self.inner
            .command_gate
            .clone()
            .try_acquire_owned()
            .map_err(|_| CommandError::Busy)
    }
}
