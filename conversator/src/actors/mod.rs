//! Actors composing the control plane.
//!
//! Message passing is the only coordination: the event store actor is the
//! single writer for all durable state, the orchestrator owns the command
//! surface, builder-session consumers feed remote observations back through
//! the orchestrator, and the notifier shapes inbox delivery.

pub mod builder_session;
pub mod event_store;
pub mod notifier;
pub mod orchestrator;
pub mod projection;

pub use builder_session::{BuilderSessionActor, BuilderSessionArgs, BuilderSessionMsg};
pub use event_store::{
    append_event, snapshot, subscribe, AppendEvent, AppendOutcome, EventStoreActor,
    EventStoreArguments, EventStoreError, EventStoreMsg, StoredEvent,
};
pub use notifier::{DeliveryHints, NotifierActor, NotifierArguments, NotifierMsg, TaskDigest};
pub use orchestrator::{
    CommandError, DispatchOutcome, HandoffPaths, OrchestratorActor, OrchestratorArguments,
    OrchestratorMsg, RemoteObservation,
};
