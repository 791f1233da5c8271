//! BuilderSessionActor - consumer for one live remote builder session.
//!
//! Owns the upstream event stream for exactly one session and forwards
//! translated frames to the orchestrator as observations; it never mutates
//! derived state itself. Handles stream reconnects with exponential backoff
//! (an idle timeout counts as one reconnect attempt), marks the session lost
//! once the reconnect budget for the window is exhausted, and drives the
//! cooperative abort handshake.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::time::Instant;

use shared_types::{ArtifactRef, RemoteSessionStatus};

use crate::builders::{BuilderAdapter, RemoteEvent};
use crate::config::TimeoutPolicy;

use super::orchestrator::{OrchestratorMsg, RemoteObservation};

/// How long a finished consumer lingers before stopping, letting trailing
/// artifact frames drain.
const STOP_GRACE: Duration = Duration::from_secs(2);

pub struct BuilderSessionArgs {
    pub task_id: String,
    pub session_id: String,
    pub adapter: Arc<dyn BuilderAdapter>,
    pub orchestrator: ActorRef<OrchestratorMsg>,
    pub timeouts: TimeoutPolicy,
}

#[derive(Debug)]
pub enum BuilderSessionMsg {
    Frame(RemoteEvent),
    StreamClosed { error: Option<String> },
    /// Reconnect after backoff, scheduled by a StreamClosed handler.
    Reconnect,
    ResolveGate { gate_id: String, approve: bool },
    Abort,
    AbortTimeout,
    Stop,
}

pub struct BuilderSessionState {
    task_id: String,
    session_id: String,
    adapter: Arc<dyn BuilderAdapter>,
    orchestrator: ActorRef<OrchestratorMsg>,
    timeouts: TimeoutPolicy,
    /// Artifacts streamed ahead of the terminal frame.
    artifacts: Vec<ArtifactRef>,
    backoff: Duration,
    reconnects_in_window: u32,
    window_start: Instant,
    aborting: bool,
    finished: bool,
}

#[derive(Debug, Default)]
pub struct BuilderSessionActor;

#[async_trait]
impl Actor for BuilderSessionActor {
    type Msg = BuilderSessionMsg;
    type State = BuilderSessionState;
    type Arguments = BuilderSessionArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            task_id = %args.task_id,
            session_id = %args.session_id,
            "BuilderSessionActor starting"
        );

        spawn_reader(
            myself,
            args.adapter.clone(),
            args.session_id.clone(),
            args.timeouts.stream_idle,
        );

        Ok(BuilderSessionState {
            task_id: args.task_id,
            session_id: args.session_id,
            adapter: args.adapter,
            orchestrator: args.orchestrator,
            backoff: args.timeouts.reconnect_base,
            timeouts: args.timeouts,
            artifacts: Vec::new(),
            reconnects_in_window: 0,
            window_start: Instant::now(),
            aborting: false,
            finished: false,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            BuilderSessionMsg::Frame(frame) => self.handle_frame(&myself, frame, state),
            BuilderSessionMsg::StreamClosed { error } => {
                self.handle_stream_closed(&myself, error, state)
            }
            BuilderSessionMsg::Reconnect => {
                if !state.finished {
                    spawn_reader(
                        myself,
                        state.adapter.clone(),
                        state.session_id.clone(),
                        state.timeouts.stream_idle,
                    );
                }
            }
            BuilderSessionMsg::ResolveGate { gate_id, approve } => {
                if let Err(e) =
                    state.adapter.resolve_gate(&state.session_id, &gate_id, approve).await
                {
                    tracing::warn!(
                        task_id = %state.task_id,
                        gate_id = %gate_id,
                        error = %e,
                        "Failed to forward gate decision to remote"
                    );
                }
            }
            BuilderSessionMsg::Abort => self.handle_abort(&myself, state).await,
            BuilderSessionMsg::AbortTimeout => {
                if state.aborting && !state.finished {
                    tracing::warn!(
                        task_id = %state.task_id,
                        session_id = %state.session_id,
                        "Remote abort unconfirmed within deadline; marking session aborted"
                    );
                    state.finished = true;
                    let _ = state.orchestrator.cast(OrchestratorMsg::AbortResolved {
                        task_id: state.task_id.clone(),
                        confirmed: false,
                    });
                    myself.stop(None);
                }
            }
            BuilderSessionMsg::Stop => myself.stop(None),
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let _ = state.orchestrator.cast(OrchestratorMsg::SessionStopped {
            task_id: state.task_id.clone(),
        });
        Ok(())
    }
}

impl BuilderSessionActor {
    fn observe(&self, state: &BuilderSessionState, observation: RemoteObservation) {
        let _ = state.orchestrator.cast(OrchestratorMsg::Observe {
            task_id: state.task_id.clone(),
            session_id: state.session_id.clone(),
            observation,
        });
    }

    fn finish(&self, myself: &ActorRef<BuilderSessionMsg>, state: &mut BuilderSessionState) {
        state.finished = true;
        let myself = myself.clone();
        tokio::spawn(async move {
            tokio::time::sleep(STOP_GRACE).await;
            let _ = myself.cast(BuilderSessionMsg::Stop);
        });
    }

    fn handle_frame(
        &self,
        myself: &ActorRef<BuilderSessionMsg>,
        frame: RemoteEvent,
        state: &mut BuilderSessionState,
    ) {
        // A healthy frame resets the reconnect budget.
        state.backoff = state.timeouts.reconnect_base;
        state.reconnects_in_window = 0;
        state.window_start = Instant::now();

        if state.finished {
            return;
        }

        match frame {
            RemoteEvent::Artifact { kind, path } => {
                state.artifacts.push(crate::builders::opencode::artifact_ref(&kind, &path));
            }
            RemoteEvent::Status { status } => {
                if state.aborting && status == RemoteSessionStatus::Aborted {
                    state.finished = true;
                    let _ = state.orchestrator.cast(OrchestratorMsg::AbortResolved {
                        task_id: state.task_id.clone(),
                        confirmed: true,
                    });
                    myself.stop(None);
                    return;
                }
                self.observe(state, RemoteObservation::Status(status));
            }
            RemoteEvent::Gate { gate_id, kind, description, files } => {
                self.observe(state, RemoteObservation::Gate { gate_id, kind, description, files });
            }
            RemoteEvent::Completed { artifacts } => {
                let mut merged = std::mem::take(&mut state.artifacts);
                merged.extend(artifacts);
                self.observe(state, RemoteObservation::Completed { artifacts: merged });
                self.finish(myself, state);
            }
            RemoteEvent::Failed { reason } => {
                self.observe(state, RemoteObservation::Failed { reason });
                self.finish(myself, state);
            }
        }
    }

    fn handle_stream_closed(
        &self,
        myself: &ActorRef<BuilderSessionMsg>,
        error: Option<String>,
        state: &mut BuilderSessionState,
    ) {
        if state.finished {
            return;
        }
        if state.aborting {
            // The stream ending is the remote's way of confirming the abort.
            state.finished = true;
            let _ = state.orchestrator.cast(OrchestratorMsg::AbortResolved {
                task_id: state.task_id.clone(),
                confirmed: true,
            });
            myself.stop(None);
            return;
        }

        if state.window_start.elapsed() > state.timeouts.reconnect_window {
            state.reconnects_in_window = 0;
            state.window_start = Instant::now();
        }
        state.reconnects_in_window += 1;

        if state.reconnects_in_window > state.timeouts.max_reconnects_per_window {
            let reason = error.unwrap_or_else(|| "stream closed".to_string());
            tracing::error!(
                task_id = %state.task_id,
                session_id = %state.session_id,
                reconnects = state.reconnects_in_window,
                "Reconnect budget exhausted; marking session lost"
            );
            self.observe(
                state,
                RemoteObservation::Lost {
                    reason: format!("reconnect budget exhausted: {reason}"),
                },
            );
            self.finish(myself, state);
            return;
        }

        let backoff = state.backoff;
        state.backoff = (state.backoff * 2).min(state.timeouts.reconnect_cap);
        tracing::warn!(
            task_id = %state.task_id,
            session_id = %state.session_id,
            error = %error.unwrap_or_else(|| "stream ended".to_string()),
            backoff_ms = backoff.as_millis() as u64,
            attempt = state.reconnects_in_window,
            "Builder stream closed; scheduling reconnect"
        );

        let myself = myself.clone();
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = myself.cast(BuilderSessionMsg::Reconnect);
        });
    }

    async fn handle_abort(
        &self,
        myself: &ActorRef<BuilderSessionMsg>,
        state: &mut BuilderSessionState,
    ) {
        if state.aborting || state.finished {
            return;
        }
        state.aborting = true;

        let mut sent = false;
        for attempt in 1..=state.timeouts.abort_retries {
            match state.adapter.abort(&state.session_id).await {
                Ok(()) => {
                    sent = true;
                    break;
                }
                Err(e) if e.is_retryable() && attempt < state.timeouts.abort_retries => {
                    tracing::warn!(
                        session_id = %state.session_id,
                        attempt,
                        error = %e,
                        "Abort attempt failed; retrying"
                    );
                }
                Err(e) => {
                    tracing::warn!(session_id = %state.session_id, error = %e, "Abort failed");
                    break;
                }
            }
        }

        if !sent {
            // The remote never took the abort; do not wait for confirmation.
            state.finished = true;
            let _ = state.orchestrator.cast(OrchestratorMsg::AbortResolved {
                task_id: state.task_id.clone(),
                confirmed: false,
            });
            myself.stop(None);
            return;
        }

        let deadline = state.timeouts.abort_confirm;
        let myself = myself.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = myself.cast(BuilderSessionMsg::AbortTimeout);
        });
    }
}

/// Pump the remote stream into the actor mailbox. Exits when the stream
/// ends, errors, goes idle past the timeout, or the actor is gone.
fn spawn_reader(
    myself: ActorRef<BuilderSessionMsg>,
    adapter: Arc<dyn BuilderAdapter>,
    session_id: String,
    idle_timeout: Duration,
) {
    tokio::spawn(async move {
        let mut rx = match adapter.stream_events(&session_id).await {
            Ok(rx) => rx,
            Err(e) => {
                let _ = myself.cast(BuilderSessionMsg::StreamClosed { error: Some(e.to_string()) });
                return;
            }
        };

        loop {
            match tokio::time::timeout(idle_timeout, rx.recv()).await {
                Ok(Some(Ok(frame))) => {
                    if myself.cast(BuilderSessionMsg::Frame(frame)).is_err() {
                        return;
                    }
                }
                Ok(Some(Err(e))) => {
                    let _ = myself
                        .cast(BuilderSessionMsg::StreamClosed { error: Some(e.to_string()) });
                    return;
                }
                Ok(None) => {
                    let _ = myself.cast(BuilderSessionMsg::StreamClosed { error: None });
                    return;
                }
                Err(_) => {
                    let _ = myself.cast(BuilderSessionMsg::StreamClosed {
                        error: Some("stream idle timeout".to_string()),
                    });
                    return;
                }
            }
        }
    });
}
