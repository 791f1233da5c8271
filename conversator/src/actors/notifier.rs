//! NotifierActor - backpressure-aware delivery hints for the inbox.
//!
//! The event store creates inbox items transactionally with their events and
//! hands unread ones to this actor. The voice layer polls at natural pauses:
//! blocking (and warning/error) items are marked deliver-immediately and stay
//! pending until acknowledged, so an unanswered gate keeps resurfacing;
//! info/success items coalesce per task into a single "N updates on task X"
//! digest once the coalescing window has elapsed.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde::Serialize;

use shared_types::{InboxItem, InboxSeverity};

use super::projection::delivery_order;

#[derive(Debug, Clone)]
pub struct NotifierArguments {
    pub coalesce_window: std::time::Duration,
}

pub struct NotifierState {
    coalesce_window: ChronoDuration,
    /// Unacknowledged notifying items, keyed by inbox id.
    pending: HashMap<String, InboxItem>,
}

#[derive(Debug)]
pub enum NotifierMsg {
    ItemCreated { item: InboxItem },
    Acknowledged { ids: Vec<String> },
    PollPending { reply: RpcReplyPort<DeliveryHints> },
}

/// One coalesced per-task hint.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDigest {
    pub task_id: String,
    pub count: usize,
    pub latest_summary: String,
    pub inbox_ids: Vec<String>,
    pub window_started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryHints {
    /// Deliver now, blocking first. Items remain pending until acknowledged.
    pub immediate: Vec<InboxItem>,
    /// Per-task digests whose coalescing window has elapsed.
    pub digests: Vec<TaskDigest>,
}

#[derive(Debug, Default)]
pub struct NotifierActor;

#[async_trait]
impl Actor for NotifierActor {
    type Msg = NotifierMsg;
    type State = NotifierState;
    type Arguments = NotifierArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(actor_id = %myself.get_id(), "NotifierActor starting");
        let window = ChronoDuration::from_std(args.coalesce_window)
            .unwrap_or_else(|_| ChronoDuration::seconds(10));
        Ok(NotifierState { coalesce_window: window, pending: HashMap::new() })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            NotifierMsg::ItemCreated { item } => {
                state.pending.insert(item.inbox_id.clone(), item);
            }
            NotifierMsg::Acknowledged { ids } => {
                for id in ids {
                    state.pending.remove(&id);
                }
            }
            NotifierMsg::PollPending { reply } => {
                let _ = reply.send(compute_hints(state));
            }
        }
        Ok(())
    }
}

fn compute_hints(state: &NotifierState) -> DeliveryHints {
    let now = Utc::now();

    let mut immediate: Vec<InboxItem> = state
        .pending
        .values()
        .filter(|item| item.severity >= InboxSeverity::Warning)
        .cloned()
        .collect();
    immediate.sort_by(delivery_order);

    // Group info/success by task; tasks without an id coalesce together.
    let mut groups: HashMap<String, Vec<&InboxItem>> = HashMap::new();
    for item in state.pending.values() {
        if item.severity >= InboxSeverity::Warning {
            continue;
        }
        let key = item.task_id.clone().unwrap_or_default();
        groups.entry(key).or_default().push(item);
    }

    let mut digests = Vec::new();
    for (task_id, mut items) in groups {
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let oldest = items[0].created_at;
        if now.signed_duration_since(oldest) < state.coalesce_window {
            continue;
        }
        digests.push(TaskDigest {
            task_id,
            count: items.len(),
            latest_summary: items.last().map(|i| i.summary.clone()).unwrap_or_default(),
            inbox_ids: items.iter().map(|i| i.inbox_id.clone()).collect(),
            window_started_at: oldest,
        });
    }
    digests.sort_by(|a, b| a.window_started_at.cmp(&b.window_started_at));

    DeliveryHints { immediate, digests }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ractor::Actor;

    fn item(id: &str, severity: InboxSeverity, task: Option<&str>, age_secs: i64) -> InboxItem {
        InboxItem {
            inbox_id: id.to_string(),
            severity,
            summary: format!("summary {id}"),
            detail: None,
            task_id: task.map(str::to_string),
            event_seq: 1,
            created_at: Utc::now() - ChronoDuration::seconds(age_secs),
            read_at: None,
        }
    }

    async fn spawn_notifier(window_secs: u64) -> ActorRef<NotifierMsg> {
        let (notifier, _) = Actor::spawn(
            None,
            NotifierActor,
            NotifierArguments { coalesce_window: std::time::Duration::from_secs(window_secs) },
        )
        .await
        .unwrap();
        notifier
    }

    #[tokio::test]
    async fn blocking_items_deliver_immediately_and_persist_until_acked() {
        let notifier = spawn_notifier(10).await;

        notifier
            .cast(NotifierMsg::ItemCreated {
                item: item("gate", InboxSeverity::Blocking, Some("t1"), 0),
            })
            .unwrap();

        let hints = ractor::call!(notifier, |reply| NotifierMsg::PollPending { reply }).unwrap();
        assert_eq!(hints.immediate.len(), 1);
        assert_eq!(hints.immediate[0].inbox_id, "gate");

        // Unacknowledged blocking items keep resurfacing.
        let again = ractor::call!(notifier, |reply| NotifierMsg::PollPending { reply }).unwrap();
        assert_eq!(again.immediate.len(), 1);

        notifier.cast(NotifierMsg::Acknowledged { ids: vec!["gate".to_string()] }).unwrap();
        let cleared = ractor::call!(notifier, |reply| NotifierMsg::PollPending { reply }).unwrap();
        assert!(cleared.immediate.is_empty());

        notifier.stop(None);
    }

    #[tokio::test]
    async fn info_items_coalesce_per_task_after_window() {
        let notifier = spawn_notifier(5).await;

        // Three aged info items on one task, one fresh item on another.
        for (id, age) in [("a", 30), ("b", 20), ("c", 10)] {
            notifier
                .cast(NotifierMsg::ItemCreated {
                    item: item(id, InboxSeverity::Info, Some("t1"), age),
                })
                .unwrap();
        }
        notifier
            .cast(NotifierMsg::ItemCreated {
                item: item("fresh", InboxSeverity::Success, Some("t2"), 0),
            })
            .unwrap();

        let hints = ractor::call!(notifier, |reply| NotifierMsg::PollPending { reply }).unwrap();
        assert!(hints.immediate.is_empty());
        assert_eq!(hints.digests.len(), 1, "fresh window must not flush yet");
        let digest = &hints.digests[0];
        assert_eq!(digest.task_id, "t1");
        assert_eq!(digest.count, 3);
        assert_eq!(digest.latest_summary, "summary c");
        assert_eq!(digest.inbox_ids, vec!["a", "b", "c"]);

        notifier.stop(None);
    }

    #[tokio::test]
    async fn blocking_sorts_ahead_of_older_errors() {
        let notifier = spawn_notifier(10).await;
        notifier
            .cast(NotifierMsg::ItemCreated {
                item: item("old-error", InboxSeverity::Error, Some("t1"), 60),
            })
            .unwrap();
        notifier
            .cast(NotifierMsg::ItemCreated {
                item: item("new-gate", InboxSeverity::Blocking, Some("t2"), 0),
            })
            .unwrap();

        let hints = ractor::call!(notifier, |reply| NotifierMsg::PollPending { reply }).unwrap();
        assert_eq!(hints.immediate[0].inbox_id, "new-gate");
        assert_eq!(hints.immediate[1].inbox_id, "old-error");

        notifier.stop(None);
    }
}
