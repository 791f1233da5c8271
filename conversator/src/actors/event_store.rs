//! EventStoreActor - append-only domain event log and derived state
//!
//! Single-writer discipline: every state mutation in the system goes through
//! this actor's `Append` handler, which validates the proposed event against
//! derived state, assigns the next gap-free `seq`, persists the event (and
//! any derived inbox item) in one transaction, applies it to derived state,
//! and fans it out to subscribers - in that order. Because the actor mailbox
//! serializes handlers, every subscriber observes the same total order.
//!
//! Uses libsql for SQLite persistence; supports file-based and in-memory
//! databases (the latter for tests).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::Connection;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use tokio::sync::mpsc;

use shared_types::{
    next_status, BuilderSession, Event, EventRefs, EventType, GateRequestedPayload, InboxItem,
    InboxSeverity, Snapshot, Task, TaskStatus, TransitionError,
};

use super::notifier::NotifierMsg;
use super::projection::{self, DerivedState};

/// Consecutive persistence failures before the store refuses writes.
const MAX_IO_FAILURES: u32 = 3;

/// Queue depth granted to each subscriber beyond its replay backlog. A
/// subscriber that falls this far behind the live tail is dropped.
const SUBSCRIBER_LAG_BUDGET: usize = 1024;

/// Actor that owns the event log and all derived state.
#[derive(Debug, Default)]
pub struct EventStoreActor;

#[derive(Debug, Clone)]
pub enum EventStoreArguments {
    /// File-based database path.
    File(String),
    /// In-memory database (for testing).
    InMemory,
}

pub struct EventStoreState {
    conn: Connection,
    next_seq: i64,
    derived: DerivedState,
    subscribers: Vec<Subscriber>,
    notifier: Option<ActorRef<NotifierMsg>>,
    io_failures: u32,
    read_only: bool,
    next_subscriber_id: u64,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<StoredEvent>,
}

/// What subscribers receive: the committed event plus the inbox item (if
/// any) that was persisted in the same transaction.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub event: Event,
    pub inbox: Option<InboxItem>,
}

/// A proposed event, before seq assignment.
#[derive(Debug, Clone)]
pub struct AppendEvent {
    pub event_type: EventType,
    pub task_id: Option<String>,
    pub refs: Option<EventRefs>,
    pub payload: serde_json::Value,
    /// Client-supplied idempotency key. A repeat append with the same key
    /// returns the original event and persists nothing.
    pub command_id: Option<String>,
}

impl AppendEvent {
    pub fn new(
        event_type: EventType,
        task_id: impl Into<Option<String>>,
        payload: impl serde::Serialize,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_type,
            task_id: task_id.into(),
            refs: None,
            payload: serde_json::to_value(payload)?,
            command_id: None,
        })
    }

    pub fn with_refs(mut self, refs: EventRefs) -> Self {
        if !refs.is_empty() {
            self.refs = Some(refs);
        }
        self
    }

    pub fn with_command_id(mut self, command_id: Option<String>) -> Self {
        self.command_id = command_id;
        self
    }
}

#[derive(Debug, Clone)]
pub enum AppendOutcome {
    Appended(Event),
    /// The idempotency key (or an at-most-once rule) matched a prior event;
    /// nothing was persisted. Retryable as a no-op.
    Duplicate(Event),
}

impl AppendOutcome {
    pub fn event(&self) -> &Event {
        match self {
            AppendOutcome::Appended(e) | AppendOutcome::Duplicate(e) => e,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EventStoreError {
    /// Impossible state transition or conflicting write. Not retryable
    /// without re-reading current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Caller referenced unknown state or supplied a malformed event.
    #[error("validation: {0}")]
    Validation(String),

    /// The store is in degraded read-only mode after repeated persistence
    /// failures; writes are refused until the operator intervenes.
    #[error("event store is read-only after repeated persistence failures")]
    ReadOnly,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<libsql::Error> for EventStoreError {
    fn from(e: libsql::Error) -> Self {
        EventStoreError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for EventStoreError {
    fn from(e: serde_json::Error) -> Self {
        EventStoreError::Serialization(e.to_string())
    }
}

// ============================================================================
// Messages
// ============================================================================

pub enum EventStoreMsg {
    /// Validate, persist, project, and publish one event.
    Append {
        event: AppendEvent,
        reply: RpcReplyPort<Result<AppendOutcome, EventStoreError>>,
    },
    /// Consistent point-in-time view of derived state.
    Snapshot { reply: RpcReplyPort<Snapshot> },
    /// Ordered replay from `from_seq` (exclusive), then live tail.
    Subscribe {
        from_seq: i64,
        reply: RpcReplyPort<Result<mpsc::Receiver<StoredEvent>, EventStoreError>>,
    },
    GetEvents {
        task_id: Option<String>,
        since_seq: i64,
        limit: i64,
        reply: RpcReplyPort<Result<Vec<Event>, EventStoreError>>,
    },
    GetTask {
        task_id: String,
        reply: RpcReplyPort<Option<Task>>,
    },
    ListTasks {
        status: Option<TaskStatus>,
        reply: RpcReplyPort<Vec<Task>>,
    },
    ListSessions { reply: RpcReplyPort<Vec<BuilderSession>> },
    GetSession {
        session_id: String,
        reply: RpcReplyPort<Option<BuilderSession>>,
    },
    PendingGate {
        task_id: String,
        reply: RpcReplyPort<Option<GateRequestedPayload>>,
    },
    ListInbox {
        unread_only: bool,
        severity: Option<InboxSeverity>,
        limit: usize,
        reply: RpcReplyPort<Vec<InboxItem>>,
    },
    UnreadCount { reply: RpcReplyPort<usize> },
    /// Mark items read. `None` acknowledges everything unread.
    AcknowledgeInbox {
        ids: Option<Vec<String>>,
        reply: RpcReplyPort<Result<usize, EventStoreError>>,
    },
    /// Late-bind the notifier once it has been spawned.
    SetNotifier { notifier: ActorRef<NotifierMsg> },
}

impl std::fmt::Debug for EventStoreMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventStoreMsg::Append { .. } => "Append",
            EventStoreMsg::Snapshot { .. } => "Snapshot",
            EventStoreMsg::Subscribe { .. } => "Subscribe",
            EventStoreMsg::GetEvents { .. } => "GetEvents",
            EventStoreMsg::GetTask { .. } => "GetTask",
            EventStoreMsg::ListTasks { .. } => "ListTasks",
            EventStoreMsg::ListSessions { .. } => "ListSessions",
            EventStoreMsg::GetSession { .. } => "GetSession",
            EventStoreMsg::PendingGate { .. } => "PendingGate",
            EventStoreMsg::ListInbox { .. } => "ListInbox",
            EventStoreMsg::UnreadCount { .. } => "UnreadCount",
            EventStoreMsg::AcknowledgeInbox { .. } => "AcknowledgeInbox",
            EventStoreMsg::SetNotifier { .. } => "SetNotifier",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Actor
// ============================================================================

#[async_trait]
impl Actor for EventStoreActor {
    type Msg = EventStoreMsg;
    type State = EventStoreState;
    type Arguments = EventStoreArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let path = match &args {
            EventStoreArguments::File(path) => {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    std::fs::create_dir_all(parent).ok();
                }
                path.clone()
            }
            EventStoreArguments::InMemory => ":memory:".to_string(),
        };

        tracing::info!(actor_id = %myself.get_id(), database_path = %path, "EventStoreActor starting");

        let db = libsql::Builder::new_local(&path)
            .build()
            .await
            .map_err(|e| ActorProcessingErr::from(format!("failed to open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| ActorProcessingErr::from(format!("failed to connect: {e}")))?;

        run_migrations(&conn)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("migration failed: {e}")))?;

        let (derived, next_seq) = boot_replay(&conn)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("boot replay failed: {e}")))?;

        tracing::info!(
            last_seq = derived.last_seq,
            tasks = derived.tasks.len(),
            sessions = derived.sessions.len(),
            "Event log replayed"
        );

        Ok(EventStoreState {
            conn,
            next_seq,
            derived,
            subscribers: Vec::new(),
            notifier: None,
            io_failures: 0,
            read_only: false,
            next_subscriber_id: 0,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            EventStoreMsg::Append { event, reply } => {
                let result = self.handle_append(event, state).await;
                let _ = reply.send(result);
            }
            EventStoreMsg::Snapshot { reply } => {
                let _ = reply.send(state.derived.snapshot());
            }
            EventStoreMsg::Subscribe { from_seq, reply } => {
                let result = self.handle_subscribe(from_seq, state).await;
                let _ = reply.send(result);
            }
            EventStoreMsg::GetEvents { task_id, since_seq, limit, reply } => {
                let result = load_events(&state.conn, task_id.as_deref(), since_seq, limit).await;
                let _ = reply.send(result);
            }
            EventStoreMsg::GetTask { task_id, reply } => {
                let _ = reply.send(state.derived.tasks.get(&task_id).cloned());
            }
            EventStoreMsg::ListTasks { status, reply } => {
                let mut tasks: Vec<Task> = state
                    .derived
                    .tasks
                    .values()
                    .filter(|t| status.map_or(true, |s| t.status == s))
                    .cloned()
                    .collect();
                tasks.sort_by(|a, b| {
                    b.priority
                        .cmp(&a.priority)
                        .then(b.updated_at.cmp(&a.updated_at))
                        .then(a.task_id.cmp(&b.task_id))
                });
                let _ = reply.send(tasks);
            }
            EventStoreMsg::ListSessions { reply } => {
                let mut sessions: Vec<BuilderSession> =
                    state.derived.sessions.values().cloned().collect();
                sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
                let _ = reply.send(sessions);
            }
            EventStoreMsg::GetSession { session_id, reply } => {
                let _ = reply.send(state.derived.sessions.get(&session_id).cloned());
            }
            EventStoreMsg::PendingGate { task_id, reply } => {
                let _ = reply.send(state.derived.pending_gates.get(&task_id).cloned());
            }
            EventStoreMsg::ListInbox { unread_only, severity, limit, reply } => {
                let mut items: Vec<InboxItem> = state
                    .derived
                    .inbox
                    .iter()
                    .filter(|i| !unread_only || i.read_at.is_none())
                    .filter(|i| severity.map_or(true, |s| i.severity == s))
                    .cloned()
                    .collect();
                items.sort_by(|a, b| {
                    b.created_at.cmp(&a.created_at).then(b.event_seq.cmp(&a.event_seq))
                });
                items.truncate(limit);
                let _ = reply.send(items);
            }
            EventStoreMsg::UnreadCount { reply } => {
                let count = state.derived.inbox.iter().filter(|i| i.read_at.is_none()).count();
                let _ = reply.send(count);
            }
            EventStoreMsg::AcknowledgeInbox { ids, reply } => {
                let result = self.handle_acknowledge(ids, state).await;
                let _ = reply.send(result);
            }
            EventStoreMsg::SetNotifier { notifier } => {
                // Hand the notifier the current unread backlog so reminders
                // survive restarts.
                for item in state.derived.inbox.iter().filter(|i| i.read_at.is_none()) {
                    let _ = notifier.cast(NotifierMsg::ItemCreated { item: item.clone() });
                }
                state.notifier = Some(notifier);
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!(actor_id = %myself.get_id(), "EventStoreActor stopped");
        Ok(())
    }
}

// ============================================================================
// Append path
// ============================================================================

impl EventStoreActor {
    async fn handle_append(
        &self,
        proposed: AppendEvent,
        state: &mut EventStoreState,
    ) -> Result<AppendOutcome, EventStoreError> {
        if state.read_only {
            return Err(EventStoreError::ReadOnly);
        }

        // Idempotency key check before any validation: a replayed command
        // must observe its original outcome even if state has moved on.
        if let Some(command_id) = &proposed.command_id {
            if let Some(prior) = find_by_command_id(&state.conn, command_id).await? {
                return Ok(AppendOutcome::Duplicate(prior));
            }
        }

        if let Some(duplicate) = self.validate(&proposed, state).await? {
            return Ok(AppendOutcome::Duplicate(duplicate));
        }

        let seq = state.next_seq;
        let event = Event {
            seq,
            time: Utc::now(),
            event_type: proposed.event_type,
            task_id: proposed.task_id.clone(),
            refs: proposed.refs.clone(),
            payload: proposed.payload.clone(),
        };

        let inbox_item =
            projection::inbox_item_for(&event, &state.derived.tasks, ulid::Ulid::new().to_string());

        match persist(&state.conn, &event, proposed.command_id.as_deref(), inbox_item.as_ref())
            .await
        {
            Ok(()) => {
                state.io_failures = 0;
            }
            Err(e) => {
                state.io_failures += 1;
                if state.io_failures >= MAX_IO_FAILURES {
                    tracing::error!(
                        failures = state.io_failures,
                        "Entering degraded read-only mode; writes refused until operator intervenes"
                    );
                    state.read_only = true;
                }
                return Err(e);
            }
        }

        state.next_seq = seq + 1;
        projection::apply(&mut state.derived, &event);
        if let Some(item) = &inbox_item {
            state.derived.inbox.push(item.clone());
            if let Some(notifier) = &state.notifier {
                let _ = notifier.cast(NotifierMsg::ItemCreated { item: item.clone() });
            }
        }

        self.broadcast(state, StoredEvent { event: event.clone(), inbox: inbox_item });

        Ok(AppendOutcome::Appended(event))
    }

    /// Validate a proposed event against derived state. `Ok(Some(event))`
    /// signals an at-most-once rule matched a prior event (idempotent no-op).
    async fn validate(
        &self,
        proposed: &AppendEvent,
        state: &EventStoreState,
    ) -> Result<Option<Event>, EventStoreError> {
        let Some(task_id) = &proposed.task_id else {
            // Task-unscoped events (quick dispatch) have no transition rules.
            return Ok(None);
        };

        let current = state.derived.task_status(task_id);

        match proposed.event_type {
            EventType::TaskCreated => {
                if current.is_some() {
                    return Err(EventStoreError::Conflict(format!(
                        "task {task_id} already exists"
                    )));
                }
            }
            _ => {
                if current.is_none() {
                    return Err(EventStoreError::Validation(format!("unknown task {task_id}")));
                }
            }
        }

        // At-most-once: HandoffFrozen per topic.
        if proposed.event_type == EventType::HandoffFrozen {
            let slug = projection::topic_slug(task_id);
            if state.derived.topics.get(&slug).is_some_and(|t| t.frozen) {
                let prior = find_task_event(&state.conn, task_id, EventType::HandoffFrozen)
                    .await?
                    .ok_or_else(|| {
                        EventStoreError::Storage("frozen topic missing HandoffFrozen event".into())
                    })?;
                return Ok(Some(prior));
            }
        }

        // external_task_id, once set, is never reassigned.
        if proposed.event_type == EventType::ExternalTaskLinked {
            let requested = proposed
                .payload
                .get("external_task_id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    EventStoreError::Validation("ExternalTaskLinked requires external_task_id".into())
                })?;
            if let Some(existing) = state
                .derived
                .tasks
                .get(task_id)
                .and_then(|t| t.external_task_id.as_deref())
            {
                if existing == requested {
                    let prior =
                        find_task_event(&state.conn, task_id, EventType::ExternalTaskLinked)
                            .await?
                            .ok_or_else(|| {
                                EventStoreError::Storage(
                                    "linked task missing ExternalTaskLinked event".into(),
                                )
                            })?;
                    return Ok(Some(prior));
                }
                return Err(EventStoreError::Conflict(format!(
                    "task {task_id} is already linked to {existing}"
                )));
            }
        }

        // At most one in-flight session per task.
        if proposed.event_type == EventType::BuilderDispatched
            && state.derived.inflight_session(task_id).is_some()
        {
            return Err(EventStoreError::Conflict(format!(
                "task {task_id} already has an in-flight builder session"
            )));
        }

        next_status(current, proposed.event_type, &proposed.payload).map_err(|e| match e {
            TransitionError::Terminal { status } => {
                EventStoreError::Conflict(format!("task {task_id} is terminal ({status})"))
            }
            other => EventStoreError::Conflict(other.to_string()),
        })?;

        Ok(None)
    }

    fn broadcast(&self, state: &mut EventStoreState, stored: StoredEvent) {
        state.subscribers.retain(|sub| match sub.tx.try_send(stored.clone()) {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(subscriber = sub.id, "Dropping slow or closed event subscriber");
                false
            }
        });
    }

    async fn handle_subscribe(
        &self,
        from_seq: i64,
        state: &mut EventStoreState,
    ) -> Result<mpsc::Receiver<StoredEvent>, EventStoreError> {
        let backlog = load_events(&state.conn, None, from_seq, i64::MAX).await?;
        let inbox_by_seq = load_inbox_by_seq(&state.conn, from_seq).await?;

        let (tx, rx) = mpsc::channel(backlog.len() + SUBSCRIBER_LAG_BUDGET);
        for event in backlog {
            let inbox = inbox_by_seq.get(&event.seq).cloned();
            // Capacity covers the whole backlog; this cannot fail.
            let _ = tx.try_send(StoredEvent { event, inbox });
        }

        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        state.subscribers.push(Subscriber { id, tx });
        Ok(rx)
    }

    async fn handle_acknowledge(
        &self,
        ids: Option<Vec<String>>,
        state: &mut EventStoreState,
    ) -> Result<usize, EventStoreError> {
        if state.read_only {
            return Err(EventStoreError::ReadOnly);
        }
        let now = Utc::now();
        let now_str = now.to_rfc3339();

        let acknowledged: Vec<String> = match &ids {
            Some(ids) => {
                for id in ids {
                    state
                        .conn
                        .execute(
                            "UPDATE inbox SET read_at = ?1 WHERE inbox_id = ?2 AND read_at IS NULL",
                            libsql::params![now_str.clone(), id.clone()],
                        )
                        .await?;
                }
                ids.clone()
            }
            None => {
                let unread: Vec<String> = state
                    .derived
                    .inbox
                    .iter()
                    .filter(|i| i.read_at.is_none())
                    .map(|i| i.inbox_id.clone())
                    .collect();
                state
                    .conn
                    .execute(
                        "UPDATE inbox SET read_at = ?1 WHERE read_at IS NULL",
                        libsql::params![now_str],
                    )
                    .await?;
                unread
            }
        };

        let mut count = 0;
        for item in state.derived.inbox.iter_mut() {
            if item.read_at.is_none() && acknowledged.contains(&item.inbox_id) {
                item.read_at = Some(now);
                count += 1;
            }
        }

        if let Some(notifier) = &state.notifier {
            let _ = notifier.cast(NotifierMsg::Acknowledged { ids: acknowledged });
        }

        Ok(count)
    }
}

// ============================================================================
// Persistence
// ============================================================================

async fn run_migrations(conn: &Connection) -> Result<(), libsql::Error> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            seq INTEGER PRIMARY KEY,
            event_id TEXT UNIQUE NOT NULL,
            time TEXT NOT NULL,
            event_type TEXT NOT NULL,
            task_id TEXT,
            refs TEXT,
            payload TEXT NOT NULL,
            command_id TEXT UNIQUE
        )
        "#,
        (),
    )
    .await?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_events_task ON events(task_id)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type)", ()).await?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS inbox (
            inbox_id TEXT PRIMARY KEY,
            severity TEXT NOT NULL,
            summary TEXT NOT NULL,
            detail TEXT,
            task_id TEXT,
            event_seq INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            read_at TEXT
        )
        "#,
        (),
    )
    .await?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_inbox_read ON inbox(read_at)", ()).await?;

    Ok(())
}

/// Persist an event and its derived inbox item atomically. A crash between
/// the two writes can never surface: both land or neither does.
async fn persist(
    conn: &Connection,
    event: &Event,
    command_id: Option<&str>,
    inbox: Option<&InboxItem>,
) -> Result<(), EventStoreError> {
    let refs_json = match &event.refs {
        Some(refs) => Some(serde_json::to_string(refs)?),
        None => None,
    };
    let payload_json = serde_json::to_string(&event.payload)?;
    let event_id = ulid::Ulid::new().to_string();

    conn.execute("BEGIN", ()).await?;

    let result: Result<(), EventStoreError> = async {
        conn.execute(
            r#"
            INSERT INTO events (seq, event_id, time, event_type, task_id, refs, payload, command_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            libsql::params![
                event.seq,
                event_id,
                event.time.to_rfc3339(),
                event.event_type.as_str(),
                event.task_id.clone(),
                refs_json,
                payload_json,
                command_id.map(str::to_string),
            ],
        )
        .await?;

        if let Some(item) = inbox {
            conn.execute(
                r#"
                INSERT INTO inbox (inbox_id, severity, summary, detail, task_id, event_seq, created_at, read_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)
                "#,
                libsql::params![
                    item.inbox_id.clone(),
                    severity_str(item.severity),
                    item.summary.clone(),
                    item.detail.clone(),
                    item.task_id.clone(),
                    item.event_seq,
                    item.created_at.to_rfc3339(),
                ],
            )
            .await?;
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            conn.execute("COMMIT", ()).await?;
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute("ROLLBACK", ()).await;
            Err(e)
        }
    }
}

/// Replay persisted events into fresh derived state. An unreadable row
/// truncates the tail: that row and everything after it is deleted and the
/// lost seq range is reported via a warning inbox item.
async fn boot_replay(conn: &Connection) -> Result<(DerivedState, i64), EventStoreError> {
    let mut derived = DerivedState::default();

    let mut max_seq: i64 = 0;
    let mut rows = conn.query("SELECT MAX(seq) FROM events", ()).await?;
    if let Some(row) = rows.next().await? {
        max_seq = row.get::<Option<i64>>(0)?.unwrap_or(0);
    }

    let mut rows = conn
        .query(
            "SELECT seq, time, event_type, task_id, refs, payload FROM events ORDER BY seq ASC",
            (),
        )
        .await?;

    let mut last_good: i64 = 0;
    let mut torn_at: Option<i64> = None;
    while let Some(row) = rows.next().await? {
        let seq: i64 = row.get(0)?;
        match parse_event_row(&row, seq) {
            Ok(event) => {
                projection::apply(&mut derived, &event);
                last_good = seq;
            }
            Err(e) => {
                tracing::error!(seq, error = %e, "Unreadable event row; truncating log tail");
                torn_at = Some(seq);
                break;
            }
        }
    }

    if let Some(torn) = torn_at {
        conn.execute("DELETE FROM events WHERE seq >= ?1", libsql::params![torn]).await?;
        conn.execute("DELETE FROM inbox WHERE event_seq >= ?1", libsql::params![torn]).await?;
        tracing::warn!(lost_from = torn, lost_to = max_seq, "Truncated unreadable log tail");
    }

    // The inbox table is authoritative for read state; it was written in the
    // same transactions as the events it references.
    derived.inbox = load_inbox(conn).await?;

    if let Some(torn) = torn_at {
        let item = InboxItem {
            inbox_id: ulid::Ulid::new().to_string(),
            severity: InboxSeverity::Warning,
            summary: shared_types::clamp_summary(&format!(
                "Recovered from a torn write; events {torn}..={max_seq} were lost"
            )),
            detail: Some("Derived state was rebuilt from the surviving log prefix".to_string()),
            task_id: None,
            event_seq: last_good,
            created_at: Utc::now(),
            read_at: None,
        };
        conn.execute(
            r#"
            INSERT INTO inbox (inbox_id, severity, summary, detail, task_id, event_seq, created_at, read_at)
            VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6, NULL)
            "#,
            libsql::params![
                item.inbox_id.clone(),
                severity_str(item.severity),
                item.summary.clone(),
                item.detail.clone(),
                item.event_seq,
                item.created_at.to_rfc3339(),
            ],
        )
        .await?;
        derived.inbox.push(item);
    }

    let next_seq = last_good + 1;
    Ok((derived, next_seq))
}

fn parse_event_row(row: &libsql::Row, seq: i64) -> Result<Event, EventStoreError> {
    let time_str: String = row.get(1)?;
    let time = DateTime::parse_from_rfc3339(&time_str)
        .map_err(|e| EventStoreError::Serialization(format!("bad timestamp: {e}")))?
        .with_timezone(&Utc);
    let type_str: String = row.get(2)?;
    let event_type: EventType =
        type_str.parse().map_err(EventStoreError::Serialization)?;
    let task_id: Option<String> = row.get(3)?;
    let refs: Option<EventRefs> = match row.get::<Option<String>>(4)? {
        Some(raw) => Some(serde_json::from_str(&raw)?),
        None => None,
    };
    let payload: serde_json::Value = serde_json::from_str(&row.get::<String>(5)?)?;
    Ok(Event { seq, time, event_type, task_id, refs, payload })
}

async fn load_events(
    conn: &Connection,
    task_id: Option<&str>,
    since_seq: i64,
    limit: i64,
) -> Result<Vec<Event>, EventStoreError> {
    let mut rows = match task_id {
        Some(task_id) => {
            conn.query(
                r#"
                SELECT seq, time, event_type, task_id, refs, payload FROM events
                WHERE seq > ?1 AND task_id = ?2
                ORDER BY seq ASC LIMIT ?3
                "#,
                libsql::params![since_seq, task_id.to_string(), limit],
            )
            .await?
        }
        None => {
            conn.query(
                r#"
                SELECT seq, time, event_type, task_id, refs, payload FROM events
                WHERE seq > ?1
                ORDER BY seq ASC LIMIT ?2
                "#,
                libsql::params![since_seq, limit],
            )
            .await?
        }
    };

    let mut events = Vec::new();
    while let Some(row) = rows.next().await? {
        let seq: i64 = row.get(0)?;
        events.push(parse_event_row(&row, seq)?);
    }
    Ok(events)
}

async fn find_by_command_id(
    conn: &Connection,
    command_id: &str,
) -> Result<Option<Event>, EventStoreError> {
    let mut rows = conn
        .query(
            "SELECT seq, time, event_type, task_id, refs, payload FROM events WHERE command_id = ?1",
            libsql::params![command_id.to_string()],
        )
        .await?;
    match rows.next().await? {
        Some(row) => {
            let seq: i64 = row.get(0)?;
            Ok(Some(parse_event_row(&row, seq)?))
        }
        None => Ok(None),
    }
}

async fn find_task_event(
    conn: &Connection,
    task_id: &str,
    event_type: EventType,
) -> Result<Option<Event>, EventStoreError> {
    let mut rows = conn
        .query(
            r#"
            SELECT seq, time, event_type, task_id, refs, payload FROM events
            WHERE task_id = ?1 AND event_type = ?2
            ORDER BY seq ASC LIMIT 1
            "#,
            libsql::params![task_id.to_string(), event_type.as_str()],
        )
        .await?;
    match rows.next().await? {
        Some(row) => {
            let seq: i64 = row.get(0)?;
            Ok(Some(parse_event_row(&row, seq)?))
        }
        None => Ok(None),
    }
}

async fn load_inbox(conn: &Connection) -> Result<Vec<InboxItem>, EventStoreError> {
    let mut rows = conn
        .query(
            r#"
            SELECT inbox_id, severity, summary, detail, task_id, event_seq, created_at, read_at
            FROM inbox ORDER BY event_seq ASC
            "#,
            (),
        )
        .await?;
    let mut items = Vec::new();
    while let Some(row) = rows.next().await? {
        items.push(parse_inbox_row(&row)?);
    }
    Ok(items)
}

async fn load_inbox_by_seq(
    conn: &Connection,
    since_seq: i64,
) -> Result<HashMap<i64, InboxItem>, EventStoreError> {
    let mut rows = conn
        .query(
            r#"
            SELECT inbox_id, severity, summary, detail, task_id, event_seq, created_at, read_at
            FROM inbox WHERE event_seq > ?1
            "#,
            libsql::params![since_seq],
        )
        .await?;
    let mut items = HashMap::new();
    while let Some(row) = rows.next().await? {
        let item = parse_inbox_row(&row)?;
        items.insert(item.event_seq, item);
    }
    Ok(items)
}

fn parse_inbox_row(row: &libsql::Row) -> Result<InboxItem, EventStoreError> {
    let severity_raw: String = row.get(1)?;
    let severity = parse_severity(&severity_raw)?;
    let created_raw: String = row.get(6)?;
    let created_at = DateTime::parse_from_rfc3339(&created_raw)
        .map_err(|e| EventStoreError::Serialization(format!("bad timestamp: {e}")))?
        .with_timezone(&Utc);
    let read_at = match row.get::<Option<String>>(7)? {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(&raw)
                .map_err(|e| EventStoreError::Serialization(format!("bad timestamp: {e}")))?
                .with_timezone(&Utc),
        ),
        None => None,
    };
    Ok(InboxItem {
        inbox_id: row.get(0)?,
        severity,
        summary: row.get(2)?,
        detail: row.get(3)?,
        task_id: row.get(4)?,
        event_seq: row.get(5)?,
        created_at,
        read_at,
    })
}

fn severity_str(severity: InboxSeverity) -> &'static str {
    match severity {
        InboxSeverity::Info => "info",
        InboxSeverity::Success => "success",
        InboxSeverity::Warning => "warning",
        InboxSeverity::Error => "error",
        InboxSeverity::Blocking => "blocking",
    }
}

fn parse_severity(raw: &str) -> Result<InboxSeverity, EventStoreError> {
    match raw {
        "info" => Ok(InboxSeverity::Info),
        "success" => Ok(InboxSeverity::Success),
        "warning" => Ok(InboxSeverity::Warning),
        "error" => Ok(InboxSeverity::Error),
        "blocking" => Ok(InboxSeverity::Blocking),
        other => Err(EventStoreError::Serialization(format!("unknown severity '{other}'"))),
    }
}

// ============================================================================
// Convenience helpers
// ============================================================================

/// Append an event through the store actor.
pub async fn append_event(
    store: &ActorRef<EventStoreMsg>,
    event: AppendEvent,
) -> Result<Result<AppendOutcome, EventStoreError>, ractor::RactorErr<EventStoreMsg>> {
    ractor::call!(store, |reply| EventStoreMsg::Append { event, reply })
}

/// Take a consistent snapshot of derived state.
pub async fn snapshot(
    store: &ActorRef<EventStoreMsg>,
) -> Result<Snapshot, ractor::RactorErr<EventStoreMsg>> {
    ractor::call!(store, |reply| EventStoreMsg::Snapshot { reply })
}

/// Subscribe from `from_seq` (exclusive); replays history then live-tails.
pub async fn subscribe(
    store: &ActorRef<EventStoreMsg>,
    from_seq: i64,
) -> Result<Result<mpsc::Receiver<StoredEvent>, EventStoreError>, ractor::RactorErr<EventStoreMsg>>
{
    ractor::call!(store, |reply| EventStoreMsg::Subscribe { from_seq, reply })
}

// ============================================================================
// Tests
// ============================================================================
