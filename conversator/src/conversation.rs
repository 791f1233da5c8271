//! Conversation/transcript feed.
//!
//! An append-only feed of user- and assistant-visible utterances, separate
//! from the domain event log. Backed by a bounded ring buffer with its own
//! monotone cursor; live entries are fanned out over a broadcast channel the
//! WebSocket layer taps. Entries are not durable: the feed restarts empty.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    /// Monotone cursor within this process; resets on restart.
    pub cursor: u64,
    pub speaker: Speaker,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub time: DateTime<Utc>,
}

struct Inner {
    entries: VecDeque<ConversationEntry>,
    next_cursor: u64,
}

pub struct ConversationLog {
    inner: RwLock<Inner>,
    capacity: usize,
    live: broadcast::Sender<ConversationEntry>,
}

impl ConversationLog {
    pub fn new(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(256);
        Self {
            inner: RwLock::new(Inner { entries: VecDeque::new(), next_cursor: 1 }),
            capacity,
            live,
        }
    }

    pub async fn append(
        &self,
        speaker: Speaker,
        text: impl Into<String>,
        task_id: Option<String>,
    ) -> ConversationEntry {
        let mut inner = self.inner.write().await;
        let entry = ConversationEntry {
            cursor: inner.next_cursor,
            speaker,
            text: text.into(),
            task_id,
            time: Utc::now(),
        };
        inner.next_cursor += 1;
        inner.entries.push_back(entry.clone());
        while inner.entries.len() > self.capacity {
            inner.entries.pop_front();
        }
        drop(inner);

        // No receivers is fine; the dashboard may not be connected.
        let _ = self.live.send(entry.clone());
        entry
    }

    /// Entries with cursor greater than `after`, in order.
    pub async fn entries_after(&self, after: u64) -> Vec<ConversationEntry> {
        let inner = self.inner.read().await;
        inner.entries.iter().filter(|e| e.cursor > after).cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEntry> {
        self.live.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cursors_are_monotone_and_replayable() {
        let log = ConversationLog::new(16);
        log.append(Speaker::User, "fix the login bug", None).await;
        log.append(Speaker::Assistant, "on it", None).await;
        let third = log.append(Speaker::System, "task created", Some("t1".to_string())).await;

        assert_eq!(third.cursor, 3);
        let replay = log.entries_after(1).await;
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].cursor, 2);
        assert_eq!(replay[1].cursor, 3);
    }

    #[tokio::test]
    async fn ring_buffer_drops_oldest() {
        let log = ConversationLog::new(2);
        for i in 0..4 {
            log.append(Speaker::User, format!("msg {i}"), None).await;
        }
        let all = log.entries_after(0).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].cursor, 3);
        // Cursors keep counting even after eviction.
        assert_eq!(all[1].cursor, 4);
    }

    #[tokio::test]
    async fn live_subscribers_observe_appends_in_order() {
        let log = ConversationLog::new(16);
        let mut rx = log.subscribe();
        log.append(Speaker::User, "one", None).await;
        log.append(Speaker::User, "two", None).await;

        assert_eq!(rx.recv().await.unwrap().cursor, 1);
        assert_eq!(rx.recv().await.unwrap().cursor, 2);
    }
}
