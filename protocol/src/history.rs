use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::types::ChatTurn;

/// Per-session conversation history.
///
/// Append-only, truncated to the last `max_turns` on every write. A
/// session is garbage-collected when its *last* turn falls outside the
/// retention window — an old session kept alive by recent replies is
/// retained, only the tail matters.
#[derive(Clone)]
pub struct ConversationStore {
    sessions: Arc<RwLock<HashMap<String, Vec<ChatTurn>>>>,
    max_turns: usize,
    retention: Duration,
}

impl ConversationStore {
    pub fn new(max_turns: usize, retention: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_turns,
            retention,
        }
    }

    pub async fn append(&self, session_id: &str, turn: ChatTurn) {
        let mut sessions = self.sessions.write().await;
        let turns = sessions.entry(session_id.to_string()).or_default();
        turns.push(turn);
        if turns.len() > self.max_turns {
            let excess = turns.len() - self.max_turns;
            turns.drain(..excess);
        }
    }

    pub async fn get(&self, session_id: &str) -> Vec<ChatTurn> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).cloned().unwrap_or_default()
    }

    /// Last `n` turns of a session, oldest first.
    pub async fn tail(&self, session_id: &str, n: usize) -> Vec<ChatTurn> {
        let sessions = self.sessions.read().await;
        match sessions.get(session_id) {
            Some(turns) => turns[turns.len().saturating_sub(n)..].to_vec(),
            None => vec![],
        }
    }

    /// Drop sessions whose last turn is older than the retention window;
    /// returns how many sessions were removed.
    pub async fn sweep_idle(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::milliseconds(self.retention.as_millis() as i64);
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, turns| match turns.last() {
            Some(last) => last.timestamp >= cutoff,
            None => false,
        });
        before - sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}
