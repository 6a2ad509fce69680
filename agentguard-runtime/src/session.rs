//! Session registry and per-session conversation history.
//!
//! Each session owns one `ConversationWindow` behind its own async lock, so
//! turns on the same session serialize while different sessions proceed
//! independently. Sessions live in process memory until discarded.

use agentguard_core::{ConversationTurn, ConversationWindow};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::MutexGuard;

pub struct SessionState {
    agent_id: String,
    session_id: String,
    metadata: serde_json::Map<String, serde_json::Value>,
    sequence: AtomicU64,
    window: tokio::sync::Mutex<ConversationWindow>,
}

impl SessionState {
    fn new(
        agent_id: String,
        session_id: String,
        metadata: serde_json::Map<String, serde_json::Value>,
        window_size: usize,
    ) -> Self {
        Self {
            agent_id,
            session_id,
            metadata,
            sequence: AtomicU64::new(0),
            window: tokio::sync::Mutex::new(ConversationWindow::new(window_size)),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn metadata(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.metadata
    }

    /// Number of turns started so far.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Claim the next 1-based turn number.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Exclusive access to the window for the duration of one turn submission.
    pub async fn lock_window(&self) -> MutexGuard<'_, ConversationWindow> {
        self.window.lock().await
    }

    pub async fn snapshot(&self) -> Vec<ConversationTurn> {
        self.window.lock().await.snapshot()
    }

    pub async fn append(&self, turn: ConversationTurn) {
        self.window.lock().await.append(turn);
    }
}

pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<SessionState>>>,
    window_size: usize,
}

impl SessionManager {
    pub fn new(window_size: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            window_size,
        }
    }

    /// Return the session registered under `session_id`, creating it if
    /// needed. A missing id gets a fresh UUID.
    pub fn open(
        &self,
        agent_id: &str,
        session_id: Option<String>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Arc<SessionState> {
        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        sessions
            .entry(session_id.clone())
            .or_insert_with(|| {
                tracing::debug!(agent_id, session_id = %session_id, "Session opened");
                Arc::new(SessionState::new(
                    agent_id.to_string(),
                    session_id,
                    metadata,
                    self.window_size,
                ))
            })
            .clone()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionState>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(session_id)
            .cloned()
    }

    /// Forget a session. In-flight turns holding the state finish normally.
    pub fn discard(&self, session_id: &str) -> bool {
        let removed = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(session_id)
            .is_some();
        if removed {
            tracing::debug!(session_id, "Session discarded");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
