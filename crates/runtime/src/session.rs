//! Generation sessions.
//!
//! A session is the live state of one in-flight turn: its cancellation
//! token, the text reconciled so far and whether the user stopped it. The
//! registry allows at most one session per chat; starting a new turn
//! cancels the previous one first and can wait for it to finish.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// One in-flight generation.
#[derive(Debug)]
pub struct GenerationSession {
    id: Uuid,
    chat_id: String,
    cancel: CancellationToken,
    latest_text: Mutex<String>,
    stopped_by_user: Mutex<bool>,
    finished: watch::Sender<bool>,
}

impl GenerationSession {
    fn new(chat_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id: chat_id.to_string(),
            cancel: CancellationToken::new(),
            latest_text: Mutex::new(String::new()),
            stopped_by_user: Mutex::new(false),
            finished: watch::channel(false).0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    /// Token the transport watches. Cancelling it aborts the request.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel on the user's behalf.
    pub fn stop(&self) {
        *self.stopped_by_user.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.cancel.cancel();
    }

    pub fn stopped_by_user(&self) -> bool {
        *self.stopped_by_user.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_latest_text(&self, text: &str) {
        let mut latest = self.latest_text.lock().unwrap_or_else(|e| e.into_inner());
        latest.clear();
        latest.push_str(text);
    }

    pub fn latest_text(&self) -> String {
        self.latest_text
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether the turn owning this session has returned.
    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Resolves once the turn owning this session has returned.
    pub async fn finished(&self) {
        let mut rx = self.finished.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|done| *done).await;
    }

    fn mark_finished(&self) {
        self.finished.send_replace(true);
    }
}

/// Active sessions keyed by chat id.
#[derive(Debug, Default, Clone)]
pub struct SessionRegistry {
    // Non-async, held briefly.
    sessions: Arc<Mutex<HashMap<String, Arc<GenerationSession>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session for `chat_id`, cancelling any session already running
    /// there. The session stays registered until the returned guard drops;
    /// the cancelled one is available from [`SessionGuard::replaced`].
    pub fn begin(&self, chat_id: &str) -> SessionGuard {
        let session = Arc::new(GenerationSession::new(chat_id));
        let previous = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(chat_id.to_string(), session.clone());
        if let Some(previous) = &previous {
            debug!(chat_id = %chat_id, session = %previous.id, "Replacing active session");
            previous.cancel.cancel();
        }
        SessionGuard {
            registry: self.clone(),
            session,
            replaced: previous,
        }
    }

    pub fn get(&self, chat_id: &str) -> Option<Arc<GenerationSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(chat_id)
            .cloned()
    }

    /// Stop the chat's active session. Returns whether one was running.
    pub fn stop(&self, chat_id: &str) -> bool {
        match self.get(chat_id) {
            Some(session) => {
                session.stop();
                true
            }
            None => false,
        }
    }

    /// Stop every active session.
    pub fn stop_all(&self) -> usize {
        let sessions: Vec<_> = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        sessions.iter().for_each(|s| s.stop());
        sessions.len()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn release(&self, session: &GenerationSession) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        // A newer turn may already own the slot.
        if sessions
            .get(&session.chat_id)
            .is_some_and(|active| active.id == session.id)
        {
            sessions.remove(&session.chat_id);
        }
    }
}

/// Keeps a session registered; removes it and marks it finished on drop.
pub struct SessionGuard {
    registry: SessionRegistry,
    session: Arc<GenerationSession>,
    replaced: Option<Arc<GenerationSession>>,
}

impl SessionGuard {
    pub fn session(&self) -> &Arc<GenerationSession> {
        &self.session
    }

    /// The session this one cancelled when it began, if any.
    pub fn replaced(&self) -> Option<&Arc<GenerationSession>> {
        self.replaced.as_ref()
    }
}

impl std::ops::Deref for SessionGuard {
    type Target = GenerationSession;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.release(&self.session);
        self.session.mark_finished();
    }
}
