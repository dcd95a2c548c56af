//! Registry of live WebRTC sessions
//!
//! The lock is only held for the duration of each call and never across an
//! await; frame writes are non-blocking queue pushes.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::session::{ClientSession, SessionId};
use crate::capture::{Frame, FrameSink};

pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<ClientSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, session: Arc<ClientSession>) {
        let mut sessions = self.sessions.lock();
        sessions.insert(session.id().clone(), session.clone());
        tracing::info!(session = %session.id(), sessions = sessions.len(), "Session registered");
    }

    /// Remove a session. Returns it if it was present so the caller can close
    /// its connection; removing an absent session does nothing.
    pub fn remove(&self, id: &SessionId, reason: &str) -> Option<Arc<ClientSession>> {
        let removed = self.sessions.lock().remove(id);
        match &removed {
            Some(_) => tracing::info!(session = %id, "Client removed: {}", reason),
            None => tracing::trace!(session = %id, "Client already removed: {}", reason),
        }
        removed
    }

    pub fn find(&self, id: &str) -> Option<Arc<ClientSession>> {
        self.sessions.lock().get(&SessionId::from(id)).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// True iff some session is connected with an open track
    pub fn any_wants_frame(&self) -> bool {
        self.sessions
            .lock()
            .values()
            .any(|session| session.wants_frame())
    }

    /// Offer a frame to every ready session
    pub fn dispatch(&self, frame: &Frame<'_>) {
        let sessions = self.sessions.lock();
        for session in sessions.values() {
            if session.wants_frame() {
                session.push_frame(frame);
            }
        }
    }

    /// Remove every session, for shutdown
    pub fn drain(&self) -> Vec<Arc<ClientSession>> {
        let drained: Vec<_> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        if !drained.is_empty() {
            tracing::info!("Removed {} sessions", drained.len());
        }
        drained
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSink for SessionRegistry {
    fn needs_frame(&self) -> bool {
        self.any_wants_frame()
    }

    fn on_frame(&self, frame: &Frame<'_>) {
        self.dispatch(frame);
    }
}
