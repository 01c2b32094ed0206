//! The set of live sessions and the broadcast fan-out.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::{
    Mutex,
    mpsc::{self, error::TrySendError},
    watch,
};
use tracing::{debug, info, warn};

use crate::{
    error::RegistryError,
    protocol::{ChatMessage, Command, validate_name},
    session::{SessionId, SessionState},
};

/// Name shown for sessions that have not sent a `NAME` command yet.
pub const DEFAULT_NAME: &str = "anonymous";

pub struct Registration {
    pub id: SessionId,
    pub state: watch::Receiver<SessionState>,
}

struct Entry {
    name: Option<String>,
    outbound: mpsc::Sender<Command>,
    state: watch::Sender<SessionState>,
}

impl Entry {
    fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_NAME)
    }

    fn close(self) {
        self.state.send_replace(SessionState::Closed);
    }
}

/// Live sessions keyed by connection id. Names are not unique, ids are.
pub struct Registry {
    sessions: Mutex<HashMap<SessionId, Entry>>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn register(&self, outbound: mpsc::Sender<Command>) -> Registration {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (state_tx, state) = watch::channel(SessionState::Connected);

        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            id,
            Entry {
                name: None,
                outbound,
                state: state_tx,
            },
        );
        debug!(session = %id, live = sessions.len(), "session registered");

        Registration { id, state }
    }

    pub async fn set_name(&self, id: SessionId, name: &str) -> Result<(), RegistryError> {
        let name = name.trim_matches(' ');
        validate_name(name).map_err(RegistryError::InvalidName)?;

        let mut sessions = self.sessions.lock().await;
        let entry = sessions
            .get_mut(&id)
            .ok_or(RegistryError::SessionClosed(id))?;
        entry.name = Some(name.to_string());
        entry.state.send_replace(SessionState::Named);
        Ok(())
    }

    /// Returns how many sessions the message was queued for. Sessions whose
    /// queue is full or gone are closed and removed.
    pub async fn broadcast(
        &self,
        origin: SessionId,
        message: String,
    ) -> Result<usize, RegistryError> {
        let mut sessions = self.sessions.lock().await;
        let name = sessions
            .get(&origin)
            .ok_or(RegistryError::SessionClosed(origin))?
            .display_name()
            .to_string();
        let command = Command::Message(ChatMessage { name, message });

        let mut delivered = 0;
        let mut dropped = Vec::new();
        for (&id, entry) in sessions.iter() {
            if id == origin {
                continue;
            }
            match entry.outbound.try_send(command.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(session = %id, "outbound queue full; dropping slow session");
                    dropped.push(id);
                }
                Err(TrySendError::Closed(_)) => dropped.push(id),
            }
        }

        for id in dropped {
            if let Some(entry) = sessions.remove(&id) {
                entry.close();
            }
        }

        Ok(delivered)
    }

    pub async fn unregister(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.remove(&id) {
            Some(entry) => {
                info!(
                    session = %id,
                    name = entry.display_name(),
                    live = sessions.len(),
                    "session unregistered"
                );
                entry.close();
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let count = sessions.len();
        for (_, entry) in sessions.drain() {
            entry.close();
        }
        count
    }

    pub async fn name(&self, id: SessionId) -> Option<String> {
        let sessions = self.sessions.lock().await;
        sessions.get(&id).map(|entry| entry.display_name().to_string())
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}
