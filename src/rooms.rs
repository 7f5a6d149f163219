//! Room registry: which live session is joined to which incident.
//!
//! Purely in-memory and process-local. Each session owns a bounded channel;
//! the transport task drains it into the socket. A session whose queue is
//! full misses the event instead of growing without limit. A session is in at
//! most one room at a time and a later join replaces the earlier one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::model::Identity;
use crate::realtime::events::ServerEvent;

/// Handle of one live session.
pub type SessionId = u64;

/// Outbound queue of a session.
pub type SessionTx = mpsc::Sender<ServerEvent>;

/// Default number of events a session may have queued.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

struct Session {
    identity: Identity,
    tx: SessionTx,
    room: Option<String>,
}

struct RegistryState {
    queue_capacity: usize,
    next_id: SessionId,
    sessions: HashMap<SessionId, Session>,
    /// incident id -> sessions joined to it
    rooms: HashMap<String, HashSet<SessionId>>,
}

impl RegistryState {
    fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity: queue_capacity.max(1),
            next_id: 0,
            sessions: HashMap::new(),
            rooms: HashMap::new(),
        }
    }

    fn detach(&mut self, session: SessionId) -> Option<String> {
        let room = self.sessions.get_mut(&session)?.room.take()?;
        if let Some(members) = self.rooms.get_mut(&room) {
            members.remove(&session);
            if members.is_empty() {
                self.rooms.remove(&room);
            }
        }
        Some(room)
    }
}

/// Queue `event` for one session. Returns `false` if it was not accepted.
fn deliver(id: SessionId, session: &Session, event: ServerEvent) -> bool {
    match session.tx.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(session = id, user_id = %session.identity.id, "Session queue full, event dropped");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Shared registry of sessions and rooms.
#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry whose sessions queue at most `queue_capacity` events.
    pub fn with_capacity(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryState::new(queue_capacity))),
        }
    }

    /// Register a session for an authenticated user.
    pub async fn connect(&self, identity: Identity) -> (SessionId, mpsc::Receiver<ServerEvent>) {
        let mut state = self.inner.lock().await;
        let (tx, rx) = mpsc::channel(state.queue_capacity);
        state.next_id += 1;
        let id = state.next_id;
        debug!(session = id, user_id = %identity.id, "Session connected");
        state.sessions.insert(
            id,
            Session {
                identity,
                tx,
                room: None,
            },
        );
        (id, rx)
    }

    /// The user behind a session.
    pub async fn identity_of(&self, session: SessionId) -> Option<Identity> {
        let state = self.inner.lock().await;
        state.sessions.get(&session).map(|s| s.identity.clone())
    }

    /// Put a session in an incident's room, leaving any previous room.
    /// Returns `false` for unknown sessions.
    pub async fn join(&self, session: SessionId, incident_id: &str) -> bool {
        let mut state = self.inner.lock().await;
        if !state.sessions.contains_key(&session) {
            return false;
        }
        state.detach(session);
        state
            .rooms
            .entry(incident_id.to_string())
            .or_default()
            .insert(session);
        if let Some(s) = state.sessions.get_mut(&session) {
            s.room = Some(incident_id.to_string());
        }
        true
    }

    /// Take a session out of its room. No-op if it never joined.
    pub async fn leave(&self, session: SessionId) -> Option<String> {
        self.inner.lock().await.detach(session)
    }

    /// Take every session of `user_id` out of an incident's room. Used when
    /// the user stops being a member. Returns how many sessions were removed.
    pub async fn evict_user(&self, incident_id: &str, user_id: &str) -> usize {
        let mut state = self.inner.lock().await;
        let Some(members) = state.rooms.get(incident_id) else {
            return 0;
        };
        let targets: Vec<SessionId> = members
            .iter()
            .copied()
            .filter(|id| {
                state
                    .sessions
                    .get(id)
                    .is_some_and(|s| s.identity.id == user_id)
            })
            .collect();

        for session in &targets {
            state.detach(*session);
        }
        if !targets.is_empty() {
            debug!(incident_id, user_id, evicted = targets.len(), "Sessions evicted from room");
        }
        targets.len()
    }

    /// Empty an incident's room. Returns how many sessions were in it.
    pub async fn close_room(&self, incident_id: &str) -> usize {
        let mut state = self.inner.lock().await;
        let Some(members) = state.rooms.remove(incident_id) else {
            return 0;
        };
        for session in &members {
            if let Some(s) = state.sessions.get_mut(session) {
                s.room = None;
            }
        }
        debug!(incident_id, closed = members.len(), "Room closed");
        members.len()
    }

    /// Forget a session entirely.
    pub async fn disconnect(&self, session: SessionId) {
        let mut state = self.inner.lock().await;
        let room = state.detach(session);
        if state.sessions.remove(&session).is_some() {
            debug!(session, room = ?room, "Session disconnected");
        }
    }

    /// The room a session is currently joined to.
    pub async fn room_of(&self, session: SessionId) -> Option<String> {
        let state = self.inner.lock().await;
        state.sessions.get(&session).and_then(|s| s.room.clone())
    }

    /// Sessions joined to an incident's room, in ascending id order.
    pub async fn members_of(&self, incident_id: &str) -> Vec<SessionId> {
        let state = self.inner.lock().await;
        let mut members: Vec<SessionId> = state
            .rooms
            .get(incident_id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        members.sort_unstable();
        members
    }

    /// Queue an event for one session. Returns `false` if it is gone.
    pub async fn send_to(&self, session: SessionId, event: ServerEvent) -> bool {
        let state = self.inner.lock().await;
        match state.sessions.get(&session) {
            Some(s) => deliver(session, s, event),
            None => false,
        }
    }

    /// Queue an event for every session in a room. Returns how many accepted it.
    pub async fn broadcast(&self, incident_id: &str, event: &ServerEvent) -> usize {
        let state = self.inner.lock().await;
        let Some(members) = state.rooms.get(incident_id) else {
            return 0;
        };
        members
            .iter()
            .filter_map(|id| state.sessions.get(id).map(|s| (*id, s)))
            .filter(|(id, s)| deliver(*id, s, event.clone()))
            .count()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }
}
