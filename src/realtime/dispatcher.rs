//! Translates inbound session events into persisted state and room fan-out.
//!
//! Malformed or unauthorized events are logged and dropped; they never end
//! the session. `sendAlert` is the only event answered directly, with an
//! [`AlertAck`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::geo::GeoPoint;
use crate::identity::Directory;
use crate::locks::KeyedLocks;
use crate::model::{ChatMessage, Identity};
use crate::rooms::{RoomRegistry, SessionId};
use crate::storage::Storage;

use super::events::{
    AlertAck, AlertKind, ClientEvent, IncidentAlert, JoinIncident, LocationUpdate, SendAlert,
    SendMessage, ServerEvent, UpdateLocation,
};

/// Latest unsaved position of a user.
struct PendingLocation {
    seq: u64,
    point: GeoPoint,
}

#[derive(Default)]
struct PendingLocations {
    next_seq: u64,
    by_user: HashMap<String, PendingLocation>,
}

/// Real-time event dispatcher shared by every session.
#[derive(Clone)]
pub struct Dispatcher {
    storage: Storage,
    directory: Directory,
    rooms: RoomRegistry,
    persist_delay: Duration,
    pending: Arc<Mutex<PendingLocations>>,
    /// Serializes append-then-broadcast per incident.
    chat_locks: KeyedLocks,
}

impl Dispatcher {
    pub fn new(storage: Storage, directory: Directory, rooms: RoomRegistry, config: &Config) -> Self {
        Self {
            storage,
            directory,
            rooms,
            persist_delay: config.location_persist_delay,
            pending: Arc::new(Mutex::new(PendingLocations::default())),
            chat_locks: KeyedLocks::new(),
        }
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    /// Open a session for an authenticated user.
    pub async fn connect(&self, identity: Identity) -> (SessionId, mpsc::Receiver<ServerEvent>) {
        let user_id = identity.id.clone();
        let (session, rx) = self.rooms.connect(identity).await;
        info!(session, user_id = %user_id, "Real-time session opened");
        (session, rx)
    }

    /// Close a session. Assignment state is not touched.
    pub async fn disconnect(&self, session: SessionId) {
        self.rooms.disconnect(session).await;
        info!(session, "Real-time session closed");
    }

    /// Parse and handle one text frame.
    pub async fn handle_frame(&self, session: SessionId, frame: &str) {
        match serde_json::from_str::<ClientEvent>(frame) {
            Ok(event) => self.handle_event(session, event).await,
            Err(e) => warn!(session, error = %e, "Dropped malformed real-time frame"),
        }
    }

    /// Handle one parsed event.
    pub async fn handle_event(&self, session: SessionId, event: ClientEvent) {
        let name = event.name();
        let result = match event {
            ClientEvent::JoinIncident(join) => self.join_incident(session, join).await,
            ClientEvent::SendMessage(msg) => self.send_message(session, msg).await,
            ClientEvent::UpdateLocation(update) => self.update_location(session, update).await,
            ClientEvent::SendAlert(alert) => {
                self.send_alert(session, alert).await;
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(session, event = name, error = %e.public_message(), "Dropped real-time event");
        }
    }

    /// Persist a chat message and broadcast it to the incident's room.
    ///
    /// Both steps run under the incident's chat lock, so room members see
    /// messages in the order they were stored.
    pub async fn post_message(
        &self,
        incident_id: &str,
        author: &Identity,
        text: &str,
    ) -> AppResult<ChatMessage> {
        let _guard = self.chat_locks.acquire(incident_id).await;
        let message = self
            .storage
            .append_chat_message(incident_id, author, text)
            .await?;
        self.publish_message(&message).await;
        Ok(message)
    }

    /// Take a user who left an incident out of its room.
    pub async fn evict_user(&self, incident_id: &str, user_id: &str) -> usize {
        let evicted = self.rooms.evict_user(incident_id, user_id).await;
        if evicted > 0 {
            info!(incident_id, user_id, evicted, "Removed departed user from incident room");
        }
        evicted
    }

    /// Empty the room of a deleted incident.
    pub async fn close_room(&self, incident_id: &str) -> usize {
        let closed = self.rooms.close_room(incident_id).await;
        if closed > 0 {
            info!(incident_id, closed, "Closed incident room");
        }
        closed
    }

    async fn publish_message(&self, message: &ChatMessage) -> usize {
        let delivered = self
            .rooms
            .broadcast(&message.incident, &ServerEvent::NewMessage(message.clone()))
            .await;
        debug!(incident_id = %message.incident, delivered, "Chat message broadcast");
        delivered
    }

    async fn session_identity(&self, session: SessionId) -> AppResult<Identity> {
        self.rooms
            .identity_of(session)
            .await
            .ok_or_else(|| AppError::unauthorized("Unknown session"))
    }

    /// Load the incident and make sure `identity` may act on it.
    async fn require_participant(&self, incident_id: &str, identity: &Identity) -> AppResult<()> {
        let incident = self.storage.get_incident(incident_id).await?;
        if incident.admits(identity) {
            Ok(())
        } else {
            Err(AppError::forbidden("Not a member of this incident"))
        }
    }

    async fn join_incident(&self, session: SessionId, join: JoinIncident) -> AppResult<()> {
        let identity = self.session_identity(session).await?;
        let incident_id = required(join.incident_id, "incidentId")?;

        if let Some(token) = join.token.as_deref() {
            let claimed = self.directory.resolve(token).await?;
            if claimed.id != identity.id {
                return Err(AppError::unauthorized("Token does not belong to this session"));
            }
        }

        self.require_participant(&incident_id, &identity).await?;
        self.rooms.join(session, &incident_id).await;
        info!(session, user_id = %identity.id, incident_id = %incident_id, "Session joined incident room");
        Ok(())
    }

    async fn send_message(&self, session: SessionId, msg: SendMessage) -> AppResult<()> {
        let identity = self.session_identity(session).await?;
        let incident_id = required(msg.incident_id, "incidentId")?;
        let text = required(msg.message, "message")?;

        self.require_participant(&incident_id, &identity).await?;
        self.post_message(&incident_id, &identity, &text).await?;
        Ok(())
    }

    /// Broadcast first, persist later.
    async fn update_location(&self, session: SessionId, update: UpdateLocation) -> AppResult<()> {
        let identity = self.session_identity(session).await?;
        let incident_id = required(update.incident_id, "incidentId")?;
        let location = update
            .location
            .ok_or_else(|| AppError::validation("\"location\" is required"))?;
        let point = GeoPoint::try_from(location).map_err(AppError::Validation)?;

        if let Some(claimed) = update.user_id.as_deref() {
            if claimed != identity.id {
                return Err(AppError::forbidden("Cannot update another user's location"));
            }
        }
        self.require_participant(&incident_id, &identity).await?;

        // Name and role come from the directory, not from the frame.
        let current = self
            .directory
            .lookup(&identity.id)
            .await?
            .ok_or_else(|| AppError::not_found("User not found"))?;

        let event = ServerEvent::LocationUpdate(LocationUpdate {
            user_id: current.id.clone(),
            name: current.name,
            role: current.role,
            location: point,
        });
        let delivered = self.rooms.broadcast(&incident_id, &event).await;
        debug!(user_id = %current.id, incident_id = %incident_id, delivered, "Location broadcast");

        self.schedule_location_write(current.id, point).await;
        Ok(())
    }

    async fn send_alert(&self, session: SessionId, alert: SendAlert) {
        let ack = match self.broadcast_alert(session, alert).await {
            Ok(delivered) => {
                debug!(session, delivered, "Alert broadcast");
                AlertAck::ok()
            }
            Err(e) => {
                warn!(session, error = %e.public_message(), "Rejected alert");
                AlertAck::error(e.public_message())
            }
        };
        self.rooms.send_to(session, ServerEvent::AlertAck(ack)).await;
    }

    async fn broadcast_alert(&self, session: SessionId, alert: SendAlert) -> AppResult<usize> {
        let identity = self.session_identity(session).await?;
        let incident_id = required(alert.incident_id, "incidentId")?;
        let kind: AlertKind = required(alert.alert_type, "alertType")?.parse()?;

        if let Some(claimed) = alert.user_id.as_deref() {
            if claimed != identity.id {
                return Err(AppError::forbidden("Cannot send alerts as another user"));
            }
        }
        self.require_participant(&incident_id, &identity).await?;

        let sender = self
            .directory
            .lookup(&identity.id)
            .await?
            .ok_or_else(|| AppError::not_found("User not found"))?;

        let event = ServerEvent::IncidentAlert(IncidentAlert {
            message: kind.message(&sender.name),
            user_id: sender.id,
            name: sender.name,
            role: sender.role,
            alert_type: kind,
            timestamp: Utc::now(),
        });
        let delivered = self.rooms.broadcast(&incident_id, &event).await;
        info!(incident_id = %incident_id, alert = %kind, delivered, "Incident alert sent");
        Ok(delivered)
    }

    /// Record `point` as the user's newest position and write it after the
    /// configured delay, unless a newer position arrives first.
    async fn schedule_location_write(&self, user_id: String, point: GeoPoint) {
        let seq = {
            let mut pending = self.pending.lock().await;
            pending.next_seq += 1;
            let seq = pending.next_seq;
            pending
                .by_user
                .insert(user_id.clone(), PendingLocation { seq, point });
            seq
        };

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.persist_delay).await;
            let point = {
                let mut pending = this.pending.lock().await;
                let is_latest = pending
                    .by_user
                    .get(&user_id)
                    .is_some_and(|latest| latest.seq == seq);
                if is_latest {
                    pending.by_user.remove(&user_id).map(|p| p.point)
                } else {
                    None
                }
            };
            if let Some(point) = point {
                this.persist_location(&user_id, point).await;
            }
        });
    }

    /// Write every pending position now. Used at shutdown.
    pub async fn flush_pending_locations(&self) -> usize {
        let drained: Vec<(String, GeoPoint)> = {
            let mut pending = self.pending.lock().await;
            pending
                .by_user
                .drain()
                .map(|(user_id, p)| (user_id, p.point))
                .collect()
        };
        for (user_id, point) in &drained {
            self.persist_location(user_id, *point).await;
        }
        drained.len()
    }

    /// Number of positions waiting to be written.
    pub async fn pending_location_count(&self) -> usize {
        self.pending.lock().await.by_user.len()
    }

    async fn persist_location(&self, user_id: &str, point: GeoPoint) {
        match self.storage.update_user_location(user_id, point).await {
            Ok(()) => debug!(user_id = %user_id, "Location persisted"),
            Err(e) => error!(user_id = %user_id, error = %e, "Failed to persist location"),
        }
    }
}

fn required(value: Option<String>, field: &str) -> AppResult<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AppError::validation(format!("\"{field}\" is required")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IncidentDraft, Role};
    use crate::realtime::events::AckStatus;

    struct Fixture {
        storage: Storage,
        dispatcher: Dispatcher,
    }

    async fn fixture(delay: Duration) -> Fixture {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let directory: Directory = Arc::new(storage.clone());
        let config = Config {
            location_persist_delay: delay,
            ..Config::in_memory()
        };
        let dispatcher = Dispatcher::new(storage.clone(), directory, RoomRegistry::new(), &config);
        Fixture { storage, dispatcher }
    }

    async fn victim_with_incident(storage: &Storage) -> (Identity, String) {
        let victim = storage
            .create_user("Asha", Role::Victim, "asha-token")
            .await
            .unwrap()
            .identity();
        let incident = storage
            .create_incident(&IncidentDraft {
                title: "Flood".to_string(),
                description: "Water rising".to_string(),
                location: GeoPoint::new(77.0, 12.0).unwrap(),
                creator_id: victim.id.clone(),
            })
            .await
            .unwrap();
        (victim, incident.id)
    }

    fn location_frame(incident_id: &str, lng: f64) -> String {
        serde_json::json!({
            "event": "updateLocation",
            "data": {
                "incidentId": incident_id,
                "location": { "type": "Point", "coordinates": [lng, 12.0] }
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_join_requires_membership() {
        let f = fixture(Duration::ZERO).await;
        let (victim, incident_id) = victim_with_incident(&f.storage).await;
        let outsider = f
            .storage
            .create_user("Other", Role::Volunteer, "other-token")
            .await
            .unwrap()
            .identity();

        let (s1, _rx1) = f.dispatcher.connect(victim).await;
        let (s2, _rx2) = f.dispatcher.connect(outsider).await;
        for s in [s1, s2] {
            f.dispatcher
                .handle_event(
                    s,
                    ClientEvent::JoinIncident(JoinIncident {
                        incident_id: Some(incident_id.clone()),
                        token: None,
                    }),
                )
                .await;
        }

        assert_eq!(f.dispatcher.rooms().members_of(&incident_id).await, vec![s1]);
    }

    #[tokio::test]
    async fn test_join_with_foreign_token_is_dropped() {
        let f = fixture(Duration::ZERO).await;
        let (victim, incident_id) = victim_with_incident(&f.storage).await;
        f.storage
            .create_user("Other", Role::Volunteer, "other-token")
            .await
            .unwrap();

        let (s, _rx) = f.dispatcher.connect(victim).await;
        f.dispatcher
            .handle_event(
                s,
                ClientEvent::JoinIncident(JoinIncident {
                    incident_id: Some(incident_id.clone()),
                    token: Some("other-token".to_string()),
                }),
            )
            .await;

        assert!(f.dispatcher.rooms().members_of(&incident_id).await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let f = fixture(Duration::ZERO).await;
        let (victim, incident_id) = victim_with_incident(&f.storage).await;
        let (s, mut rx) = f.dispatcher.connect(victim).await;
        f.dispatcher.rooms().join(s, &incident_id).await;

        f.dispatcher.handle_frame(s, "not json").await;
        f.dispatcher
            .handle_frame(s, r#"{"event":"sendMessage","data":{"incidentId":"x"}}"#)
            .await;

        assert!(rx.try_recv().is_err());
        assert!(f.storage.list_chat_messages(&incident_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_location_broadcast_precedes_persistence() {
        let f = fixture(Duration::from_secs(3600)).await;
        let (victim, incident_id) = victim_with_incident(&f.storage).await;
        let (s, mut rx) = f.dispatcher.connect(victim.clone()).await;
        f.dispatcher.rooms().join(s, &incident_id).await;

        f.dispatcher.handle_frame(s, &location_frame(&incident_id, 77.1)).await;
        f.dispatcher.handle_frame(s, &location_frame(&incident_id, 77.2)).await;

        for expected in [77.1, 77.2] {
            match rx.try_recv().unwrap() {
                ServerEvent::LocationUpdate(update) => {
                    assert_eq!(update.user_id, victim.id);
                    assert_eq!(update.name, "Asha");
                    assert_eq!(update.role, Role::Victim);
                    assert_eq!(update.location.lng, expected);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }

        let user = f.storage.get_user(&victim.id).await.unwrap().unwrap();
        assert!(user.current_location.is_none());
        assert_eq!(f.dispatcher.pending_location_count().await, 1);

        assert_eq!(f.dispatcher.flush_pending_locations().await, 1);
        let user = f.storage.get_user(&victim.id).await.unwrap().unwrap();
        assert_eq!(user.current_location.map(|p| p.lng), Some(77.2));
    }

    #[tokio::test]
    async fn test_delayed_write_lands_latest_point() {
        let f = fixture(Duration::from_millis(20)).await;
        let (victim, incident_id) = victim_with_incident(&f.storage).await;
        let (s, _rx) = f.dispatcher.connect(victim.clone()).await;
        f.dispatcher.rooms().join(s, &incident_id).await;

        f.dispatcher.handle_frame(s, &location_frame(&incident_id, 77.1)).await;
        f.dispatcher.handle_frame(s, &location_frame(&incident_id, 77.3)).await;

        let mut saved = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            saved = f
                .storage
                .get_user(&victim.id)
                .await
                .unwrap()
                .unwrap()
                .current_location;
            if saved.is_some() {
                break;
            }
        }
        assert_eq!(saved.map(|p| p.lng), Some(77.3));
        assert_eq!(f.dispatcher.pending_location_count().await, 0);
    }

    #[tokio::test]
    async fn test_location_for_other_user_is_dropped() {
        let f = fixture(Duration::ZERO).await;
        let (victim, incident_id) = victim_with_incident(&f.storage).await;
        let (s, mut rx) = f.dispatcher.connect(victim).await;
        f.dispatcher.rooms().join(s, &incident_id).await;

        f.dispatcher
            .handle_event(
                s,
                ClientEvent::UpdateLocation(UpdateLocation {
                    user_id: Some("someone-else".to_string()),
                    incident_id: Some(incident_id.clone()),
                    location: Some(crate::geo::GeoJsonPoint {
                        kind: "Point".to_string(),
                        coordinates: vec![77.0, 12.0],
                    }),
                }),
            )
            .await;

        assert!(rx.try_recv().is_err());
        assert_eq!(f.dispatcher.pending_location_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_room_sees_messages_in_stored_order() {
        let f = fixture(Duration::ZERO).await;
        let (victim, incident_id) = victim_with_incident(&f.storage).await;
        let (s, mut rx) = f.dispatcher.connect(victim.clone()).await;
        f.dispatcher.rooms().join(s, &incident_id).await;

        let mut tasks = Vec::new();
        for n in 0..24 {
            let dispatcher = f.dispatcher.clone();
            let incident_id = incident_id.clone();
            let victim = victim.clone();
            tasks.push(tokio::spawn(async move {
                dispatcher
                    .post_message(&incident_id, &victim, &format!("update {n}"))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut received = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                ServerEvent::NewMessage(message) => received.push(message.id),
                other => panic!("unexpected event {other:?}"),
            }
        }
        let stored: Vec<String> = f
            .storage
            .list_chat_messages(&incident_id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(received.len(), 24);
        assert_eq!(received, stored);
    }

    #[tokio::test]
    async fn test_evicted_user_stops_receiving_messages() {
        let f = fixture(Duration::ZERO).await;
        let (victim, incident_id) = victim_with_incident(&f.storage).await;
        let volunteer = f
            .storage
            .create_user("Ravi", Role::Volunteer, "ravi-token")
            .await
            .unwrap()
            .identity();

        let (sv, mut rx_victim) = f.dispatcher.connect(victim.clone()).await;
        let (so, mut rx_volunteer) = f.dispatcher.connect(volunteer.clone()).await;
        f.dispatcher.rooms().join(sv, &incident_id).await;
        f.dispatcher.rooms().join(so, &incident_id).await;

        assert_eq!(f.dispatcher.evict_user(&incident_id, &volunteer.id).await, 1);
        f.dispatcher
            .post_message(&incident_id, &victim, "still here?")
            .await
            .unwrap();

        assert!(matches!(rx_victim.try_recv(), Ok(ServerEvent::NewMessage(_))));
        assert!(rx_volunteer.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_alert_gets_error_ack() {
        let f = fixture(Duration::ZERO).await;
        let (victim, incident_id) = victim_with_incident(&f.storage).await;
        let (s, mut rx) = f.dispatcher.connect(victim).await;
        f.dispatcher.rooms().join(s, &incident_id).await;

        f.dispatcher
            .handle_event(
                s,
                ClientEvent::SendAlert(SendAlert {
                    user_id: None,
                    incident_id: Some(incident_id.clone()),
                    alert_type: Some("dance".to_string()),
                }),
            )
            .await;

        match rx.try_recv().unwrap() {
            ServerEvent::AlertAck(ack) => {
                assert_eq!(ack.status, AckStatus::Error);
                assert!(ack.error.is_some());
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }
}
