//! Assignment engine: who may join or leave an incident.
//!
//! # Invariants
//!
//! - A volunteer appears in the `volunteers` set of at most one unresolved incident.
//! - An incident whose `victims` and `volunteers` are both empty is `resolved`.
//! - A user's `assigned_incident` back-reference equals the most recently
//!   joined unresolved incident they belong to (or is empty).
//!
//! Each operation takes a per-user advisory lock for the acting user, then
//! performs its reads and writes in one write transaction from
//! [`Storage::begin`], which also holds the store's writer lock. Locks are
//! always taken in that order. The transaction keeps each document change
//! atomic. The back-reference is recomputed from membership inside the same
//! transaction instead of being written independently.

use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::locks::KeyedLocks;
use crate::model::{Identity, Incident, IncidentDraft, IncidentPatch, IncidentStatus, Report, Role};
use crate::storage::incidents::{
    incident_status, insert_acceptance, insert_incident, load_report, require_incident, set_status,
};
use crate::storage::members::{
    self, Membership, active_incidents_for, add_member, is_member_of, member_count,
    refresh_back_reference, refresh_back_references_for_incident, remove_member,
};
use crate::storage::users::user_exists;
use crate::storage::Storage;

/// Result of a consistency sweep. Empty lists mean every invariant holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyReport {
    pub double_assigned_volunteers: Vec<String>,
    pub empty_unresolved_incidents: Vec<String>,
    pub stale_back_references: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.double_assigned_volunteers.is_empty()
            && self.empty_unresolved_incidents.is_empty()
            && self.stale_back_references.is_empty()
    }
}

/// State machine for incident membership.
#[derive(Clone)]
pub struct AssignmentEngine {
    storage: Storage,
    locks: KeyedLocks,
}

impl AssignmentEngine {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            locks: KeyedLocks::new(),
        }
    }

    /// Open a new incident on behalf of its creator.
    ///
    /// A creator who is still attached to an unresolved incident must resolve
    /// it first.
    pub async fn report_incident(&self, draft: &IncidentDraft) -> AppResult<Incident> {
        let _guard = self.locks.acquire(&draft.creator_id).await;
        let mut tx = self.storage.begin().await?;

        if let Some(active) = first_active_incident(&mut tx, &draft.creator_id).await? {
            warn!(
                user_id = %draft.creator_id,
                incident_id = %active,
                "Rejected incident report while creator has an active incident"
            );
            return Err(AppError::conflict(
                "You already have an active incident; resolve it before reporting another",
            ));
        }

        let id = insert_incident(&mut tx, draft).await?;
        refresh_back_reference(&mut tx, &draft.creator_id).await?;
        let incident = require_incident(&mut tx, &id).await?;
        tx.commit().await?;

        info!(incident_id = %incident.id, user_id = %draft.creator_id, "Incident reported");
        Ok(incident)
    }

    /// Add a volunteer to an incident.
    ///
    /// Fails with `Conflict` if the volunteer already belongs to a different
    /// unresolved incident, or if this incident is resolved. Repeating the
    /// call is a no-op.
    pub async fn assign_volunteer(&self, incident_id: &str, volunteer: &Identity) -> AppResult<Incident> {
        if volunteer.role != Role::Volunteer {
            return Err(AppError::forbidden("Only volunteers can be assigned to incidents"));
        }

        let _guard = self.locks.acquire(&volunteer.id).await;
        let mut tx = self.storage.begin().await?;

        let status = incident_status(&mut tx, incident_id)
            .await?
            .ok_or_else(|| AppError::not_found("Incident not found"))?;
        if status.is_resolved() {
            return Err(AppError::conflict("Incident is already resolved"));
        }

        let elsewhere =
            active_incidents_for(&mut tx, &volunteer.id, Membership::Volunteer, Some(incident_id))
                .await?;
        if let Some(other) = elsewhere.first() {
            warn!(
                user_id = %volunteer.id,
                incident_id = %incident_id,
                assigned_to = %other,
                "Rejected assignment: volunteer already assigned elsewhere"
            );
            return Err(AppError::conflict(
                "Volunteer is already assigned to another incident",
            ));
        }

        let added = add_member(&mut tx, incident_id, &volunteer.id, Membership::Volunteer).await?;
        refresh_back_reference(&mut tx, &volunteer.id).await?;
        let incident = require_incident(&mut tx, incident_id).await?;
        tx.commit().await?;

        if added {
            info!(incident_id = %incident_id, user_id = %volunteer.id, "Volunteer assigned");
        }
        Ok(incident)
    }

    /// Add a user to an incident's victims. Repeating the call is a no-op.
    pub async fn add_victim(&self, incident_id: &str, user_id: &str) -> AppResult<Incident> {
        let _guard = self.locks.acquire(user_id).await;
        let mut tx = self.storage.begin().await?;

        let status = incident_status(&mut tx, incident_id)
            .await?
            .ok_or_else(|| AppError::not_found("Incident not found"))?;
        if !user_exists(&mut tx, user_id).await? {
            return Err(AppError::not_found("User not found"));
        }
        if status.is_resolved() {
            return Err(AppError::conflict("Incident is already resolved"));
        }

        let added = add_member(&mut tx, incident_id, user_id, Membership::Victim).await?;
        refresh_back_reference(&mut tx, user_id).await?;
        let incident = require_incident(&mut tx, incident_id).await?;
        tx.commit().await?;

        if added {
            info!(incident_id = %incident_id, user_id = %user_id, "Victim added");
        }
        Ok(incident)
    }

    /// Detach `acting` from an incident.
    ///
    /// The user leaves the set matching their role. If no victims and no
    /// volunteers remain, the incident becomes `resolved` and every remaining
    /// back-reference to it is cleared. Otherwise `requested`, if it names a
    /// non-resolved status, is applied.
    pub async fn resolve_for(
        &self,
        incident_id: &str,
        acting: &Identity,
        requested: Option<IncidentStatus>,
    ) -> AppResult<Incident> {
        let _guard = self.locks.acquire(&acting.id).await;
        let mut tx = self.storage.begin().await?;

        let status = incident_status(&mut tx, incident_id)
            .await?
            .ok_or_else(|| AppError::not_found("Incident not found"))?;

        let removed = match Membership::for_role(acting.role) {
            Some(kind) => remove_member(&mut tx, incident_id, &acting.id, kind).await?,
            None => false,
        };
        refresh_back_reference(&mut tx, &acting.id).await?;

        if member_count(&mut tx, incident_id).await? == 0 {
            if !status.is_resolved() {
                set_status(&mut tx, incident_id, IncidentStatus::Resolved).await?;
                info!(incident_id = %incident_id, "Incident resolved: no members remain");
            }
            refresh_back_references_for_incident(&mut tx, incident_id).await?;
        } else if let Some(next) = requested.filter(|s| !s.is_resolved()) {
            if next != status && status.can_transition_to(next) {
                set_status(&mut tx, incident_id, next).await?;
            }
        }

        let incident = require_incident(&mut tx, incident_id).await?;
        tx.commit().await?;

        if removed {
            info!(incident_id = %incident_id, user_id = %acting.id, role = %acting.role, "Member left incident");
        }
        Ok(incident)
    }

    /// Change an incident's status on behalf of `actor`.
    ///
    /// Administrators set the status directly. Members asking for `resolved`
    /// leave the incident through [`resolve_for`](Self::resolve_for); other
    /// statuses are applied if the actor is a member.
    pub async fn change_status(
        &self,
        incident_id: &str,
        actor: &Identity,
        status: IncidentStatus,
    ) -> AppResult<Incident> {
        if actor.role == Role::Admin {
            let patch = IncidentPatch {
                status: Some(status),
                ..Default::default()
            };
            let incident = self.storage.update_incident(incident_id, &patch).await?;
            info!(incident_id = %incident_id, status = %status, "Status set by administrator");
            return Ok(incident);
        }

        if status.is_resolved() {
            return self.resolve_for(incident_id, actor, None).await;
        }

        let incident = self.storage.get_incident(incident_id).await?;
        if !incident.is_member(&actor.id) {
            return Err(AppError::forbidden("Only incident members can change its status"));
        }
        if !incident.status.can_transition_to(status) {
            return Err(AppError::conflict(format!(
                "Incident is {} and cannot move to {status}",
                incident.status
            )));
        }

        let patch = IncidentPatch {
            status: Some(status),
            ..Default::default()
        };
        self.storage.update_incident(incident_id, &patch).await
    }

    /// Record that a volunteer has claimed a specific report. Idempotent.
    ///
    /// Only volunteers currently on the incident may claim its reports.
    pub async fn accept_report(
        &self,
        incident_id: &str,
        report_index: i64,
        volunteer_id: &str,
    ) -> AppResult<Report> {
        let mut tx = self.storage.begin().await?;

        if incident_status(&mut tx, incident_id).await?.is_none() {
            return Err(AppError::not_found("Incident not found"));
        }
        if load_report(&mut tx, incident_id, report_index).await?.is_none() {
            return Err(AppError::not_found("Report not found"));
        }
        if !is_member_of(&mut tx, incident_id, volunteer_id, Membership::Volunteer).await? {
            return Err(AppError::forbidden(
                "Only volunteers assigned to this incident can accept its reports",
            ));
        }

        insert_acceptance(&mut tx, incident_id, report_index, volunteer_id).await?;
        let report = load_report(&mut tx, incident_id, report_index)
            .await?
            .ok_or_else(|| AppError::not_found("Report not found"))?;
        tx.commit().await?;

        Ok(report)
    }

    /// Check every assignment invariant against the store.
    pub async fn audit(&self) -> AppResult<ConsistencyReport> {
        let mut tx = self.storage.begin().await?;
        let report = ConsistencyReport {
            double_assigned_volunteers: members::double_assigned_volunteers(&mut tx).await?,
            empty_unresolved_incidents: members::empty_unresolved_incidents(&mut tx).await?,
            stale_back_references: members::stale_back_references(&mut tx).await?,
        };
        tx.commit().await?;

        if !report.is_consistent() {
            warn!(?report, "Assignment invariants violated");
        }
        Ok(report)
    }
}

async fn first_active_incident(conn: &mut SqliteConnection, user_id: &str) -> AppResult<Option<String>> {
    for kind in [Membership::Victim, Membership::Volunteer] {
        if let Some(id) = active_incidents_for(conn, user_id, kind, None).await?.into_iter().next() {
            return Ok(Some(id));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::GeoPoint;

    struct Fixture {
        storage: Storage,
        engine: AssignmentEngine,
    }

    impl Fixture {
        async fn new() -> Self {
            let storage = Storage::new("sqlite::memory:").await.unwrap();
            let engine = AssignmentEngine::new(storage.clone());
            Self { storage, engine }
        }

        async fn user(&self, name: &str, role: Role) -> Identity {
            self.storage
                .create_user(name, role, &format!("{name}-token"))
                .await
                .unwrap()
                .identity()
        }

        async fn incident(&self, creator: &Identity, title: &str) -> Incident {
            self.engine
                .report_incident(&IncidentDraft {
                    title: title.to_string(),
                    description: format!("{title} reported"),
                    location: GeoPoint::new(77.0, 12.0).unwrap(),
                    creator_id: creator.id.clone(),
                })
                .await
                .unwrap()
        }

        async fn back_reference(&self, user: &Identity) -> Option<String> {
            self.storage
                .get_user(&user.id)
                .await
                .unwrap()
                .unwrap()
                .assigned_incident
        }

        async fn assert_consistent(&self) {
            let report = self.engine.audit().await.unwrap();
            assert!(report.is_consistent(), "{report:?}");
        }
    }

    #[tokio::test]
    async fn test_assign_volunteer_sets_back_reference() {
        let f = Fixture::new().await;
        let victim = f.user("v1", Role::Victim).await;
        let volunteer = f.user("vol1", Role::Volunteer).await;
        let incident = f.incident(&victim, "Flood").await;

        let updated = f.engine.assign_volunteer(&incident.id, &volunteer).await.unwrap();

        assert_eq!(updated.volunteers, vec![volunteer.id.clone()]);
        assert_eq!(f.back_reference(&volunteer).await, Some(incident.id.clone()));
        f.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_assign_is_idempotent() {
        let f = Fixture::new().await;
        let victim = f.user("v1", Role::Victim).await;
        let volunteer = f.user("vol1", Role::Volunteer).await;
        let incident = f.incident(&victim, "Flood").await;

        let once = f.engine.assign_volunteer(&incident.id, &volunteer).await.unwrap();
        let twice = f.engine.assign_volunteer(&incident.id, &volunteer).await.unwrap();

        assert_eq!(once.volunteers, twice.volunteers);
        assert_eq!(twice.volunteers.len(), 1);
    }

    #[tokio::test]
    async fn test_second_assignment_conflicts() {
        let f = Fixture::new().await;
        let v1 = f.user("v1", Role::Victim).await;
        let v2 = f.user("v2", Role::Victim).await;
        let volunteer = f.user("vol1", Role::Volunteer).await;
        let first = f.incident(&v1, "Flood").await;
        let second = f.incident(&v2, "Fire").await;

        f.engine.assign_volunteer(&first.id, &volunteer).await.unwrap();
        let err = f
            .engine
            .assign_volunteer(&second.id, &volunteer)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Conflict(_)));
        let second = f.storage.get_incident(&second.id).await.unwrap();
        assert!(second.volunteers.is_empty());
        f.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_assignment_allowed_after_previous_incident_resolves() {
        let f = Fixture::new().await;
        let v1 = f.user("v1", Role::Victim).await;
        let v2 = f.user("v2", Role::Victim).await;
        let volunteer = f.user("vol1", Role::Volunteer).await;
        let admin = f.user("admin", Role::Admin).await;
        let first = f.incident(&v1, "Flood").await;
        let second = f.incident(&v2, "Fire").await;

        f.engine.assign_volunteer(&first.id, &volunteer).await.unwrap();
        f.engine
            .change_status(&first.id, &admin, IncidentStatus::Resolved)
            .await
            .unwrap();

        assert_eq!(f.back_reference(&volunteer).await, None);
        f.engine.assign_volunteer(&second.id, &volunteer).await.unwrap();
        assert_eq!(f.back_reference(&volunteer).await, Some(second.id.clone()));
        f.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_assign_requires_volunteer_role_and_open_incident() {
        let f = Fixture::new().await;
        let victim = f.user("v1", Role::Victim).await;
        let volunteer = f.user("vol1", Role::Volunteer).await;
        let incident = f.incident(&victim, "Flood").await;

        let err = f.engine.assign_volunteer(&incident.id, &victim).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let err = f.engine.assign_volunteer("missing", &volunteer).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        f.engine.resolve_for(&incident.id, &victim, None).await.unwrap();
        let err = f.engine.assign_volunteer(&incident.id, &volunteer).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_sole_victim_resolving_resolves_incident() {
        let f = Fixture::new().await;
        let victim = f.user("v1", Role::Victim).await;
        let incident = f.incident(&victim, "Flood").await;
        assert_eq!(f.back_reference(&victim).await, Some(incident.id.clone()));

        let resolved = f.engine.resolve_for(&incident.id, &victim, None).await.unwrap();

        assert_eq!(resolved.status, IncidentStatus::Resolved);
        assert!(resolved.victims.is_empty());
        assert_eq!(f.back_reference(&victim).await, None);
        f.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_partial_resolve_keeps_incident_active() {
        let f = Fixture::new().await;
        let victim = f.user("v1", Role::Victim).await;
        let volunteer = f.user("vol1", Role::Volunteer).await;
        let incident = f.incident(&victim, "Flood").await;
        f.engine.assign_volunteer(&incident.id, &volunteer).await.unwrap();

        let after = f
            .engine
            .resolve_for(&incident.id, &victim, Some(IncidentStatus::InProgress))
            .await
            .unwrap();

        assert_eq!(after.status, IncidentStatus::InProgress);
        assert!(after.victims.is_empty());
        assert_eq!(after.volunteers, vec![volunteer.id.clone()]);
        assert_eq!(f.back_reference(&victim).await, None);
        assert_eq!(f.back_reference(&volunteer).await, Some(incident.id.clone()));

        let last = f.engine.resolve_for(&incident.id, &volunteer, None).await.unwrap();
        assert_eq!(last.status, IncidentStatus::Resolved);
        assert_eq!(f.back_reference(&volunteer).await, None);
        f.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_requested_resolved_with_members_left_is_not_forced() {
        let f = Fixture::new().await;
        let victim = f.user("v1", Role::Victim).await;
        let volunteer = f.user("vol1", Role::Volunteer).await;
        let incident = f.incident(&victim, "Flood").await;
        f.engine.assign_volunteer(&incident.id, &volunteer).await.unwrap();

        let after = f
            .engine
            .change_status(&incident.id, &volunteer, IncidentStatus::Resolved)
            .await
            .unwrap();

        assert_eq!(after.status, IncidentStatus::Open);
        assert_eq!(after.victims, vec![victim.id.clone()]);
        assert!(after.volunteers.is_empty());
        f.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_member_status_change_requires_membership() {
        let f = Fixture::new().await;
        let victim = f.user("v1", Role::Victim).await;
        let outsider = f.user("vol1", Role::Volunteer).await;
        let incident = f.incident(&victim, "Flood").await;

        let err = f
            .engine
            .change_status(&incident.id, &outsider, IncidentStatus::InProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let updated = f
            .engine
            .change_status(&incident.id, &victim, IncidentStatus::InProgress)
            .await
            .unwrap();
        assert_eq!(updated.status, IncidentStatus::InProgress);
    }

    #[tokio::test]
    async fn test_report_while_active_conflicts() {
        let f = Fixture::new().await;
        let victim = f.user("v1", Role::Victim).await;
        let incident = f.incident(&victim, "Flood").await;

        let err = f
            .engine
            .report_incident(&IncidentDraft {
                title: "Second".to_string(),
                description: String::new(),
                location: GeoPoint::new(77.0, 12.0).unwrap(),
                creator_id: victim.id.clone(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        f.engine.resolve_for(&incident.id, &victim, None).await.unwrap();
        f.incident(&victim, "Second").await;
        f.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_add_victim() {
        let f = Fixture::new().await;
        let v1 = f.user("v1", Role::Victim).await;
        let v2 = f.user("v2", Role::Victim).await;
        let incident = f.incident(&v1, "Flood").await;

        let updated = f.engine.add_victim(&incident.id, &v2.id).await.unwrap();
        let again = f.engine.add_victim(&incident.id, &v2.id).await.unwrap();
        assert_eq!(updated.victims, again.victims);
        assert_eq!(again.victims.len(), 2);
        assert_eq!(f.back_reference(&v2).await, Some(incident.id.clone()));

        let err = f.engine.add_victim(&incident.id, "ghost").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        let err = f.engine.add_victim("missing", &v2.id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        f.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_accept_report() {
        let f = Fixture::new().await;
        let victim = f.user("v1", Role::Victim).await;
        let volunteer = f.user("vol1", Role::Volunteer).await;
        let outsider = f.user("vol2", Role::Volunteer).await;
        let incident = f.incident(&victim, "Flood").await;
        f.engine.assign_volunteer(&incident.id, &volunteer).await.unwrap();

        let report = f.engine.accept_report(&incident.id, 0, &volunteer.id).await.unwrap();
        assert_eq!(report.assigned_volunteers, vec![volunteer.id.clone()]);

        let again = f.engine.accept_report(&incident.id, 0, &volunteer.id).await.unwrap();
        assert_eq!(again.assigned_volunteers.len(), 1);

        let err = f.engine.accept_report(&incident.id, 5, &volunteer.id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        let err = f.engine.accept_report(&incident.id, -1, &volunteer.id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        let err = f.engine.accept_report("missing", 0, &volunteer.id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let err = f.engine.accept_report(&incident.id, 0, &outsider.id).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        let report = f.engine.accept_report(&incident.id, 0, &volunteer.id).await.unwrap();
        assert_eq!(report.assigned_volunteers, vec![volunteer.id.clone()]);
    }

    #[tokio::test]
    async fn test_concurrent_assignments_leave_one_winner() {
        let f = Fixture::new().await;
        let v1 = f.user("v1", Role::Victim).await;
        let v2 = f.user("v2", Role::Victim).await;
        let volunteer = f.user("vol1", Role::Volunteer).await;
        let first = f.incident(&v1, "Flood").await;
        let second = f.incident(&v2, "Fire").await;

        let (a, b) = tokio::join!(
            f.engine.assign_volunteer(&first.id, &volunteer),
            f.engine.assign_volunteer(&second.id, &volunteer),
        );

        assert!(a.is_ok() != b.is_ok(), "exactly one assignment must win");
        let loser = if a.is_err() { a } else { b };
        assert!(matches!(loser.unwrap_err(), AppError::Conflict(_)));
        f.assert_consistent().await;
    }
}
