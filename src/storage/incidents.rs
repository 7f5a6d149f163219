//! Incident documents: creation, lookup, listing, proximity search, updates
//! and the embedded report log.

use chrono::Utc;
use sqlx::{Row, SqliteConnection};
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::geo::GeoPoint;
use crate::model::{
    Incident, IncidentDraft, IncidentFilter, IncidentPatch, IncidentStatus, Pagination, Report,
};

use super::members::{self, Membership};
use super::{Storage, from_millis, new_id, parse_column, string_column, to_millis};

/// Insert a new incident with its creator as the first victim and the
/// description as the first report. Returns the new id.
pub async fn insert_incident(conn: &mut SqliteConnection, draft: &IncidentDraft) -> AppResult<String> {
    let id = new_id();
    let now = to_millis(Utc::now());

    sqlx::query(
        r#"
        INSERT INTO incidents (id, title, description, status, lng, lat, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&draft.title)
    .bind(&draft.description)
    .bind(IncidentStatus::Open.as_str())
    .bind(draft.location.lng)
    .bind(draft.location.lat)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    members::add_member(conn, &id, &draft.creator_id, Membership::Victim).await?;
    insert_report(conn, &id, &draft.creator_id, draft.initial_report_message()).await?;

    Ok(id)
}

/// Load a full incident document, or `None` if it does not exist.
pub async fn load_incident(conn: &mut SqliteConnection, id: &str) -> AppResult<Option<Incident>> {
    let row = sqlx::query(
        r#"
        SELECT id, title, description, status, lng, lat, created_at
        FROM incidents
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let status: String = row.try_get("status")?;
    let mut incident = Incident {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        status: parse_column(&status)?,
        location: GeoPoint {
            lng: row.try_get("lng")?,
            lat: row.try_get("lat")?,
        },
        victims: Vec::new(),
        volunteers: Vec::new(),
        reports: Vec::new(),
        created_at: from_millis(row.try_get("created_at")?),
    };

    let member_rows = sqlx::query(
        r#"
        SELECT user_id, kind FROM incident_members
        WHERE incident_id = ?
        ORDER BY rowid
        "#,
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    for row in member_rows {
        let user_id: String = row.try_get("user_id")?;
        let kind: String = row.try_get("kind")?;
        if kind == Membership::Volunteer.as_str() {
            incident.volunteers.push(user_id);
        } else {
            incident.victims.push(user_id);
        }
    }

    let report_rows = sqlx::query(
        r#"
        SELECT idx, author_id, message, created_at FROM reports
        WHERE incident_id = ?
        ORDER BY idx
        "#,
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    for row in report_rows {
        let idx: i64 = row.try_get("idx")?;
        let accepted = accepted_volunteers(conn, id, idx).await?;
        incident.reports.push(Report {
            user: row.try_get("author_id")?,
            message: row.try_get("message")?,
            created_at: from_millis(row.try_get("created_at")?),
            assigned_volunteers: accepted,
        });
    }

    Ok(Some(incident))
}

/// Load an incident or fail with `NotFound`.
pub async fn require_incident(conn: &mut SqliteConnection, id: &str) -> AppResult<Incident> {
    load_incident(conn, id)
        .await?
        .ok_or_else(|| AppError::not_found("Incident not found"))
}

/// Current status of an incident, or `None` if it does not exist.
pub async fn incident_status(
    conn: &mut SqliteConnection,
    id: &str,
) -> AppResult<Option<IncidentStatus>> {
    let row = sqlx::query("SELECT status FROM incidents WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    match row {
        Some(row) => {
            let status: String = row.try_get("status")?;
            Ok(Some(parse_column(&status)?))
        }
        None => Ok(None),
    }
}

/// Overwrite the status column. Callers validate the transition.
pub async fn set_status(
    conn: &mut SqliteConnection,
    id: &str,
    status: IncidentStatus,
) -> AppResult<()> {
    let result = sqlx::query("UPDATE incidents SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(id)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::not_found("Incident not found"));
    }
    Ok(())
}

/// Append a report to the incident's log and return it.
pub async fn insert_report(
    conn: &mut SqliteConnection,
    incident_id: &str,
    author_id: &str,
    message: &str,
) -> AppResult<Report> {
    let row = sqlx::query(
        r#"
        SELECT COALESCE(MAX(idx) + 1, 0) AS next_idx FROM reports WHERE incident_id = ?
        "#,
    )
    .bind(incident_id)
    .fetch_one(&mut *conn)
    .await?;
    let idx: i64 = row.try_get("next_idx")?;
    let created_at = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO reports (incident_id, idx, author_id, message, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(incident_id)
    .bind(idx)
    .bind(author_id)
    .bind(message)
    .bind(to_millis(created_at))
    .execute(&mut *conn)
    .await?;

    Ok(Report {
        user: author_id.to_string(),
        message: message.to_string(),
        created_at: from_millis(to_millis(created_at)),
        assigned_volunteers: Vec::new(),
    })
}

/// Load one report by its position in the log.
pub async fn load_report(
    conn: &mut SqliteConnection,
    incident_id: &str,
    idx: i64,
) -> AppResult<Option<Report>> {
    let row = sqlx::query(
        r#"
        SELECT author_id, message, created_at FROM reports
        WHERE incident_id = ? AND idx = ?
        "#,
    )
    .bind(incident_id)
    .bind(idx)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    Ok(Some(Report {
        user: row.try_get("author_id")?,
        message: row.try_get("message")?,
        created_at: from_millis(row.try_get("created_at")?),
        assigned_volunteers: accepted_volunteers(conn, incident_id, idx).await?,
    }))
}

/// Record that `volunteer_id` accepted a report. Returns `false` if already recorded.
pub async fn insert_acceptance(
    conn: &mut SqliteConnection,
    incident_id: &str,
    idx: i64,
    volunteer_id: &str,
) -> AppResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO report_acceptances (incident_id, report_idx, volunteer_id)
        VALUES (?, ?, ?)
        "#,
    )
    .bind(incident_id)
    .bind(idx)
    .bind(volunteer_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

async fn accepted_volunteers(
    conn: &mut SqliteConnection,
    incident_id: &str,
    idx: i64,
) -> AppResult<Vec<String>> {
    let rows = sqlx::query(
        r#"
        SELECT volunteer_id FROM report_acceptances
        WHERE incident_id = ? AND report_idx = ?
        ORDER BY rowid
        "#,
    )
    .bind(incident_id)
    .bind(idx)
    .fetch_all(&mut *conn)
    .await?;

    string_column(&rows, "volunteer_id")
}

/// Apply an administrative patch. Returns `true` if the status changed.
async fn apply_patch(
    conn: &mut SqliteConnection,
    id: &str,
    patch: &IncidentPatch,
) -> AppResult<bool> {
    let current = incident_status(conn, id)
        .await?
        .ok_or_else(|| AppError::not_found("Incident not found"))?;

    if let Some(title) = &patch.title {
        let title = title.trim();
        if title.is_empty() {
            return Err(AppError::validation("\"title\" must not be empty"));
        }
        sqlx::query("UPDATE incidents SET title = ? WHERE id = ?")
            .bind(title)
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }

    if let Some(description) = &patch.description {
        sqlx::query("UPDATE incidents SET description = ? WHERE id = ?")
            .bind(description)
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }

    if let Some(location) = &patch.location {
        let point = GeoPoint::try_from(location.clone()).map_err(AppError::Validation)?;
        sqlx::query("UPDATE incidents SET lng = ?, lat = ? WHERE id = ?")
            .bind(point.lng)
            .bind(point.lat)
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }

    match patch.status {
        Some(next) if next != current => {
            if !current.can_transition_to(next) {
                return Err(AppError::conflict(format!(
                    "Incident is {current} and cannot move to {next}"
                )));
            }
            set_status(conn, id, next).await?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

impl Storage {
    /// Create an incident from a validated draft.
    ///
    /// The creator becomes the first victim and the description becomes the
    /// first report. The creator's back-reference is pointed at the new incident.
    pub async fn create_incident(&self, draft: &IncidentDraft) -> AppResult<Incident> {
        let mut tx = self.begin().await?;
        let id = insert_incident(&mut tx, draft).await?;
        members::refresh_back_reference(&mut tx, &draft.creator_id).await?;
        let incident = require_incident(&mut tx, &id).await?;
        tx.commit().await?;

        debug!(incident_id = %incident.id, "Incident created");
        Ok(incident)
    }

    /// Fetch an incident by id.
    pub async fn get_incident(&self, id: &str) -> AppResult<Incident> {
        let mut conn = self.pool.acquire().await?;
        require_incident(&mut conn, id).await
    }

    /// One page of incidents, newest first.
    pub async fn list_incidents(
        &self,
        page: u32,
        limit: u32,
        filter: &IncidentFilter,
    ) -> AppResult<(Vec<Incident>, Pagination)> {
        let mut conn = self.pool.acquire().await?;

        // The volunteer filter binds the same id in both statements.
        let (count_sql, page_sql) = match filter.available_for {
            Some(_) => (
                r#"
                SELECT COUNT(*) AS total FROM incidents
                WHERE status != 'resolved'
                  AND id NOT IN (
                    SELECT incident_id FROM incident_members
                    WHERE user_id = ? AND kind = 'volunteer'
                  )
                "#,
                r#"
                SELECT id FROM incidents
                WHERE status != 'resolved'
                  AND id NOT IN (
                    SELECT incident_id FROM incident_members
                    WHERE user_id = ? AND kind = 'volunteer'
                  )
                ORDER BY created_at DESC, rowid DESC
                LIMIT ? OFFSET ?
                "#,
            ),
            None => (
                "SELECT COUNT(*) AS total FROM incidents",
                r#"
                SELECT id FROM incidents
                ORDER BY created_at DESC, rowid DESC
                LIMIT ? OFFSET ?
                "#,
            ),
        };

        let mut count_query = sqlx::query(count_sql);
        if let Some(volunteer) = &filter.available_for {
            count_query = count_query.bind(volunteer);
        }
        let total: i64 = count_query.fetch_one(&mut *conn).await?.try_get("total")?;

        let pagination = Pagination::new(page, limit, total.max(0) as u64);

        let mut page_query = sqlx::query(page_sql);
        if let Some(volunteer) = &filter.available_for {
            page_query = page_query.bind(volunteer);
        }
        let rows = page_query
            .bind(i64::from(limit))
            .bind(pagination.offset() as i64)
            .fetch_all(&mut *conn)
            .await?;

        let mut incidents = Vec::with_capacity(rows.len());
        for id in string_column(&rows, "id")? {
            if let Some(incident) = load_incident(&mut conn, &id).await? {
                incidents.push(incident);
            }
        }

        Ok((incidents, pagination))
    }

    /// Incidents within `radius_meters` of `point`, nearest first.
    pub async fn list_near(
        &self,
        point: Option<GeoPoint>,
        radius_meters: f64,
    ) -> AppResult<Vec<Incident>> {
        let point = point.ok_or_else(|| AppError::validation("User location not provided"))?;
        if !radius_meters.is_finite() || radius_meters <= 0.0 {
            return Err(AppError::validation("radius must be a positive number"));
        }

        let (lat_delta, lng_delta) = point.bounding_deltas(radius_meters);
        let (min_lng, max_lng) = if point.lng - lng_delta < -180.0 || point.lng + lng_delta > 180.0 {
            // Box wraps the antimeridian; rely on the exact distance check.
            (-180.0, 180.0)
        } else {
            (point.lng - lng_delta, point.lng + lng_delta)
        };

        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            r#"
            SELECT id FROM incidents
            WHERE lat BETWEEN ? AND ? AND lng BETWEEN ? AND ?
            "#,
        )
        .bind(point.lat - lat_delta)
        .bind(point.lat + lat_delta)
        .bind(min_lng)
        .bind(max_lng)
        .fetch_all(&mut *conn)
        .await?;

        let mut nearby = Vec::new();
        for id in string_column(&rows, "id")? {
            if let Some(incident) = load_incident(&mut conn, &id).await? {
                let distance = point.distance_meters(&incident.location);
                if distance <= radius_meters {
                    nearby.push((distance, incident));
                }
            }
        }
        nearby.sort_by(|a, b| a.0.total_cmp(&b.0));

        Ok(nearby.into_iter().map(|(_, incident)| incident).collect())
    }

    /// Apply a partial update. A status change recomputes the back-references
    /// of everyone attached to the incident.
    pub async fn update_incident(&self, id: &str, patch: &IncidentPatch) -> AppResult<Incident> {
        let mut tx = self.begin().await?;
        let status_changed = apply_patch(&mut tx, id, patch).await?;
        if status_changed {
            members::refresh_back_references_for_incident(&mut tx, id).await?;
        }
        let incident = require_incident(&mut tx, id).await?;
        tx.commit().await?;

        Ok(incident)
    }

    /// Append a report to an incident's log.
    pub async fn append_report(
        &self,
        incident_id: &str,
        author_id: &str,
        message: &str,
    ) -> AppResult<Report> {
        if message.trim().is_empty() {
            return Err(AppError::validation("\"message\" is required"));
        }

        let mut tx = self.begin().await?;
        if incident_status(&mut tx, incident_id).await?.is_none() {
            return Err(AppError::not_found("Incident not found"));
        }
        let report = insert_report(&mut tx, incident_id, author_id, message).await?;
        tx.commit().await?;

        Ok(report)
    }

    /// Delete an incident with its memberships, reports and chat log.
    pub async fn delete_incident(&self, id: &str) -> AppResult<()> {
        let mut tx = self.begin().await?;
        if incident_status(&mut tx, id).await?.is_none() {
            return Err(AppError::not_found("Incident not found"));
        }

        let former = members::member_ids(&mut tx, id).await?;

        for statement in [
            "DELETE FROM report_acceptances WHERE incident_id = ?",
            "DELETE FROM reports WHERE incident_id = ?",
            "DELETE FROM incident_members WHERE incident_id = ?",
            "DELETE FROM membership_history WHERE incident_id = ?",
            "DELETE FROM chat_messages WHERE incident_id = ?",
            "DELETE FROM incidents WHERE id = ?",
        ] {
            sqlx::query(statement).bind(id).execute(&mut *tx).await?;
        }

        for user_id in &former {
            members::refresh_back_reference(&mut tx, user_id).await?;
        }
        // Stragglers whose back-reference pointed here without membership.
        sqlx::query("UPDATE users SET assigned_incident = NULL WHERE assigned_incident = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(incident_id = %id, former_members = former.len(), "Incident deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    async fn setup() -> (Storage, String) {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let victim = storage
            .create_user("Asha", Role::Victim, "victim-token")
            .await
            .unwrap();
        (storage, victim.id)
    }

    fn draft(creator: &str, title: &str, lng: f64, lat: f64) -> IncidentDraft {
        IncidentDraft {
            title: title.to_string(),
            description: format!("{title} near the river"),
            location: GeoPoint::new(lng, lat).unwrap(),
            creator_id: creator.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_incident_synthesizes_first_report() {
        let (storage, victim) = setup().await;

        let incident = storage
            .create_incident(&draft(&victim, "Flood", 77.0, 12.0))
            .await
            .unwrap();

        assert_eq!(incident.status, IncidentStatus::Open);
        assert_eq!(incident.victims, vec![victim.clone()]);
        assert!(incident.volunteers.is_empty());
        assert_eq!(incident.reports.len(), 1);
        assert_eq!(incident.reports[0].user, victim);
        assert_eq!(incident.reports[0].message, "Flood near the river");

        let user = storage.get_user(&victim).await.unwrap().unwrap();
        assert_eq!(user.assigned_incident.as_deref(), Some(incident.id.as_str()));
    }

    #[tokio::test]
    async fn test_get_missing_incident() {
        let (storage, _) = setup().await;
        let err = storage.get_incident("nope").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_paged() {
        let (storage, victim) = setup().await;
        for i in 0..5 {
            storage
                .create_incident(&draft(&victim, &format!("Incident {i}"), 77.0, 12.0))
                .await
                .unwrap();
        }

        let (items, pagination) = storage
            .list_incidents(2, 2, &IncidentFilter::default())
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(pagination.total_items, 5);
        assert_eq!(pagination.total_pages, 3);

        let (items, _) = storage
            .list_incidents(3, 2, &IncidentFilter::default())
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_list_near_filters_by_distance() {
        let (storage, victim) = setup().await;
        let close = storage
            .create_incident(&draft(&victim, "Close", 77.001, 12.001))
            .await
            .unwrap();
        storage
            .create_incident(&draft(&victim, "Far", 78.0, 13.0))
            .await
            .unwrap();

        let near = storage
            .list_near(Some(GeoPoint::new(77.0, 12.0).unwrap()), 10_000.0)
            .await
            .unwrap();
        assert_eq!(near.len(), 1);
        assert_eq!(near[0].id, close.id);

        let err = storage.list_near(None, 10_000.0).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_append_report_and_missing_incident() {
        let (storage, victim) = setup().await;
        let incident = storage
            .create_incident(&draft(&victim, "Flood", 77.0, 12.0))
            .await
            .unwrap();

        let report = storage
            .append_report(&incident.id, &victim, "Water is rising")
            .await
            .unwrap();
        assert_eq!(report.message, "Water is rising");

        let incident = storage.get_incident(&incident.id).await.unwrap();
        assert_eq!(incident.reports.len(), 2);
        assert_eq!(incident.reports[1].message, "Water is rising");

        let err = storage
            .append_report("missing", &victim, "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_rejects_leaving_resolved() {
        let (storage, victim) = setup().await;
        let incident = storage
            .create_incident(&draft(&victim, "Flood", 77.0, 12.0))
            .await
            .unwrap();

        let resolved = storage
            .update_incident(
                &incident.id,
                &IncidentPatch {
                    status: Some(IncidentStatus::Resolved),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(resolved.status, IncidentStatus::Resolved);

        let user = storage.get_user(&victim).await.unwrap().unwrap();
        assert!(user.assigned_incident.is_none());

        let err = storage
            .update_incident(
                &incident.id,
                &IncidentPatch {
                    status: Some(IncidentStatus::Open),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_update_missing_incident() {
        let (storage, _) = setup().await;
        let err = storage
            .update_incident("missing", &IncidentPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_clears_back_reference() {
        let (storage, victim) = setup().await;
        let incident = storage
            .create_incident(&draft(&victim, "Flood", 77.0, 12.0))
            .await
            .unwrap();

        storage.delete_incident(&incident.id).await.unwrap();

        let err = storage.get_incident(&incident.id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        let user = storage.get_user(&victim).await.unwrap().unwrap();
        assert!(user.assigned_incident.is_none());

        let err = storage.delete_incident(&incident.id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
