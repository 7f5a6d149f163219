//! Membership history: every stint a user has spent on an incident.
//!
//! `incident_members` only holds current membership; this log keeps the
//! stints that ended so a user's past incidents can be listed.

use sqlx::{Row, SqliteConnection};

use crate::error::AppResult;
use crate::model::IncidentHistoryEntry;

use super::incidents::load_incident;
use super::members::Membership;
use super::{Storage, from_millis, parse_column};

/// Record the start of a stint.
pub async fn open_stint(
    conn: &mut SqliteConnection,
    incident_id: &str,
    user_id: &str,
    kind: Membership,
    joined_at: i64,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO membership_history (incident_id, user_id, kind, joined_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(incident_id)
    .bind(user_id)
    .bind(kind.as_str())
    .bind(joined_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Close the open stint of `user_id` in the `kind` set of an incident.
pub async fn close_stint(
    conn: &mut SqliteConnection,
    incident_id: &str,
    user_id: &str,
    kind: Membership,
    left_at: i64,
) -> AppResult<()> {
    sqlx::query(
        r#"
        UPDATE membership_history SET left_at = ?
        WHERE incident_id = ? AND user_id = ? AND kind = ? AND left_at IS NULL
        "#,
    )
    .bind(left_at)
    .bind(incident_id)
    .bind(user_id)
    .bind(kind.as_str())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

impl Storage {
    /// A user's stints on incidents, most recent first.
    ///
    /// With `active_only`, only stints that are still open on unresolved
    /// incidents are returned (the user's current assignments).
    pub async fn incident_history(
        &self,
        user_id: &str,
        active_only: bool,
    ) -> AppResult<Vec<IncidentHistoryEntry>> {
        let mut conn = self.pool.acquire().await?;

        let rows = sqlx::query(
            r#"
            SELECT h.incident_id, h.kind, h.joined_at, h.left_at
            FROM membership_history h
            JOIN incidents i ON i.id = h.incident_id
            WHERE h.user_id = ?
              AND (? = 0 OR (h.left_at IS NULL AND i.status != 'resolved'))
            ORDER BY h.joined_at DESC, h.rowid DESC
            "#,
        )
        .bind(user_id)
        .bind(active_only)
        .fetch_all(&mut *conn)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let incident_id: String = row.try_get("incident_id")?;
            let kind: String = row.try_get("kind")?;
            let left_at: Option<i64> = row.try_get("left_at")?;

            if let Some(incident) = load_incident(&mut conn, &incident_id).await? {
                entries.push(IncidentHistoryEntry {
                    incident,
                    membership: parse_column(&kind)?,
                    joined_at: from_millis(row.try_get("joined_at")?),
                    left_at: left_at.map(from_millis),
                });
            }
        }

        Ok(entries)
    }
}
