//! Incident membership rows and the derived user back-reference.

use chrono::Utc;
use sqlx::{Row, SqliteConnection};

use crate::error::AppResult;
use crate::model::Role;

use super::history;
use super::{string_column, to_millis};

/// Which membership set of an incident a user belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Membership {
    Victim,
    Volunteer,
}

impl Membership {
    pub fn as_str(&self) -> &'static str {
        match self {
            Membership::Victim => "victim",
            Membership::Volunteer => "volunteer",
        }
    }

    /// The set a user of `role` is placed in; admins belong to neither.
    pub fn for_role(role: Role) -> Option<Self> {
        match role {
            Role::Victim => Some(Membership::Victim),
            Role::Volunteer => Some(Membership::Volunteer),
            Role::Admin => None,
        }
    }
}

/// Add `user_id` to a membership set. Returns `false` if already present.
pub async fn add_member(
    conn: &mut SqliteConnection,
    incident_id: &str,
    user_id: &str,
    kind: Membership,
) -> AppResult<bool> {
    let now = to_millis(Utc::now());
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO incident_members (incident_id, user_id, kind, joined_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(incident_id)
    .bind(user_id)
    .bind(kind.as_str())
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let added = result.rows_affected() > 0;
    if added {
        history::open_stint(conn, incident_id, user_id, kind, now).await?;
    }
    Ok(added)
}

/// Remove `user_id` from a membership set. Returns `false` if absent.
pub async fn remove_member(
    conn: &mut SqliteConnection,
    incident_id: &str,
    user_id: &str,
    kind: Membership,
) -> AppResult<bool> {
    let result = sqlx::query(
        r#"
        DELETE FROM incident_members
        WHERE incident_id = ? AND user_id = ? AND kind = ?
        "#,
    )
    .bind(incident_id)
    .bind(user_id)
    .bind(kind.as_str())
    .execute(&mut *conn)
    .await?;

    let removed = result.rows_affected() > 0;
    if removed {
        history::close_stint(conn, incident_id, user_id, kind, to_millis(Utc::now())).await?;
    }
    Ok(removed)
}

/// Whether `user_id` is currently in the `kind` set of an incident.
pub async fn is_member_of(
    conn: &mut SqliteConnection,
    incident_id: &str,
    user_id: &str,
    kind: Membership,
) -> AppResult<bool> {
    let row = sqlx::query(
        r#"
        SELECT 1 AS found FROM incident_members
        WHERE incident_id = ? AND user_id = ? AND kind = ?
        "#,
    )
    .bind(incident_id)
    .bind(user_id)
    .bind(kind.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.is_some())
}

/// Total number of victims plus volunteers on an incident.
pub async fn member_count(conn: &mut SqliteConnection, incident_id: &str) -> AppResult<i64> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS total FROM incident_members WHERE incident_id = ?
        "#,
    )
    .bind(incident_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(row.try_get("total")?)
}

/// All user ids in either set of an incident, in join order, deduplicated.
pub async fn member_ids(conn: &mut SqliteConnection, incident_id: &str) -> AppResult<Vec<String>> {
    let rows = sqlx::query(
        r#"
        SELECT user_id FROM incident_members
        WHERE incident_id = ?
        GROUP BY user_id
        ORDER BY MIN(rowid)
        "#,
    )
    .bind(incident_id)
    .fetch_all(&mut *conn)
    .await?;

    string_column(&rows, "user_id")
}

/// Unresolved incidents, other than `except_incident`, in whose `kind` set
/// the user currently appears.
pub async fn active_incidents_for(
    conn: &mut SqliteConnection,
    user_id: &str,
    kind: Membership,
    except_incident: Option<&str>,
) -> AppResult<Vec<String>> {
    let rows = sqlx::query(
        r#"
        SELECT m.incident_id
        FROM incident_members m
        JOIN incidents i ON i.id = m.incident_id
        WHERE m.user_id = ? AND m.kind = ? AND i.status != 'resolved'
          AND m.incident_id != COALESCE(?, '')
        ORDER BY m.rowid
        "#,
    )
    .bind(user_id)
    .bind(kind.as_str())
    .bind(except_incident)
    .fetch_all(&mut *conn)
    .await?;

    string_column(&rows, "incident_id")
}

/// Recompute a user's `assigned_incident` from membership: the most recently
/// joined unresolved incident, or NULL.
pub async fn refresh_back_reference(conn: &mut SqliteConnection, user_id: &str) -> AppResult<()> {
    sqlx::query(
        r#"
        UPDATE users SET assigned_incident = (
            SELECT m.incident_id
            FROM incident_members m
            JOIN incidents i ON i.id = m.incident_id
            WHERE m.user_id = users.id AND i.status != 'resolved'
            ORDER BY m.rowid DESC
            LIMIT 1
        )
        WHERE id = ?
        "#,
    )
    .bind(user_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Recompute the back-reference of every user that points at, or is a member
/// of, `incident_id`.
pub async fn refresh_back_references_for_incident(
    conn: &mut SqliteConnection,
    incident_id: &str,
) -> AppResult<()> {
    let rows = sqlx::query(
        r#"
        SELECT user_id AS id FROM incident_members WHERE incident_id = ?
        UNION
        SELECT id FROM users WHERE assigned_incident = ?
        "#,
    )
    .bind(incident_id)
    .bind(incident_id)
    .fetch_all(&mut *conn)
    .await?;

    for row in rows {
        let user_id: String = row.try_get("id")?;
        refresh_back_reference(conn, &user_id).await?;
    }

    Ok(())
}

/// Users whose stored back-reference disagrees with what membership implies.
pub async fn stale_back_references(conn: &mut SqliteConnection) -> AppResult<Vec<String>> {
    let rows = sqlx::query(
        r#"
        SELECT u.id
        FROM users u
        WHERE COALESCE(u.assigned_incident, '') != COALESCE((
            SELECT m.incident_id
            FROM incident_members m
            JOIN incidents i ON i.id = m.incident_id
            WHERE m.user_id = u.id AND i.status != 'resolved'
            ORDER BY m.rowid DESC
            LIMIT 1
        ), '')
        ORDER BY u.id
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    string_column(&rows, "id")
}

/// Volunteers present in more than one unresolved incident.
pub async fn double_assigned_volunteers(conn: &mut SqliteConnection) -> AppResult<Vec<String>> {
    let rows = sqlx::query(
        r#"
        SELECT m.user_id
        FROM incident_members m
        JOIN incidents i ON i.id = m.incident_id
        WHERE m.kind = 'volunteer' AND i.status != 'resolved'
        GROUP BY m.user_id
        HAVING COUNT(*) > 1
        ORDER BY m.user_id
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    string_column(&rows, "user_id")
}

/// Unresolved incidents with no victims and no volunteers.
pub async fn empty_unresolved_incidents(conn: &mut SqliteConnection) -> AppResult<Vec<String>> {
    let rows = sqlx::query(
        r#"
        SELECT i.id
        FROM incidents i
        WHERE i.status != 'resolved'
          AND NOT EXISTS (SELECT 1 FROM incident_members m WHERE m.incident_id = i.id)
        ORDER BY i.id
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    string_column(&rows, "id")
}
