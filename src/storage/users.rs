//! User records: identity, last known location and the assignment back-reference.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::error::{AppError, AppResult};
use crate::geo::GeoPoint;
use crate::model::{MemberLocation, Role, UserProfile};

use super::{Storage, new_id, parse_column, to_millis};

fn profile_from_row(row: &SqliteRow) -> AppResult<UserProfile> {
    let role: String = row.try_get("role")?;
    let lng: Option<f64> = row.try_get("lng")?;
    let lat: Option<f64> = row.try_get("lat")?;

    Ok(UserProfile {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        role: parse_column(&role)?,
        current_location: lng.zip(lat).map(|(lng, lat)| GeoPoint { lng, lat }),
        assigned_incident: row.try_get("assigned_incident")?,
    })
}

/// Whether a user with `id` exists.
pub async fn user_exists(conn: &mut SqliteConnection, id: &str) -> AppResult<bool> {
    let row = sqlx::query("SELECT 1 AS found FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.is_some())
}

impl Storage {
    /// Register a user with an opaque bearer credential.
    pub async fn create_user(&self, name: &str, role: Role, credential: &str) -> AppResult<UserProfile> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::validation("\"name\" is required"));
        }
        if credential.trim().is_empty() {
            return Err(AppError::validation("credential must not be empty"));
        }

        let id = new_id();
        let mut tx = self.begin().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO users (id, name, role, credential, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(name)
        .bind(role.as_str())
        .bind(credential)
        .bind(to_millis(Utc::now()))
        .execute(&mut *tx)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(AppError::conflict("credential already in use"));
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit().await?;

        Ok(UserProfile {
            id,
            name: name.to_string(),
            role,
            current_location: None,
            assigned_incident: None,
        })
    }

    /// Create an admin with `credential` unless one already holds it.
    pub async fn ensure_admin(&self, name: &str, credential: &str) -> AppResult<UserProfile> {
        if let Some(existing) = self.user_by_credential(credential).await? {
            return Ok(existing);
        }
        self.create_user(name, Role::Admin, credential).await
    }

    /// Look up a user by id.
    pub async fn get_user(&self, id: &str) -> AppResult<Option<UserProfile>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, role, lng, lat, assigned_incident
            FROM users
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(profile_from_row).transpose()
    }

    /// Look up a user by bearer credential.
    pub async fn user_by_credential(&self, credential: &str) -> AppResult<Option<UserProfile>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, role, lng, lat, assigned_incident
            FROM users
            WHERE credential = ?
            "#,
        )
        .bind(credential)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(profile_from_row).transpose()
    }

    /// Overwrite a user's last known location.
    pub async fn update_user_location(&self, user_id: &str, point: GeoPoint) -> AppResult<()> {
        let mut tx = self.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE users SET lng = ?, lat = ?, location_updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(point.lng)
        .bind(point.lat)
        .bind(to_millis(Utc::now()))
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found("User not found"));
        }
        tx.commit().await
    }

    /// Last known positions of every victim and volunteer on an incident.
    pub async fn member_locations(&self, incident_id: &str) -> AppResult<Vec<MemberLocation>> {
        let mut conn = self.pool.acquire().await?;
        if super::incidents::incident_status(&mut conn, incident_id)
            .await?
            .is_none()
        {
            return Err(AppError::not_found("Incident not found"));
        }

        let rows = sqlx::query(
            r#"
            SELECT u.id, u.name, u.role, u.lng, u.lat, u.assigned_incident
            FROM incident_members m
            JOIN users u ON u.id = m.user_id
            WHERE m.incident_id = ?
            GROUP BY u.id
            ORDER BY MIN(m.rowid)
            "#,
        )
        .bind(incident_id)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter()
            .map(|row| {
                let profile = profile_from_row(row)?;
                Ok(MemberLocation {
                    user_id: profile.id,
                    name: profile.name,
                    role: profile.role,
                    location: profile.current_location,
                })
            })
            .collect()
    }
}
