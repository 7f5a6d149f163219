//! Append-only chat log per incident.

use chrono::Utc;
use sqlx::Row;

use crate::error::{AppError, AppResult};
use crate::model::{ChatMessage, ChatSender, Identity};

use super::incidents::incident_status;
use super::{Storage, from_millis, new_id, parse_column, to_millis};

impl Storage {
    /// Persist a chat message and return its canonical form.
    ///
    /// `sent_at` never goes backwards within an incident: if the clock reads
    /// earlier than the newest stored message, the newest timestamp is reused.
    pub async fn append_chat_message(
        &self,
        incident_id: &str,
        sender: &Identity,
        text: &str,
    ) -> AppResult<ChatMessage> {
        if text.trim().is_empty() {
            return Err(AppError::validation("\"message\" is required"));
        }

        let mut tx = self.begin().await?;
        if incident_status(&mut tx, incident_id).await?.is_none() {
            return Err(AppError::not_found("Incident not found"));
        }

        let row = sqlx::query(
            r#"
            SELECT MAX(sent_at) AS last_sent FROM chat_messages WHERE incident_id = ?
            "#,
        )
        .bind(incident_id)
        .fetch_one(&mut *tx)
        .await?;
        let last_sent: Option<i64> = row.try_get("last_sent")?;
        let sent_at = to_millis(Utc::now()).max(last_sent.unwrap_or(i64::MIN));

        let id = new_id();
        sqlx::query(
            r#"
            INSERT INTO chat_messages (id, incident_id, sender_id, message, sent_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(incident_id)
        .bind(&sender.id)
        .bind(text)
        .bind(sent_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ChatMessage {
            id,
            incident: incident_id.to_string(),
            sender: ChatSender {
                id: sender.id.clone(),
                name: sender.name.clone(),
                role: sender.role,
            },
            message: text.to_string(),
            sent_at: from_millis(sent_at),
        })
    }

    /// Every message of an incident in append order.
    pub async fn list_chat_messages(&self, incident_id: &str) -> AppResult<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.incident_id, c.sender_id, c.message, c.sent_at,
                   COALESCE(u.name, '') AS sender_name,
                   COALESCE(u.role, 'victim') AS sender_role
            FROM chat_messages c
            LEFT JOIN users u ON u.id = c.sender_id
            WHERE c.incident_id = ?
            ORDER BY c.seq
            "#,
        )
        .bind(incident_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let role: String = row.try_get("sender_role")?;
                Ok(ChatMessage {
                    id: row.try_get("id")?,
                    incident: row.try_get("incident_id")?,
                    sender: ChatSender {
                        id: row.try_get("sender_id")?,
                        name: row.try_get("sender_name")?,
                        role: parse_column(&role)?,
                    },
                    message: row.try_get("message")?,
                    sent_at: from_millis(row.try_get("sent_at")?),
                })
            })
            .collect()
    }
}
