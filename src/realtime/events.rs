//! Wire events of the real-time channel.
//!
//! Every frame is a JSON text message `{"event": "<name>", "data": {...}}`
//! with camelCase field names.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::geo::{GeoJsonPoint, GeoPoint};
use crate::model::{ChatMessage, Role};

/// Events emitted by clients.
///
/// Payload fields are optional so a frame with missing fields still parses
/// and can be reported precisely before it is dropped.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    JoinIncident(JoinIncident),
    SendMessage(SendMessage),
    UpdateLocation(UpdateLocation),
    SendAlert(SendAlert),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinIncident(_) => "joinIncident",
            ClientEvent::SendMessage(_) => "sendMessage",
            ClientEvent::UpdateLocation(_) => "updateLocation",
            ClientEvent::SendAlert(_) => "sendAlert",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinIncident {
    pub incident_id: Option<String>,
    /// Optional credential; must belong to the session's own user.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub incident_id: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLocation {
    pub user_id: Option<String>,
    pub incident_id: Option<String>,
    pub location: Option<GeoJsonPoint>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendAlert {
    pub user_id: Option<String>,
    pub incident_id: Option<String>,
    pub alert_type: Option<String>,
}

/// Events pushed to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    NewMessage(ChatMessage),
    LocationUpdate(LocationUpdate),
    IncidentAlert(IncidentAlert),
    AlertAck(AlertAck),
}

impl ServerEvent {
    /// Serialize to a text frame.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A member's live position, with name and role taken from the directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub user_id: String,
    pub name: String,
    pub role: Role,
    pub location: GeoPoint,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentAlert {
    pub user_id: String,
    pub name: String,
    pub role: Role,
    pub alert_type: AlertKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Ok,
    Error,
}

/// Delivery receipt for `sendAlert`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertAck {
    pub status: AckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AlertAck {
    pub fn ok() -> Self {
        Self {
            status: AckStatus::Ok,
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Error,
            error: Some(msg.into()),
        }
    }
}

/// The fixed vocabulary of quick alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlertKind {
    ComeToMe,
    StayTogether,
    GatherHere,
    Regroup,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::ComeToMe => "comeToMe",
            AlertKind::StayTogether => "stayTogether",
            AlertKind::GatherHere => "gatherHere",
            AlertKind::Regroup => "regroup",
        }
    }

    /// Human-readable text shown to room members.
    pub fn message(&self, sender_name: &str) -> String {
        match self {
            AlertKind::ComeToMe => format!("{sender_name} asks everyone to come to their location"),
            AlertKind::StayTogether => format!("{sender_name} asks everyone to stay together"),
            AlertKind::GatherHere => format!("{sender_name} asks everyone to gather here"),
            AlertKind::Regroup => format!("{sender_name} asks everyone to regroup"),
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "comeToMe" => Ok(AlertKind::ComeToMe),
            "stayTogether" => Ok(AlertKind::StayTogether),
            "gatherHere" => Ok(AlertKind::GatherHere),
            "regroup" => Ok(AlertKind::Regroup),
            other => Err(AppError::validation(format!("unknown alert type '{other}'"))),
        }
    }
}
