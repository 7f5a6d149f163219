//! Data model for incidents, reports, chat messages and users.
//!
//! Wire shapes use camelCase field names; statuses and roles are lowercase
//! strings (`in_progress` keeps its underscore).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::geo::{GeoJsonPoint, GeoPoint};

/// Fallback text for the synthesized first report when no description was given.
const INITIAL_REPORT_MESSAGE: &str = "Initial report";

/// Actor role of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Victim,
    Volunteer,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Victim => "victim",
            Role::Volunteer => "volunteer",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "victim" => Ok(Role::Victim),
            "volunteer" => Ok(Role::Volunteer),
            "admin" => Ok(Role::Admin),
            other => Err(AppError::validation(format!("unknown role '{other}'"))),
        }
    }
}

/// Lifecycle state of an incident. `Resolved` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    InProgress,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "open",
            IncidentStatus::InProgress => "in_progress",
            IncidentStatus::Resolved => "resolved",
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, IncidentStatus::Resolved)
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// Every state may move to `Resolved`; nothing leaves `Resolved`
    /// (re-asserting `Resolved` is a no-op and allowed).
    pub fn can_transition_to(&self, next: IncidentStatus) -> bool {
        !self.is_resolved() || next.is_resolved()
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncidentStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(IncidentStatus::Open),
            "in_progress" => Ok(IncidentStatus::InProgress),
            "resolved" => Ok(IncidentStatus::Resolved),
            other => Err(AppError::validation(format!(
                "status must be one of open, in_progress, resolved (got '{other}')"
            ))),
        }
    }
}

/// A resolved user identity, as returned by the identity directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub role: Role,
}

/// A timestamped message in an incident's report log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    /// Author user id.
    pub user: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    /// Volunteers who have claimed this specific report.
    pub assigned_volunteers: Vec<String>,
}

/// An incident with its membership sets and embedded report log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: IncidentStatus,
    pub location: GeoPoint,
    pub victims: Vec<String>,
    pub volunteers: Vec<String>,
    pub reports: Vec<Report>,
    pub created_at: DateTime<Utc>,
}

impl Incident {
    pub fn has_victim(&self, user_id: &str) -> bool {
        self.victims.iter().any(|v| v == user_id)
    }

    pub fn has_volunteer(&self, user_id: &str) -> bool {
        self.volunteers.iter().any(|v| v == user_id)
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.has_victim(user_id) || self.has_volunteer(user_id)
    }

    /// Whether `identity` may read or post to this incident: members and admins.
    pub fn admits(&self, identity: &Identity) -> bool {
        identity.role == Role::Admin || self.is_member(&identity.id)
    }
}

/// Validated input for creating an incident.
#[derive(Debug, Clone)]
pub struct IncidentDraft {
    pub title: String,
    pub description: String,
    pub location: GeoPoint,
    pub creator_id: String,
}

/// Request body for `POST /incidents`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIncidentRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<GeoJsonPoint>,
}

impl IncidentDraft {
    /// Validate a create request on behalf of `creator_id`.
    pub fn from_request(request: CreateIncidentRequest, creator_id: &str) -> AppResult<Self> {
        let title = request
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::validation("\"title\" is required"))?;

        let location = request
            .location
            .ok_or_else(|| AppError::validation("\"location\" is required"))?;
        let location = GeoPoint::try_from(location).map_err(AppError::Validation)?;

        Ok(Self {
            title,
            description: request.description.unwrap_or_default(),
            location,
            creator_id: creator_id.to_string(),
        })
    }

    /// Text of the synthesized first report.
    pub fn initial_report_message(&self) -> &str {
        if self.description.trim().is_empty() {
            INITIAL_REPORT_MESSAGE
        } else {
            &self.description
        }
    }
}

/// Partial update applied by administrators (`PATCH /incidents/:id`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<GeoJsonPoint>,
    pub status: Option<IncidentStatus>,
}

/// Filters for the paged incident listing.
#[derive(Debug, Clone, Default)]
pub struct IncidentFilter {
    /// Restrict to unresolved incidents this volunteer has not joined.
    pub available_for: Option<String>,
}

/// Request body for `PATCH /incidents/:id/status`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusRequest {
    pub status: Option<IncidentStatus>,
}

/// Request body for `POST /incidents/:id/resolve`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResolveRequest {
    /// Status to apply if the incident stays active after the caller leaves.
    pub status: Option<IncidentStatus>,
}

/// Request body for `POST /incidents/:id/add-victim`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddVictimRequest {
    pub user_id: Option<String>,
}

/// Request body for `POST /incidents/:id/reports` and chat appends.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageRequest {
    pub message: Option<String>,
}

/// Sender details embedded in chat messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSender {
    pub id: String,
    pub name: String,
    pub role: Role,
}

/// A persisted chat message. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub incident: String,
    pub sender: ChatSender,
    pub message: String,
    pub sent_at: DateTime<Utc>,
}

/// A user as seen by the coordination core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub current_location: Option<GeoPoint>,
    /// Derived back-reference to the user's current unresolved incident.
    pub assigned_incident: Option<String>,
}

impl UserProfile {
    pub fn identity(&self) -> Identity {
        Identity {
            id: self.id.clone(),
            name: self.name.clone(),
            role: self.role,
        }
    }
}

/// One stint of a user on an incident, for the user's incident history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentHistoryEntry {
    pub incident: Incident,
    /// The set the user was in: `victim` or `volunteer`.
    pub membership: Role,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

/// Query parameters for `GET /users/me/incidents`.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct HistoryQuery {
    /// Only current assignments: open stints on unresolved incidents.
    #[serde(default)]
    pub active: bool,
}

/// Request body for `POST /users`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateUserRequest {
    pub name: Option<String>,
    pub role: Option<Role>,
}

/// Request body for `PUT /users/me/location`.
#[derive(Debug, Clone, Deserialize)]
pub struct LocationRequest {
    pub location: Option<GeoJsonPoint>,
}

/// Last known position of an incident member.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberLocation {
    pub user_id: String,
    pub name: String,
    pub role: Role,
    pub location: Option<GeoPoint>,
}

/// Pagination metadata attached to list responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total_pages: u32,
    pub total_items: u64,
}

impl Pagination {
    pub fn new(page: u32, limit: u32, total_items: u64) -> Self {
        let total_pages = if limit == 0 {
            0
        } else {
            total_items.div_ceil(u64::from(limit)) as u32
        };
        Self {
            page,
            limit,
            total_pages,
            total_items,
        }
    }

    /// Row offset of the first item on this page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }

    /// Slice an in-memory list to this page.
    pub fn slice<'a, T>(&self, items: &'a [T]) -> &'a [T] {
        let start = (self.offset() as usize).min(items.len());
        let end = start.saturating_add(self.limit as usize).min(items.len());
        &items[start..end]
    }
}

/// Query parameters for paged listings.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl PageQuery {
    /// Page (1-based) and limit, with non-positive values replaced by defaults.
    pub fn resolve(&self, default_limit: u32) -> (u32, u32) {
        let page = self.page.filter(|p| *p > 0).unwrap_or(1);
        let limit = self.limit.filter(|l| *l > 0).unwrap_or(default_limit);
        (page, limit)
    }
}

/// Query parameters for `GET /incidents/nearby`.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct NearbyQuery {
    pub radius: Option<f64>,
}
