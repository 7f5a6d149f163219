//! HTTP API handlers for ReliefNet.
//!
//! Every route except `/health` requires `Authorization: Bearer <token>`.
//! Successful responses are wrapped as `{"status": "success", ...}`; errors
//! render through [`AppError`].

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{FromRequest, Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, patch, post, put};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::assignment::AssignmentEngine;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::geo::GeoPoint;
use crate::identity::{AuthUser, Directory};
use crate::model::{
    AddVictimRequest, CreateIncidentRequest, CreateUserRequest, HistoryQuery, Identity, Incident,
    IncidentDraft, IncidentFilter, IncidentPatch, LocationRequest, MessageRequest, NearbyQuery,
    PageQuery, Pagination, ResolveRequest, Role, StatusRequest,
};
use crate::realtime::Dispatcher;
use crate::realtime::socket::ws_handler;
use crate::rooms::RoomRegistry;
use crate::storage::Storage;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub engine: AssignmentEngine,
    pub directory: Directory,
    pub dispatcher: Dispatcher,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wire the engine, directory and dispatcher around one storage handle.
    pub fn new(storage: Storage, config: Config) -> Self {
        let directory: Directory = Arc::new(storage.clone());
        let dispatcher = Dispatcher::new(
            storage.clone(),
            directory.clone(),
            RoomRegistry::with_capacity(config.session_queue_capacity),
            &config,
        );

        Self {
            engine: AssignmentEngine::new(storage.clone()),
            storage,
            directory,
            dispatcher,
            config: Arc::new(config),
        }
    }
}

/// JSON body extractor whose rejections render as validation errors.
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

/// Build the full router: REST routes, the websocket endpoint and request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .route("/users", post(create_user))
        .route("/users/me", get(get_me))
        .route("/users/me/location", put(update_my_location))
        .route("/users/me/incidents", get(my_incidents))
        .route("/incidents", get(list_incidents).post(create_incident))
        .route("/incidents/nearby", get(nearby_incidents))
        .route(
            "/incidents/:id",
            get(get_incident).patch(update_incident).delete(delete_incident),
        )
        .route("/incidents/:id/status", patch(change_status))
        .route("/incidents/:id/assign", post(assign_volunteer))
        .route("/incidents/:id/add-victim", post(add_victim))
        .route("/incidents/:id/resolve", post(resolve_incident))
        .route("/incidents/:id/reports", get(list_reports).post(add_report))
        .route("/incidents/:id/reports/:index/accept", post(accept_report))
        .route("/incidents/:id/victims", get(list_victims))
        .route("/incidents/:id/volunteers", get(list_volunteers))
        .route("/incidents/:id/locations", get(incident_locations))
        .route("/chat/incident/:id", get(list_chat))
        .route("/chat/incident/:id/message", post(post_chat_message))
        .route("/admin/consistency", get(consistency_report))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// Fetch an incident and require the caller to be a member or an admin.
async fn participant_incident(state: &AppState, id: &str, caller: &Identity) -> AppResult<Incident> {
    let incident = state.storage.get_incident(id).await?;
    if incident.admits(caller) {
        Ok(incident)
    } else {
        Err(AppError::forbidden("Not a member of this incident"))
    }
}

/// Parse a body that may be left empty. Anything else must be valid JSON.
fn optional_json<T: DeserializeOwned>(body: &[u8]) -> AppResult<Option<T>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| AppError::validation(format!("Invalid JSON body: {e}")))
}

// ============================================================================
// Users
// ============================================================================

/// POST /users - Register a user and issue their credential (admin only).
///
/// # Request Body
///
/// ```json
/// { "name": "Ravi", "role": "volunteer" }
/// ```
///
/// # Response
///
/// `201 Created` with `{ user, token }`. The token is only returned here.
#[instrument(skip(state, user, request))]
pub async fn create_user(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(request): ApiJson<CreateUserRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    user.require_admin()?;

    let name = request
        .name
        .ok_or_else(|| AppError::validation("\"name\" is required"))?;
    let role = request
        .role
        .ok_or_else(|| AppError::validation("\"role\" is required"))?;

    let token = Uuid::new_v4().to_string();
    let created = state.storage.create_user(&name, role, &token).await?;
    info!(user_id = %created.id, role = %created.role, "User registered");

    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "success", "user": created, "token": token })),
    ))
}

/// GET /users/me - The caller's profile, location and assignment.
#[instrument(skip(state, user))]
pub async fn get_me(State(state): State<AppState>, user: AuthUser) -> AppResult<Json<Value>> {
    let profile = state
        .storage
        .get_user(&user.0.id)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))?;

    Ok(Json(json!({ "status": "success", "user": profile })))
}

/// PUT /users/me/location - Store the caller's position immediately.
#[instrument(skip(state, user, request))]
pub async fn update_my_location(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(request): ApiJson<LocationRequest>,
) -> AppResult<Json<Value>> {
    let location = request
        .location
        .ok_or_else(|| AppError::validation("\"location\" is required"))?;
    let point = GeoPoint::try_from(location).map_err(AppError::Validation)?;

    state.storage.update_user_location(&user.0.id, point).await?;
    let profile = state
        .storage
        .get_user(&user.0.id)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))?;

    Ok(Json(json!({ "status": "success", "user": profile })))
}

/// GET /users/me/incidents - Incidents the caller has been on, newest first.
///
/// Departed stints are kept with their `leftAt` time. `?active=true` limits
/// the list to current assignments on unresolved incidents.
#[instrument(skip(state, user))]
pub async fn my_incidents(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<Value>> {
    let entries = state
        .storage
        .incident_history(&user.0.id, query.active)
        .await?;

    Ok(Json(json!({ "status": "success", "incidents": entries })))
}

// ============================================================================
// Incidents
// ============================================================================

/// POST /incidents - Report a new incident.
///
/// The caller (a victim) becomes the first member and the description
/// becomes the first report.
///
/// # Request Body
///
/// ```json
/// {
///     "title": "Flood",
///     "description": "Water rising on Main St",
///     "location": { "type": "Point", "coordinates": [77.0, 12.0] }
/// }
/// ```
#[instrument(skip(state, user, request))]
pub async fn create_incident(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(request): ApiJson<CreateIncidentRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    if user.0.role != Role::Victim {
        return Err(AppError::forbidden("Only victims can report incidents"));
    }

    let draft = IncidentDraft::from_request(request, &user.0.id)?;
    let incident = state.engine.report_incident(&draft).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "success", "incident": incident })),
    ))
}

/// GET /incidents - Paged incident list, newest first.
///
/// Volunteers see only incidents they could still join: unresolved and not
/// already volunteered for.
#[instrument(skip(state, user))]
pub async fn list_incidents(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<PageQuery>,
) -> AppResult<Json<Value>> {
    let (page, limit) = query.resolve(state.config.default_page_limit);
    let filter = IncidentFilter {
        available_for: (user.0.role == Role::Volunteer).then(|| user.0.id.clone()),
    };

    let (incidents, pagination) = state.storage.list_incidents(page, limit, &filter).await?;
    info!(
        page,
        limit,
        returned = incidents.len(),
        total = pagination.total_items,
        "Incidents listed"
    );

    Ok(Json(json!({
        "status": "success",
        "incidents": incidents,
        "pagination": pagination,
    })))
}

/// GET /incidents/nearby - Incidents around the caller's last known location.
///
/// # Query Parameters
///
/// - `radius` (optional): Search radius in meters (default from configuration)
#[instrument(skip(state, user))]
pub async fn nearby_incidents(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<NearbyQuery>,
) -> AppResult<Json<Value>> {
    let profile = state
        .storage
        .get_user(&user.0.id)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))?;
    let radius = query.radius.unwrap_or(state.config.nearby_radius_meters);

    let incidents = state
        .storage
        .list_near(profile.current_location, radius)
        .await?;
    info!(radius, found = incidents.len(), "Nearby incidents queried");

    Ok(Json(json!({ "status": "success", "incidents": incidents })))
}

/// GET /incidents/:id - Fetch one incident.
#[instrument(skip(state, _user))]
pub async fn get_incident(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let incident = state.storage.get_incident(&id).await?;
    Ok(Json(json!({ "status": "success", "incident": incident })))
}

/// PATCH /incidents/:id - Administrative partial update.
#[instrument(skip(state, user, patch))]
pub async fn update_incident(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(patch): ApiJson<IncidentPatch>,
) -> AppResult<Json<Value>> {
    user.require_admin()?;

    let incident = state.storage.update_incident(&id, &patch).await?;
    info!(incident_id = %id, "Incident updated by administrator");

    Ok(Json(json!({ "status": "success", "incident": incident })))
}

/// DELETE /incidents/:id - Remove an incident and its chat log (admin only).
#[instrument(skip(state, user))]
pub async fn delete_incident(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    user.require_admin()?;

    state.storage.delete_incident(&id).await?;
    state.dispatcher.close_room(&id).await;
    warn!(incident_id = %id, user_id = %user.0.id, "Incident deleted");

    Ok(Json(json!({ "status": "success", "message": "Incident deleted" })))
}

/// PATCH /incidents/:id/status - Change an incident's status.
///
/// # Request Body
///
/// ```json
/// { "status": "in_progress" }
/// ```
///
/// Status can be: "open", "in_progress" or "resolved". A member asking for
/// "resolved" leaves the incident; it only resolves once nobody is left.
#[instrument(skip(state, user, request))]
pub async fn change_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<StatusRequest>,
) -> AppResult<Json<Value>> {
    let status = request
        .status
        .ok_or_else(|| AppError::validation("\"status\" is required"))?;

    let incident = state.engine.change_status(&id, &user.0, status).await?;
    if !incident.admits(&user.0) {
        state.dispatcher.evict_user(&id, &user.0.id).await;
    }
    info!(incident_id = %id, user_id = %user.0.id, status = %incident.status, "Incident status changed");

    Ok(Json(json!({ "status": "success", "incident": incident })))
}

/// POST /incidents/:id/assign - The calling volunteer joins the incident.
///
/// Fails with 400 if the volunteer is already assigned to another unresolved
/// incident.
#[instrument(skip(state, user))]
pub async fn assign_volunteer(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let incident = state.engine.assign_volunteer(&id, &user.0).await?;
    Ok(Json(json!({ "status": "success", "incident": incident })))
}

/// POST /incidents/:id/add-victim - Add another user to the victims.
///
/// # Request Body
///
/// ```json
/// { "userId": "..." }
/// ```
#[instrument(skip(state, user, request))]
pub async fn add_victim(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<AddVictimRequest>,
) -> AppResult<Json<Value>> {
    let victim_id = request
        .user_id
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AppError::validation("\"userId\" is required"))?;

    participant_incident(&state, &id, &user.0).await?;
    let incident = state.engine.add_victim(&id, &victim_id).await?;

    Ok(Json(json!({ "status": "success", "incident": incident })))
}

/// POST /incidents/:id/resolve - The caller leaves the incident.
///
/// An optional `{ "status": "in_progress" }` body is applied when other
/// members remain. An empty body is accepted; a body that is not valid JSON
/// is rejected.
#[instrument(skip(state, user, body))]
pub async fn resolve_incident(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let requested = optional_json::<ResolveRequest>(&body)?.and_then(|r| r.status);
    let incident = state.engine.resolve_for(&id, &user.0, requested).await?;
    if !incident.admits(&user.0) {
        state.dispatcher.evict_user(&id, &user.0.id).await;
    }

    Ok(Json(json!({ "status": "success", "incident": incident })))
}

/// GET /incidents/:id/reports - Paged report log, oldest first.
#[instrument(skip(state, _user))]
pub async fn list_reports(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> AppResult<Json<Value>> {
    let (page, limit) = query.resolve(state.config.default_page_limit);
    let incident = state.storage.get_incident(&id).await?;
    let pagination = Pagination::new(page, limit, incident.reports.len() as u64);

    Ok(Json(json!({
        "status": "success",
        "reports": pagination.slice(&incident.reports),
        "pagination": pagination,
    })))
}

/// POST /incidents/:id/reports - Append a report.
#[instrument(skip(state, user, request))]
pub async fn add_report(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<MessageRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let message = request
        .message
        .ok_or_else(|| AppError::validation("\"message\" is required"))?;

    participant_incident(&state, &id, &user.0).await?;
    let report = state.storage.append_report(&id, &user.0.id, &message).await?;
    info!(incident_id = %id, user_id = %user.0.id, "Report added");

    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "success", "report": report })),
    ))
}

/// POST /incidents/:id/reports/:index/accept - A volunteer claims a report.
#[instrument(skip(state, user))]
pub async fn accept_report(
    State(state): State<AppState>,
    user: AuthUser,
    Path((id, index)): Path<(String, i64)>,
) -> AppResult<Json<Value>> {
    if user.0.role != Role::Volunteer {
        return Err(AppError::forbidden("Only volunteers can accept reports"));
    }

    let report = state.engine.accept_report(&id, index, &user.0.id).await?;
    info!(incident_id = %id, report_index = index, user_id = %user.0.id, "Report accepted");

    Ok(Json(json!({ "status": "success", "report": report })))
}

/// Resolve a page of user ids to identities, skipping users that no longer exist.
async fn identities(state: &AppState, ids: &[String]) -> AppResult<Vec<Identity>> {
    let mut found = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(identity) = state.directory.lookup(id).await? {
            found.push(identity);
        }
    }
    Ok(found)
}

/// GET /incidents/:id/victims - Paged victim list.
#[instrument(skip(state, _user))]
pub async fn list_victims(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> AppResult<Json<Value>> {
    let (page, limit) = query.resolve(state.config.default_page_limit);
    let incident = state.storage.get_incident(&id).await?;
    let pagination = Pagination::new(page, limit, incident.victims.len() as u64);
    let victims = identities(&state, pagination.slice(&incident.victims)).await?;

    Ok(Json(json!({
        "status": "success",
        "victims": victims,
        "pagination": pagination,
    })))
}

/// GET /incidents/:id/volunteers - Paged volunteer list.
#[instrument(skip(state, _user))]
pub async fn list_volunteers(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> AppResult<Json<Value>> {
    let (page, limit) = query.resolve(state.config.default_page_limit);
    let incident = state.storage.get_incident(&id).await?;
    let pagination = Pagination::new(page, limit, incident.volunteers.len() as u64);
    let volunteers = identities(&state, pagination.slice(&incident.volunteers)).await?;

    Ok(Json(json!({
        "status": "success",
        "volunteers": volunteers,
        "pagination": pagination,
    })))
}

/// GET /incidents/:id/locations - Last known position of every member.
#[instrument(skip(state, user))]
pub async fn incident_locations(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    participant_incident(&state, &id, &user.0).await?;
    let locations = state.storage.member_locations(&id).await?;

    Ok(Json(json!({ "status": "success", "locations": locations })))
}

// ============================================================================
// Chat
// ============================================================================

/// GET /chat/incident/:id - The incident's chat log in send order.
#[instrument(skip(state, user))]
pub async fn list_chat(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    participant_incident(&state, &id, &user.0).await?;
    let messages = state.storage.list_chat_messages(&id).await?;

    Ok(Json(json!({ "status": "success", "messages": messages })))
}

/// POST /chat/incident/:id/message - Append to the chat log.
///
/// The stored message is also pushed to every session in the incident's room.
#[instrument(skip(state, user, request))]
pub async fn post_chat_message(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<MessageRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let text = request
        .message
        .ok_or_else(|| AppError::validation("\"message\" is required"))?;

    participant_incident(&state, &id, &user.0).await?;
    let message = state.dispatcher.post_message(&id, &user.0, &text).await?;
    info!(incident_id = %id, user_id = %user.0.id, "Chat message posted");

    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "success", "message": message })),
    ))
}

// ============================================================================
// Administration
// ============================================================================

/// GET /admin/consistency - Check the assignment invariants (admin only).
#[instrument(skip(state, user))]
pub async fn consistency_report(
    State(state): State<AppState>,
    user: AuthUser,
) -> AppResult<Json<Value>> {
    user.require_admin()?;

    let report = state.engine.audit().await?;
    Ok(Json(json!({
        "status": "success",
        "consistent": report.is_consistent(),
        "report": report,
    })))
}
