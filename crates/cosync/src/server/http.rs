//! HTTP API for reconciliation and presence.
//!
//! Three routes: `POST /collaboration-sync` runs the reconciliation fold,
//! `GET /presence/{resource_type}/{resource_id}` returns the roster and
//! `POST /presence/heartbeat` upserts the caller's row. Every route
//! resolves a bearer token through the injected [`AuthProvider`]; the two
//! write routes also consult the [`AccessPolicy`].

use super::auth::{AccessPolicy, AuthProvider, AuthenticatedUser};
use super::ServerContext;
use crate::error::SyncError;
use crate::presence::PresenceRecord;
use crate::reconcile::{Reconciler, SyncRequest, SyncResponse};
use crate::resource::ResourceRef;
use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Assemble the API router over a server context.
pub fn router<A, P>(context: ServerContext<A, P>) -> Router
where
    A: AuthProvider + 'static,
    P: AccessPolicy + 'static,
{
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/collaboration-sync", post(collaboration_sync))
        .route(
            "/presence/{resource_type}/{resource_id}",
            get(presence_roster),
        )
        .route("/presence/heartbeat", post(presence_heartbeat))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(context)
}

/// `POST /collaboration-sync`: reconcile a client's pending operations
/// against everything recorded since its base version.
async fn collaboration_sync<A, P>(
    State(context): State<ServerContext<A, P>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<SyncResponse>, StatusCode>
where
    A: AuthProvider + 'static,
    P: AccessPolicy + 'static,
{
    let user = authenticate(context.auth.as_ref(), &headers).await?;

    let request: SyncRequest = serde_json::from_value(body).map_err(|err| {
        tracing::debug!("Malformed sync request: {}", err);
        StatusCode::BAD_REQUEST
    })?;

    let resource = request.resource();
    context
        .policy
        .authorize(&user.user_id, &resource)
        .await
        .map_err(|err| error_to_status(&err))?;

    let reconciler = Reconciler::new(Arc::clone(&context.store));
    let response = reconciler
        .reconcile(&user.user_id, &request)
        .map_err(|err| {
            tracing::error!(resource = %resource, "Reconciliation failed: {}", err);
            error_to_status(&err)
        })?;

    Ok(Json(response))
}

/// `GET /presence/{resource_type}/{resource_id}`: roster with activity
/// recomputed from heartbeat recency.
async fn presence_roster<A, P>(
    State(context): State<ServerContext<A, P>>,
    headers: HeaderMap,
    Path((resource_type, resource_id)): Path<(String, String)>,
) -> Result<Json<Vec<PresenceRecord>>, StatusCode>
where
    A: AuthProvider + 'static,
    P: AccessPolicy + 'static,
{
    authenticate(context.auth.as_ref(), &headers).await?;
    let resource = parse_resource(&resource_type, &resource_id)?;

    let roster = context
        .presence
        .get_active_collaborators(&resource)
        .map_err(|err| {
            tracing::error!(resource = %resource, "Roster fetch failed: {}", err);
            error_to_status(&err)
        })?;

    Ok(Json(roster))
}

#[derive(Debug, Deserialize)]
struct HeartbeatBody {
    resource_type: String,
    resource_id: String,
    #[serde(default)]
    presence_data: Map<String, Value>,
}

/// `POST /presence/heartbeat`: upsert the caller's presence row. The
/// caller's color is filled in unless the payload already carries one.
async fn presence_heartbeat<A, P>(
    State(context): State<ServerContext<A, P>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode>
where
    A: AuthProvider + 'static,
    P: AccessPolicy + 'static,
{
    let user = authenticate(context.auth.as_ref(), &headers).await?;

    let body: HeartbeatBody = serde_json::from_value(body).map_err(|err| {
        tracing::debug!("Malformed heartbeat: {}", err);
        StatusCode::BAD_REQUEST
    })?;
    let resource = parse_resource(&body.resource_type, &body.resource_id)?;

    context
        .policy
        .authorize(&user.user_id, &resource)
        .await
        .map_err(|err| error_to_status(&err))?;

    let mut record = PresenceRecord::new(&user.identity());
    for (key, value) in body.presence_data {
        record.set_field(key, value);
    }
    if record.field("color").is_none() {
        record.set_field("color", Value::String(user.color.clone()));
    }

    context
        .presence
        .update_presence_heartbeat(&resource, record)
        .map_err(|err| {
            tracing::error!(resource = %resource, "Heartbeat write failed: {}", err);
            error_to_status(&err)
        })?;

    Ok(Json(json!({ "ok": true })))
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn authenticate<A: AuthProvider>(
    auth: &A,
    headers: &HeaderMap,
) -> Result<AuthenticatedUser, StatusCode> {
    let token = bearer_token(headers).ok_or(StatusCode::UNAUTHORIZED)?;
    auth.authenticate(token).await.map_err(|message| {
        tracing::debug!("Authentication rejected: {}", message);
        StatusCode::UNAUTHORIZED
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn parse_resource(resource_type: &str, resource_id: &str) -> Result<ResourceRef, StatusCode> {
    ResourceRef::from_channel_name(&format!("{resource_type}:{resource_id}"))
        .ok_or(StatusCode::BAD_REQUEST)
}

fn error_to_status(err: &SyncError) -> StatusCode {
    match err {
        SyncError::InvalidRequest(_)
        | SyncError::InvalidPath(_)
        | SyncError::UnsupportedOperation(_) => StatusCode::BAD_REQUEST,
        SyncError::AccessDenied { .. } => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
