use axum::extract::{Extension, Path, Query, State};
use axum::{
    Json, Router,
    http::{StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use campus_domain::{
    error::DomainError,
    identity::ActorIdentity,
    membership::{CounterAudit, Membership, MembershipKind, ToggleRequest, ToggleResolution},
    subjects::{Subject, SubjectCreate},
    util::format_ms_rfc3339,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::middleware::CorrelationId;
use crate::{
    error::ApiError, middleware as app_middleware, observability, state::AppState, validation,
};

pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/likes/toggle", post(toggle_like))
        .route("/v1/scraps/toggle", post(toggle_scrap))
        .route("/v1/likes/:subject_id/actors/:actor_id", get(like_status))
        .route("/v1/scraps/:subject_id/actors/:actor_id", get(scrap_status))
        .route("/v1/actors/:actor_id/likes", get(list_actor_likes))
        .route("/v1/actors/:actor_id/scraps", get(list_actor_scraps))
        .route("/v1/subjects", post(create_subject))
        .route("/v1/subjects/:subject_id", get(get_subject))
        .route("/v1/subjects/:subject_id/audit", get(audit_subject))
        .fallback(not_found)
        .layer(middleware::from_fn(app_middleware::metrics_layer))
        .layer(app_middleware::timeout_layer(&state.config))
        .layer(app_middleware::trace_layer())
        .layer(app_middleware::propagate_request_id_layer())
        .layer(app_middleware::set_request_id_layer())
        .layer(middleware::from_fn(
            app_middleware::correlation_id_middleware,
        ));

    if !state.config.is_test() {
        app = app.layer(app_middleware::rate_limit_layer(&state.config));
    }

    app.with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environment: String,
    storage: StorageHealth,
}

#[derive(Serialize)]
struct StorageHealth {
    backend: &'static str,
    status: &'static str,
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let storage_ok = match state.store.health_check().await {
        Ok(()) => true,
        Err(err) => {
            tracing::error!(backend = state.store.name(), error = %err, "storage health check failed");
            false
        }
    };
    let status = if storage_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if storage_ok { "ok" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            environment: state.config.app_env.clone(),
            storage: StorageHealth {
                backend: state.store.name(),
                status: if storage_ok { "ok" } else { "unavailable" },
            },
        }),
    )
}

async fn metrics() -> Result<Response, ApiError> {
    let body = observability::render_metrics().ok_or(ApiError::NotFound)?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}

#[derive(Debug, Deserialize, Validate)]
struct ToggleBody {
    #[validate(length(min = 1, max = 128))]
    subject_id: String,
    #[validate(length(min = 1, max = 128))]
    actor_id: String,
    client_believed_state: bool,
}

#[derive(Debug, Serialize)]
struct ToggleResponse {
    success: bool,
    new_state: bool,
    count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'static str>,
}

async fn toggle_like(
    State(state): State<AppState>,
    correlation: Option<Extension<CorrelationId>>,
    Json(payload): Json<ToggleBody>,
) -> Result<Json<ToggleResponse>, ApiError> {
    toggle_membership(state, MembershipKind::Like, correlation, payload).await
}

async fn toggle_scrap(
    State(state): State<AppState>,
    correlation: Option<Extension<CorrelationId>>,
    Json(payload): Json<ToggleBody>,
) -> Result<Json<ToggleResponse>, ApiError> {
    toggle_membership(state, MembershipKind::Scrap, correlation, payload).await
}

async fn toggle_membership(
    state: AppState,
    kind: MembershipKind,
    correlation: Option<Extension<CorrelationId>>,
    payload: ToggleBody,
) -> Result<Json<ToggleResponse>, ApiError> {
    validation::validate(&payload)?;
    let correlation_id = correlation
        .map(|Extension(CorrelationId(id))| id)
        .unwrap_or_default();
    let actor = ActorIdentity::new(payload.actor_id).map_err(map_domain_error)?;
    let request = ToggleRequest {
        subject_id: payload.subject_id,
        client_believed_state: payload.client_believed_state,
    };
    let subject_id = request.subject_id.clone();

    let outcome = match state.memberships.toggle(kind, &actor, request).await {
        Ok(outcome) => outcome,
        Err(err) => {
            if err.is_retryable() {
                tracing::error!(
                    kind = kind.as_str(),
                    subject_id = %subject_id,
                    actor_id = %actor.actor_id,
                    correlation_id = %correlation_id,
                    error = %err,
                    "membership toggle failed"
                );
            }
            let err = map_domain_error(err);
            observability::register_membership_toggle_failure(kind.as_str(), err.error_code());
            return Err(err);
        }
    };

    observability::register_membership_toggle(kind.as_str(), outcome.resolution.as_str());
    let message = match outcome.resolution {
        ToggleResolution::Applied => {
            tracing::debug!(
                kind = kind.as_str(),
                subject_id = %subject_id,
                actor_id = %actor.actor_id,
                new_state = outcome.new_state,
                count = outcome.count,
                "membership toggled"
            );
            None
        }
        ToggleResolution::AlreadyInState => {
            tracing::debug!(
                kind = kind.as_str(),
                subject_id = %subject_id,
                actor_id = %actor.actor_id,
                new_state = outcome.new_state,
                "stale toggle treated as no-op"
            );
            Some("membership already in the requested state")
        }
        ToggleResolution::RaceAbsorbed => {
            tracing::info!(
                kind = kind.as_str(),
                subject_id = %subject_id,
                actor_id = %actor.actor_id,
                correlation_id = %correlation_id,
                new_state = outcome.new_state,
                "concurrent toggle absorbed"
            );
            Some("a concurrent request already applied this change")
        }
    };

    Ok(Json(ToggleResponse {
        success: true,
        new_state: outcome.new_state,
        count: outcome.count,
        message,
    }))
}

#[derive(Debug, Serialize)]
struct MembershipStatusResponse {
    subject_id: String,
    actor_id: String,
    state: bool,
}

async fn like_status(
    State(state): State<AppState>,
    Path((subject_id, actor_id)): Path<(String, String)>,
) -> Result<Json<MembershipStatusResponse>, ApiError> {
    membership_status(state, MembershipKind::Like, subject_id, actor_id).await
}

async fn scrap_status(
    State(state): State<AppState>,
    Path((subject_id, actor_id)): Path<(String, String)>,
) -> Result<Json<MembershipStatusResponse>, ApiError> {
    membership_status(state, MembershipKind::Scrap, subject_id, actor_id).await
}

async fn membership_status(
    state: AppState,
    kind: MembershipKind,
    subject_id: String,
    actor_id: String,
) -> Result<Json<MembershipStatusResponse>, ApiError> {
    let actor = ActorIdentity::new(actor_id).map_err(map_domain_error)?;
    let joined = state
        .memberships
        .status(kind, &subject_id, &actor)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(MembershipStatusResponse {
        subject_id: subject_id.trim().to_string(),
        actor_id: actor.actor_id,
        state: joined,
    }))
}

#[derive(Debug, Serialize)]
struct MembershipResponse {
    subject_id: String,
    actor_id: String,
    created_at: String,
}

impl From<Membership> for MembershipResponse {
    fn from(membership: Membership) -> Self {
        Self {
            subject_id: membership.subject_id,
            actor_id: membership.actor_id,
            created_at: format_ms_rfc3339(membership.created_at_ms),
        }
    }
}

async fn list_actor_likes(
    State(state): State<AppState>,
    Path(actor_id): Path<String>,
) -> Result<Json<Vec<MembershipResponse>>, ApiError> {
    list_actor_memberships(state, MembershipKind::Like, actor_id).await
}

async fn list_actor_scraps(
    State(state): State<AppState>,
    Path(actor_id): Path<String>,
) -> Result<Json<Vec<MembershipResponse>>, ApiError> {
    list_actor_memberships(state, MembershipKind::Scrap, actor_id).await
}

async fn list_actor_memberships(
    state: AppState,
    kind: MembershipKind,
    actor_id: String,
) -> Result<Json<Vec<MembershipResponse>>, ApiError> {
    let actor = ActorIdentity::new(actor_id).map_err(map_domain_error)?;
    let memberships = state
        .memberships
        .list_by_actor(kind, &actor)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(
        memberships
            .into_iter()
            .map(MembershipResponse::from)
            .collect(),
    ))
}

#[derive(Debug, Deserialize, Validate)]
struct SubjectCreateRequest {
    #[validate(length(min = 1, max = 128))]
    subject_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct SubjectResponse {
    subject_id: String,
    like_count: i64,
    scrap_count: i64,
    created_at: String,
}

impl From<Subject> for SubjectResponse {
    fn from(subject: Subject) -> Self {
        Self {
            subject_id: subject.subject_id,
            like_count: subject.like_count,
            scrap_count: subject.scrap_count,
            created_at: format_ms_rfc3339(subject.created_at_ms),
        }
    }
}

async fn create_subject(
    State(state): State<AppState>,
    Json(payload): Json<SubjectCreateRequest>,
) -> Result<(StatusCode, Json<SubjectResponse>), ApiError> {
    validation::validate(&payload)?;
    let subject = state
        .subjects
        .register(SubjectCreate {
            subject_id: payload.subject_id,
        })
        .await
        .map_err(map_domain_error)?;
    tracing::info!(subject_id = %subject.subject_id, "subject registered");
    Ok((StatusCode::CREATED, Json(subject.into())))
}

async fn get_subject(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
) -> Result<Json<SubjectResponse>, ApiError> {
    let subject = state
        .subjects
        .get(&subject_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(subject.into()))
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    kind: Option<String>,
}

async fn audit_subject(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<CounterAudit>, ApiError> {
    let kind = match query.kind.as_deref() {
        None => MembershipKind::Like,
        Some(value) => MembershipKind::parse(value)
            .ok_or_else(|| ApiError::Validation(format!("unknown membership kind '{value}'")))?,
    };
    let audit = state
        .memberships
        .audit(kind, &subject_id)
        .await
        .map_err(map_domain_error)?;
    if !audit.consistent {
        tracing::warn!(
            subject_id = %audit.subject_id,
            kind = kind.as_str(),
            counter = audit.counter,
            memberships = audit.memberships,
            "subject counter drifted from membership rows"
        );
    }
    Ok(Json(audit))
}

fn map_domain_error(err: DomainError) -> ApiError {
    match err {
        DomainError::Validation(message) => ApiError::Validation(message),
        DomainError::SubjectNotFound(subject_id) => ApiError::SubjectNotFound(subject_id),
        DomainError::Conflict => ApiError::Conflict,
        DomainError::StorageUnavailable(_) => ApiError::Unavailable,
    }
}
