use std::collections::BTreeMap;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    aggregation::RecomputeSummary,
    context_config::LeaderboardConfig,
    engine::{LeaderboardEngine, LeaderboardError, LeaderboardQuery, SnapshotOutcome, SnapshotRequest},
    enrollment::ScopeMember,
    ledger::types::{RecordOutcome, RecordPointsRequest, RecordReversalRequest},
    snapshot::store::HistoryFilter,
    types::{
        ContextRef, ContextType, LeaderboardPage, LeaderboardSnapshot, Period, PeriodRange,
        StudentRank,
    },
    webhook::WebhookMetrics,
};


#[derive(Clone)]
pub struct AppState {
    engine: LeaderboardEngine,
    service_name: String,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(engine: LeaderboardEngine, service_name: impl Into<String>) -> Self {
        Self {
            engine,
            service_name: service_name.into(),
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    uptime_seconds: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudentRankQuery {
    #[serde(default)]
    period: Option<Period>,
    #[serde(default)]
    partition_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RangeQuery {
    #[serde(default)]
    start: Option<DateTime<Utc>>,
    #[serde(default)]
    end: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryQuery {
    #[serde(default)]
    start: Option<DateTime<Utc>>,
    #[serde(default)]
    end: Option<DateTime<Utc>>,
    #[serde(default)]
    period: Option<Period>,
    #[serde(default)]
    partition_key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StudentTotalResponse {
    student_id: String,
    context_type: ContextType,
    context_id: String,
    range: PeriodRange,
    points: i64,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    snapshots: Vec<LeaderboardSnapshot>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PruneBody {
    period: Period,
    #[serde(default)]
    partition_key: Option<String>,
    keep_latest: usize,
}

#[derive(Debug, Serialize)]
struct PruneResponse {
    removed: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberBody {
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    #[serde(default)]
    level: u32,
    #[serde(default)]
    achievements_count: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MemberResponse {
    context_type: ContextType,
    context_id: String,
    member: ScopeMember,
    created: bool,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/points", post(record_points))
        .route("/v1/points/reversal", post(record_reversal))
        .route(
            "/v1/leaderboards/:context_type/:context_id",
            get(get_leaderboard),
        )
        .route(
            "/v1/leaderboards/:context_type/:context_id/students/:student_id",
            get(get_student_rank),
        )
        .route(
            "/v1/leaderboards/:context_type/:context_id/students/:student_id/total",
            get(get_student_total),
        )
        .route(
            "/v1/leaderboards/:context_type/:context_id/history",
            get(get_history),
        )
        .route(
            "/v1/leaderboards/:context_type/:context_id/config",
            get(get_config).put(update_config),
        )
        .route(
            "/internal/v1/leaderboards/:context_type/:context_id/snapshots",
            post(create_snapshot),
        )
        .route(
            "/internal/v1/leaderboards/:context_type/:context_id/snapshots/prune",
            post(prune_snapshots),
        )
        .route(
            "/internal/v1/leaderboards/:context_type/:context_id/recompute",
            post(recompute),
        )
        .route(
            "/internal/v1/leaderboards/:context_type/:context_id/members/:student_id",
            put(enroll_member).delete(unenroll_member),
        )
        .route("/internal/v1/webhooks/metrics", get(get_webhook_metrics))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: state.service_name.clone(),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
    })
}

async fn record_points(
    State(state): State<AppState>,
    Json(body): Json<RecordPointsRequest>,
) -> Result<(StatusCode, Json<RecordOutcome>), ApiError> {
    let outcome = state.engine.record_points(body).await?;
    Ok((written_status(outcome.duplicate), Json(outcome)))
}

async fn record_reversal(
    State(state): State<AppState>,
    Json(body): Json<RecordReversalRequest>,
) -> Result<(StatusCode, Json<RecordOutcome>), ApiError> {
    let outcome = state.engine.record_reversal(body).await?;
    Ok((written_status(outcome.duplicate), Json(outcome)))
}

fn written_status(duplicate: bool) -> StatusCode {
    if duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    }
}

async fn get_leaderboard(
    State(state): State<AppState>,
    Path((context_type, context_id)): Path<(String, String)>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Json<LeaderboardPage>, ApiError> {
    let context = context_ref(&context_type, context_id)?;
    Ok(Json(state.engine.get_leaderboard(&context, query).await?))
}

async fn get_student_rank(
    State(state): State<AppState>,
    Path((context_type, context_id, student_id)): Path<(String, String, String)>,
    Query(query): Query<StudentRankQuery>,
) -> Result<Json<StudentRank>, ApiError> {
    let context = context_ref(&context_type, context_id)?;
    let rank = state
        .engine
        .get_student_rank(&student_id, &context, query.period, query.partition_key)
        .await?;
    Ok(Json(rank))
}

async fn get_student_total(
    State(state): State<AppState>,
    Path((context_type, context_id, student_id)): Path<(String, String, String)>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<StudentTotalResponse>, ApiError> {
    let context = context_ref(&context_type, context_id)?;
    let range = range_of(query.start, query.end)?;
    let points = state.engine.get_total(&student_id, &context, range).await?;
    Ok(Json(StudentTotalResponse {
        student_id,
        context_type: context.context_type,
        context_id: context.context_id,
        range,
        points,
    }))
}

async fn get_history(
    State(state): State<AppState>,
    Path((context_type, context_id)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let context = context_ref(&context_type, context_id)?;
    let filter = HistoryFilter {
        range: range_of(query.start, query.end)?,
        period: query.period,
        partition_key: query.partition_key,
    };
    let snapshots = state.engine.get_history(&context, filter).await?;
    Ok(Json(HistoryResponse { snapshots }))
}

async fn get_config(
    State(state): State<AppState>,
    Path((context_type, context_id)): Path<(String, String)>,
) -> Result<Json<LeaderboardConfig>, ApiError> {
    let context = context_ref(&context_type, context_id)?;
    Ok(Json(state.engine.get_config(&context).await?))
}

async fn update_config(
    State(state): State<AppState>,
    Path((context_type, context_id)): Path<(String, String)>,
    Json(body): Json<LeaderboardConfig>,
) -> Result<Json<LeaderboardConfig>, ApiError> {
    let context = context_ref(&context_type, context_id)?;
    Ok(Json(state.engine.update_config(&context, body).await?))
}

async fn create_snapshot(
    State(state): State<AppState>,
    Path((context_type, context_id)): Path<(String, String)>,
    Json(body): Json<SnapshotRequest>,
) -> Result<(StatusCode, Json<SnapshotOutcome>), ApiError> {
    let context = context_ref(&context_type, context_id)?;
    let outcome = state.engine.create_snapshot(&context, body).await?;
    Ok((written_status(!outcome.created), Json(outcome)))
}

async fn prune_snapshots(
    State(state): State<AppState>,
    Path((context_type, context_id)): Path<(String, String)>,
    Json(body): Json<PruneBody>,
) -> Result<Json<PruneResponse>, ApiError> {
    let context = context_ref(&context_type, context_id)?;
    let removed = state
        .engine
        .prune_snapshots(&context, body.period, body.partition_key, body.keep_latest)
        .await?;
    Ok(Json(PruneResponse { removed }))
}

async fn recompute(
    State(state): State<AppState>,
    Path((context_type, context_id)): Path<(String, String)>,
) -> Result<Json<RecomputeSummary>, ApiError> {
    let context = context_ref(&context_type, context_id)?;
    Ok(Json(state.engine.recompute(&context).await?))
}

async fn enroll_member(
    State(state): State<AppState>,
    Path((context_type, context_id, student_id)): Path<(String, String, String)>,
    Json(body): Json<MemberBody>,
) -> Result<(StatusCode, Json<MemberResponse>), ApiError> {
    let context = context_ref(&context_type, context_id)?;
    let member = ScopeMember {
        student_id,
        attributes: body.attributes,
        level: body.level,
        achievements_count: body.achievements_count,
    };
    let created = state.engine.enroll(&context, member.clone()).await?;
    Ok((
        written_status(!created),
        Json(MemberResponse {
            context_type: context.context_type,
            context_id: context.context_id,
            member,
            created,
        }),
    ))
}

async fn unenroll_member(
    State(state): State<AppState>,
    Path((context_type, context_id, student_id)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    let context = context_ref(&context_type, context_id)?;
    state.engine.unenroll(&context, &student_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_webhook_metrics(State(state): State<AppState>) -> Json<WebhookMetrics> {
    Json(state.engine.webhook_metrics().await)
}

fn context_ref(context_type: &str, context_id: String) -> Result<ContextRef, ApiError> {
    let context_type = ContextType::parse(context_type).ok_or_else(|| {
        ApiError::InvalidRequest(format!("unknown context type {context_type}"))
    })?;
    let context_id = context_id.trim();
    if context_id.is_empty() {
        return Err(ApiError::InvalidRequest("contextId is required".to_string()));
    }
    Ok(ContextRef::new(context_type, context_id))
}

fn range_of(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<PeriodRange, ApiError> {
    let range = PeriodRange { start, end };
    if range.is_empty() {
        return Err(ApiError::InvalidRequest(
            "end must be after start".to_string(),
        ));
    }
    Ok(range)
}

#[derive(Debug)]
enum ApiError {
    InvalidRequest(String),
    Service(LeaderboardError),
}

impl From<LeaderboardError> for ApiError {
    fn from(error: LeaderboardError) -> Self {
        Self::Service(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, code, message) = match self {
            Self::InvalidRequest(message) => {
                (StatusCode::BAD_REQUEST, "invalid_request", message)
            }
            Self::Service(error) => {
                let status = match &error {
                    LeaderboardError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                    LeaderboardError::NotFound(_) => StatusCode::NOT_FOUND,
                    LeaderboardError::Conflict(_) => StatusCode::CONFLICT,
                    LeaderboardError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    LeaderboardError::ConcurrencyConflict(_)
                    | LeaderboardError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    LeaderboardError::Internal(_) => {
                        tracing::error!(reason = %error, "leaderboard request failed");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, error.code(), error.message())
            }
        };
        (
            status,
            Json(serde_json::json!({
                "error": code,
                "message": message,
            })),
        )
            .into_response()
    }
}
