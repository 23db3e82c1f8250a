use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::error::{ApiError, ApiResult};
use crate::error::EngineError;
use crate::session::{
    EndOutcome, IngestReceipt, Session, SessionDetails, SessionReport, SessionStats,
};
use crate::signal::{FrameSubmission, Signal};
use crate::SharedState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub exam_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub success: bool,
    pub session_id: String,
    pub user_id: String,
    pub exam_id: String,
    pub message: &'static str,
}

pub async fn create_session(
    State(state): State<SharedState>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<Json<CreateSessionResponse>> {
    let user_id = req.user_id.unwrap_or_default();
    let session = state
        .registry
        .create_session(&user_id, req.exam_id.as_deref())
        .await?;

    Ok(Json(CreateSessionResponse {
        success: true,
        session_id: session.session_id,
        user_id: session.user_id,
        exam_id: session.exam_id,
        message: "Session started successfully",
    }))
}

/// Either a session id or the `(user_id, exam_id)` pair it was created with.
#[derive(Debug, Deserialize)]
pub struct EndSessionRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub exam_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EndSessionResponse {
    pub success: bool,
    pub session_id: String,
    pub already_ended: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<SessionReport>,
}

pub async fn end_session(
    State(state): State<SharedState>,
    Json(req): Json<EndSessionRequest>,
) -> ApiResult<Json<EndSessionResponse>> {
    let (session_id, outcome) = match (req.session_id, req.user_id) {
        (Some(session_id), _) => {
            let outcome = state.registry.end_session(&session_id).await?;
            (session_id, outcome)
        }
        (None, Some(user_id)) => {
            state
                .registry
                .end_session_for(&user_id, req.exam_id.as_deref())
                .await?
        }
        (None, None) => {
            return Err(ApiError(EngineError::Validation(
                "user_id or session_id is required".into(),
            )));
        }
    };

    let (already_ended, report) = match outcome {
        EndOutcome::Ended(report) => (false, Some(report)),
        EndOutcome::AlreadyEnded(report) => (true, report),
    };
    Ok(Json(EndSessionResponse {
        success: true,
        session_id,
        already_ended,
        report,
    }))
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub success: bool,
    #[serde(flatten)]
    pub receipt: IngestReceipt,
}

/// Runs the frame through the detector and feeds the resulting signal to
/// the session.
pub async fn submit_frame(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    Json(submission): Json<FrameSubmission>,
) -> ApiResult<Json<IngestResponse>> {
    let received_at = Utc::now();
    let detector = Arc::clone(&state.detector);
    let (observation, submission) = tokio::task::spawn_blocking(move || {
        detector
            .observe(&submission)
            .map(|observation| (observation, submission))
    })
    .await
    .map_err(|err| ApiError(EngineError::Unavailable(format!("detector task failed: {err}"))))?
    .map_err(|err| ApiError(EngineError::Validation(err.to_string())))?;

    let signal = observation.into_signal(submission.screen_activity, received_at);
    let receipt = state
        .registry
        .ingest(&session_id, signal, submission.frame)
        .await?;
    Ok(Json(IngestResponse {
        success: true,
        receipt,
    }))
}

pub async fn submit_signal(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    Json(signal): Json<Signal>,
) -> ApiResult<Json<IngestResponse>> {
    let receipt = state.registry.ingest(&session_id, signal, None).await?;
    Ok(Json(IngestResponse {
        success: true,
        receipt,
    }))
}

pub async fn active_sessions(State(state): State<SharedState>) -> Json<Vec<Session>> {
    Json(state.registry.active().await)
}

pub async fn session_stats(State(state): State<SharedState>) -> Json<SessionStats> {
    Json(state.registry.stats().await)
}

pub async fn session_details(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionDetails>> {
    Ok(Json(state.registry.details(&session_id).await?))
}
