use axum::{
    extract::{Query, State},
    Json,
};
use serde::Serialize;

use super::error::{ApiError, ApiResult};
use crate::error::EngineError;
use crate::evidence::{FlaggedInterval, FlaggedQuery};
use crate::SharedState;

#[derive(Debug, Serialize)]
pub struct FlaggedListResponse {
    pub flagged_intervals: Vec<FlaggedInterval>,
    pub count: usize,
}

pub async fn list_flagged(
    State(state): State<SharedState>,
    Query(query): Query<FlaggedQuery>,
) -> ApiResult<Json<FlaggedListResponse>> {
    if let (Some(min), Some(max)) = (query.min_score, query.max_score) {
        if min > max {
            return Err(ApiError(EngineError::Validation(format!(
                "min_score {min} is greater than max_score {max}"
            ))));
        }
    }

    let flagged_intervals = state
        .store
        .flagged_intervals(&query)
        .await
        .map_err(|err| ApiError(EngineError::TransientStorage(format!("{err:#}"))))?;
    Ok(Json(FlaggedListResponse {
        count: flagged_intervals.len(),
        flagged_intervals,
    }))
}
