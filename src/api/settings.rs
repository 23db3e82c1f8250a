use axum::{extract::State, Json};

use super::error::{ApiError, ApiResult};
use crate::error::EngineError;
use crate::settings::EngineSettings;
use crate::SharedState;

pub async fn get_settings(State(state): State<SharedState>) -> Json<EngineSettings> {
    Json(state.settings.engine())
}

/// Replaces the engine settings. Running sessions keep the values they
/// were created with.
pub async fn update_settings(
    State(state): State<SharedState>,
    Json(settings): Json<EngineSettings>,
) -> ApiResult<Json<EngineSettings>> {
    settings
        .validate()
        .map_err(|err| ApiError(EngineError::Validation(format!("{err:#}"))))?;
    state
        .settings
        .update_engine(settings)
        .map_err(|err| ApiError(EngineError::TransientStorage(format!("{err:#}"))))?;
    Ok(Json(state.settings.engine()))
}
