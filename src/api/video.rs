use axum::{
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

use super::error::ApiResult;
use crate::evidence::ArchivedClip;
use crate::SharedState;

fn clip_response(clip: ArchivedClip) -> Response {
    ([(header::CONTENT_TYPE, clip.content_type)], clip.bytes).into_response()
}

pub async fn get_video(
    State(state): State<SharedState>,
    Path(video_ref): Path<String>,
) -> ApiResult<Response> {
    let clip = state.archive.fetch(&video_ref).await?;
    Ok(clip_response(clip))
}

#[derive(Debug, Deserialize)]
pub struct VideoPathRequest {
    #[serde(default)]
    pub video_path: String,
}

pub async fn video_by_path(
    State(state): State<SharedState>,
    Json(req): Json<VideoPathRequest>,
) -> ApiResult<Response> {
    let clip = state.archive.fetch_path(&req.video_path).await?;
    Ok(clip_response(clip))
}
