use axum::{
    Json,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};

use super::router::AppState;
use super::types::*;
use super::{ApiError, GENERATE_DISABLED, STREAM_DISABLED};
use crate::gestures::{self, DEFAULT_CONFIDENCE};
use crate::streaming::{encode_off_thread, sse_from_generation};
use crate::{Error, vae};

// ============================================================================
// Misc
// ============================================================================

pub async fn health() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

pub async fn favicon() -> Json<MessageResponse> {
    Json(MessageResponse {
        message: "ok".to_string(),
    })
}

// ============================================================================
// Gestures
// ============================================================================

/// Echo a validated gesture. Any malformed payload is a 422.
pub async fn recognize_strict(
    payload: Result<Json<GestureRequest>, JsonRejection>,
) -> Result<Json<GestureResponse>, ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::unprocessable(rejection.body_text()))?;
    if !(0.0..=1.0).contains(&request.confidence) {
        return Err(ApiError::unprocessable(format!(
            "confidence must be between 0 and 1, got {}",
            request.confidence
        )));
    }

    tracing::info!(gesture = %request.gesture, confidence = request.confidence, "gesture received");
    Ok(Json(GestureResponse {
        message: gestures::recognized_message(&request.gesture),
        gesture: request.gesture,
        confidence: request.confidence,
    }))
}

/// Echo a gesture with a fixed confidence.
pub async fn recognize(
    payload: Result<Json<GestureReport>, JsonRejection>,
) -> Result<Json<GestureEcho>, ApiError> {
    let Json(report) = payload?;
    let (gesture, label) = report
        .gesture
        .and_then(|gesture| gestures::gesture_label(&gesture).map(|label| (gesture, label)))
        .ok_or_else(|| ApiError::bad_request("Gesture data is required"))?;

    tracing::info!(gesture = %label, prompt = ?gestures::prompt_for(&label), "gesture received");
    Ok(Json(GestureEcho {
        message: gestures::recognized_message(&label),
        gesture,
        confidence: DEFAULT_CONFIDENCE,
    }))
}

// ============================================================================
// Generation
// ============================================================================

/// Generate one image, save it, and return it inline and by URL.
pub async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::unprocessable(rejection.body_text()))?;
    if !state.config.image_generation_enabled {
        return Err(ApiError::forbidden(GENERATE_DISABLED));
    }
    let backend = state.backend()?;

    tracing::info!(prompt = %request.prompt, "generate request");
    let params = state.params_for(request.prompt.clone(), request.negative_prompt);
    let generated = backend.manager.generate(params).await.map_err(generation_failed)?;
    let png = encode_off_thread(generated.image)
        .await
        .map_err(generation_failed)?;
    let saved = backend.store.save_png(&png).await.map_err(generation_failed)?;

    Ok(Json(GenerateResponse {
        status: "success".to_string(),
        prompt: request.prompt,
        image: vae::png_data_url(&vae::to_base64(&png)),
        image_url: saved.url,
    }))
}

/// Stream one generation as server-sent events, one frame per step.
pub async fn generate_stream(
    State(state): State<AppState>,
    query: Result<Query<StreamQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|rejection| ApiError::unprocessable(rejection.body_text()))?;
    if !state.config.image_generation_enabled {
        return Err(ApiError::forbidden(STREAM_DISABLED));
    }
    let backend = state.backend()?;

    tracing::info!(prompt = %query.prompt, "generate-stream request");
    let params = state.params_for(query.prompt, query.negative_prompt);
    let rx = backend
        .manager
        .generate_stream(params)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(sse_from_generation(rx, backend.store.clone(), state.config.sse_keep_alive_ms).into_response())
}

fn generation_failed(error: Error) -> ApiError {
    ApiError::internal(format!("Image generation failed: {error}"))
}
