use serde::{Deserialize, Serialize};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

// ============================================================================
// Gestures
// ============================================================================

/// Strict gesture payload: both fields required, confidence in `[0, 1]`.
#[derive(Debug, Clone, Deserialize)]
pub struct GestureRequest {
    pub gesture: String,
    pub confidence: f64,
}

/// Lenient gesture payload: only a non-empty `gesture` of any JSON type is required.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GestureReport {
    #[serde(default)]
    pub gesture: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GestureResponse {
    pub message: String,
    pub gesture: String,
    pub confidence: f64,
}

/// Lenient echo: `gesture` is returned exactly as it was sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GestureEcho {
    pub message: String,
    pub gesture: serde_json::Value,
    pub confidence: f64,
}

// ============================================================================
// Generation
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateResponse {
    /// Always `"success"`.
    pub status: String,
    pub prompt: String,
    /// `data:image/png;base64,...`
    pub image: String,
    /// `/images/<uuid hex>.png`
    pub image_url: String,
}

/// Query string of `GET /api/generate-stream`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamQuery {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
}
