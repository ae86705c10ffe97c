//! Error taxonomy (spec.md §7) with HTTP status mapping for the transport
//! layer. Variant shape follows `sx9-foundation-core::errors::AgentError`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use serde_json::json;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Viewport bounds missing, non-numeric, out of range, or inverted.
    #[error("invalid viewport: {reason}")]
    InvalidViewport { reason: String },

    /// 429 from upstream for a single tile fetch.
    #[error("upstream rate limited fetching tile {tile_id}")]
    UpstreamRateLimited { tile_id: String },

    /// Network error or non-2xx (other than 429) from upstream.
    #[error("upstream unavailable fetching tile {tile_id}: {reason}")]
    UpstreamUnavailable { tile_id: String, reason: String },

    /// Upstream body did not parse as a JSON array of observations.
    #[error("upstream returned malformed payload for tile {tile_id}: {reason}")]
    UpstreamMalformed { tile_id: String, reason: String },

    /// Credential absent at startup; fatal to the process.
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    /// Defensive catch-all; should not normally surface.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn invalid_viewport(reason: impl Into<String>) -> Self {
        Self::InvalidViewport {
            reason: reason.into(),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            EngineError::InvalidViewport { .. } => StatusCode::BAD_REQUEST,
            EngineError::UpstreamRateLimited { .. }
            | EngineError::UpstreamUnavailable { .. }
            | EngineError::UpstreamMalformed { .. } => StatusCode::BAD_GATEWAY,
            EngineError::ConfigurationMissing(_) | EngineError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
