//! Maps [`AgentError`] onto HTTP responses, the teacher's `ApiError` +
//! `ToHttpStatus` idiom collapsed to a single enum since this service has
//! one API surface rather than several independently versioned ones.

use agent_core::{AgentError, ToHttpStatus};
use axum::{
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

pub struct ApiError(pub AgentError);

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.to_http_status();
        let body = Json(json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}
