//! Classified failures for the payment orchestration core.
//!
//! A single [`thiserror`]-derived enum, in the spirit of the teacher's
//! `lexe-api-core::error` module but collapsed to one flat enum since this
//! service exposes a single API surface rather than several independently
//! versioned ones. [`ToHttpStatus`] is implemented once and reused by every
//! adapter handler.

use http::StatusCode;

/// The reason `SystemState` currently has payments paused.
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PauseReason {
    LowBalance,
}

impl std::fmt::Display for PauseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PauseReason::LowBalance => write!(f, "LOW_BALANCE"),
        }
    }
}

/// All classified failures that can escape a core component.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("no premium request found with that id")]
    RequestNotFound,

    #[error("unknown endpoint tag")]
    UnknownEndpoint,

    #[error("payments are paused: {0}")]
    PaymentsPaused(PauseReason),

    #[error("no custodial signer is configured")]
    SignerUnavailable,

    #[error("session is invalid, expired, exhausted, or unknown")]
    SessionInvalid,

    #[error("session cannot be refreshed in its current state")]
    SessionNotRefreshable,

    #[error("chain rejected the transaction: {0}")]
    ChainRejected(String),

    #[error("timed out waiting for chain confirmation")]
    ChainTimeout,

    #[error("facilitator is unreachable")]
    FacilitatorUnavailable,

    #[error("facilitator callback signature is invalid")]
    FacilitatorSignatureInvalid,

    #[error("facilitator callback references an unknown transaction")]
    UnknownTransaction,

    #[error("repository error: {0}")]
    RepositoryTransient(#[from] anyhow::Error),
}

/// Maps a classified error to the HTTP status code the adapter layer should
/// return, per spec §7.
pub trait ToHttpStatus {
    fn to_http_status(&self) -> StatusCode;
}

impl ToHttpStatus for AgentError {
    fn to_http_status(&self) -> StatusCode {
        match self {
            AgentError::RequestNotFound => StatusCode::NOT_FOUND,
            AgentError::UnknownEndpoint => StatusCode::NOT_FOUND,
            AgentError::PaymentsPaused(_) => StatusCode::SERVICE_UNAVAILABLE,
            AgentError::SignerUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
            AgentError::SessionInvalid => StatusCode::UNAUTHORIZED,
            AgentError::SessionNotRefreshable => StatusCode::UNAUTHORIZED,
            AgentError::ChainRejected(_) => StatusCode::BAD_GATEWAY,
            AgentError::ChainTimeout => StatusCode::GATEWAY_TIMEOUT,
            AgentError::FacilitatorUnavailable => StatusCode::BAD_GATEWAY,
            AgentError::FacilitatorSignatureInvalid => StatusCode::UNAUTHORIZED,
            AgentError::UnknownTransaction => StatusCode::NOT_FOUND,
            AgentError::RepositoryTransient(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
