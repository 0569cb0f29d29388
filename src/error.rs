use std::time::Duration;

use thiserror::Error;

use crate::GraphQLResponse;

/// Errors raised while building schemas or executing requests.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Upstream could not be reached during introspection.
    #[error("upstream `{service}` is unreachable: {reason}")]
    Unreachable { service: String, reason: String },

    /// Upstream answered introspection with something that is not a schema.
    #[error("upstream `{service}` returned an invalid schema: {reason}")]
    InvalidSchema { service: String, reason: String },

    /// Two upstreams declare irreconcilable definitions for the same name.
    #[error("conflicting definitions of `{name}` in `{first}` and `{second}`: {reason}")]
    Conflict {
        name: String,
        first: String,
        second: String,
        reason: String,
    },

    #[error("{0}")]
    ValidationFailed(String),

    /// A sub-request failed or timed out and nothing else could be served.
    #[error("upstream `{service}` failed: {reason}")]
    UpstreamFailed { service: String, reason: String },

    /// Some sub-requests failed; the response still carries partial data.
    #[error("{} upstream request(s) failed: {}", failed.len(), failed.join(", "))]
    PartialFailure {
        response: Box<GraphQLResponse>,
        failed: Vec<String>,
    },

    #[error("no merged schema is available")]
    NoSchema,

    #[error("gateway is shutting down")]
    ShuttingDown,
}

impl GatewayError {
    /// Short machine-readable code placed in `errors[].extensions.code`.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unreachable { .. } => "UNREACHABLE",
            GatewayError::InvalidSchema { .. } => "INVALID_SCHEMA",
            GatewayError::Conflict { .. } => "CONFLICT",
            GatewayError::ValidationFailed(_) => "GRAPHQL_VALIDATION_FAILED",
            GatewayError::UpstreamFailed { .. } => "UPSTREAM_FAILED",
            GatewayError::PartialFailure { .. } => "PARTIAL_FAILURE",
            GatewayError::NoSchema => "SCHEMA_UNAVAILABLE",
            GatewayError::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// Label used for the error counter.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Unreachable { .. } => "unreachable",
            GatewayError::InvalidSchema { .. } => "invalid_schema",
            GatewayError::Conflict { .. } => "conflict",
            GatewayError::ValidationFailed(_) => "validation_failed",
            GatewayError::UpstreamFailed { .. } => "upstream_failed",
            GatewayError::PartialFailure { .. } => "partial_failure",
            GatewayError::NoSchema => "no_schema",
            GatewayError::ShuttingDown => "shutting_down",
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        GatewayError::ValidationFailed(message.into())
    }
}

/// Failures of a single HTTP exchange with an upstream.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("malformed response body: {0}")]
    Decode(String),

    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}
