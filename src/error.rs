use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::mcp::protocol::JsonRpcError;

/// Failures of a single downstream connection.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("transport error for server '{server}': {reason}")]
    Transport { server: String, reason: String },

    #[error("protocol error for server '{server}': {reason}")]
    Protocol { server: String, reason: String },

    #[error("tool '{tool}' not found on server '{server}'")]
    ToolNotFound { server: String, tool: String },

    #[error("server '{server}' returned error {}: {}", .error.code, .error.message)]
    Remote { server: String, error: JsonRpcError },

    #[error("'{method}' on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },
}

impl ConnectionError {
    pub fn transport(server: &str, reason: impl Into<String>) -> Self {
        Self::Transport {
            server: server.to_string(),
            reason: reason.into(),
        }
    }

    pub fn protocol(server: &str, reason: impl Into<String>) -> Self {
        Self::Protocol {
            server: server.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the registry, kits, gateways and the composer.
#[derive(Error, Debug, Clone)]
pub enum ComposerError {
    #[error("server '{0}' is not registered")]
    ServerNotFound(String),

    #[error("server '{0}' is already registered")]
    DuplicateServer(String),

    #[error("server '{0}' is disabled")]
    ServerDisabled(String),

    #[error("tool '{tool}' on server '{server}' is disabled")]
    ToolDisabled { server: String, tool: String },

    #[error("tool '{tool}' not found in {scope}")]
    ToolNotFound { scope: String, tool: String },

    #[error("server '{server}' is unavailable: {reason}")]
    Transport { server: String, reason: String },

    #[error("server '{server}' violated the protocol: {reason}")]
    Protocol { server: String, reason: String },

    #[error("server '{server}' returned error {}: {}", .error.code, .error.message)]
    Remote { server: String, error: JsonRpcError },

    #[error("call to '{method}' on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    #[error("kit '{0}' not found")]
    KitNotFound(String),

    #[error("kit '{0}' is defined more than once")]
    DuplicateKit(String),

    #[error("kit '{kit}' selects unknown server '{server}'")]
    UnknownServer { kit: String, server: String },

    #[error("kit '{kit}' exposes tool '{tool}' from more than one server: {}", .servers.join(", "))]
    ToolCollision {
        kit: String,
        tool: String,
        servers: Vec<String>,
    },

    #[error("invalid selector '{0}'")]
    InvalidSelector(String),

    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },
}

impl ComposerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ServerNotFound(_) => "SERVER_NOT_FOUND",
            Self::DuplicateServer(_) => "DUPLICATE_SERVER",
            Self::ServerDisabled(_) => "SERVER_DISABLED",
            Self::ToolDisabled { .. } => "TOOL_DISABLED",
            Self::ToolNotFound { .. } => "TOOL_NOT_FOUND",
            Self::Transport { .. } => "TRANSPORT_ERROR",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::Remote { .. } => "REMOTE_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::KitNotFound(_) => "KIT_NOT_FOUND",
            Self::DuplicateKit(_) => "DUPLICATE_KIT",
            Self::UnknownServer { .. } => "UNKNOWN_SERVER",
            Self::ToolCollision { .. } => "TOOL_COLLISION",
            Self::InvalidSelector(_) => "INVALID_SELECTOR",
            Self::InvalidArguments { .. } => "INVALID_ARGUMENTS",
        }
    }
}

impl From<ConnectionError> for ComposerError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Transport { server, reason } => Self::Transport { server, reason },
            ConnectionError::Protocol { server, reason } => Self::Protocol { server, reason },
            ConnectionError::ToolNotFound { server, tool } => Self::ToolNotFound {
                scope: format!("server '{}'", server),
                tool,
            },
            ConnectionError::Remote { server, error } => Self::Remote { server, error },
            ConnectionError::Timeout {
                server,
                method,
                timeout_ms,
            } => Self::Timeout {
                server,
                method,
                timeout_ms,
            },
        }
    }
}

/// Errors returned by the HTTP handlers.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Composer(#[from] ComposerError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Composer(err) => {
                let status = match err {
                    ComposerError::ServerNotFound(_)
                    | ComposerError::KitNotFound(_)
                    | ComposerError::ToolNotFound { .. } => StatusCode::NOT_FOUND,
                    ComposerError::ServerDisabled(_) | ComposerError::ToolDisabled { .. } => {
                        StatusCode::FORBIDDEN
                    }
                    ComposerError::Transport { .. }
                    | ComposerError::Protocol { .. }
                    | ComposerError::Remote { .. } => StatusCode::BAD_GATEWAY,
                    ComposerError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    ComposerError::InvalidSelector(_) | ComposerError::InvalidArguments { .. } => {
                        StatusCode::BAD_REQUEST
                    }
                    ComposerError::DuplicateServer(_)
                    | ComposerError::DuplicateKit(_)
                    | ComposerError::UnknownServer { .. }
                    | ComposerError::ToolCollision { .. } => StatusCode::CONFLICT,
                };
                (status, err.code())
            }
            ApiError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            ApiError::SessionNotFound(_) => (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND"),
        };

        let body = Json(json!({
            "error": self.to_string(),
            "code": code,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_keep_their_kind() {
        let err: ComposerError = ConnectionError::Timeout {
            server: "slow".to_string(),
            method: "tools/call".to_string(),
            timeout_ms: 250,
        }
        .into();
        assert_eq!(err.code(), "TIMEOUT");

        let err: ComposerError = ConnectionError::ToolNotFound {
            server: "time".to_string(),
            tool: "nope".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "tool 'nope' not found in server 'time'");
    }

    #[test]
    fn api_error_status_codes() {
        let response =
            ApiError::from(ComposerError::ServerDisabled("weather".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = ApiError::from(ComposerError::KitNotFound("x".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = ApiError::InvalidRequest("bad".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
