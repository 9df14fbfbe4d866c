use salvo::http::StatusError;
use salvo::oapi::{self, EndpointOutRegister, ToSchema};
use salvo::prelude::*;
use thiserror::Error;

/// Errors that can occur outside the connection state machine: during
/// startup, configuration loading, or at the small HTTP surface (health
/// check, auth handshake) this binary exposes alongside the websocket
/// endpoint.
#[derive(Error, Debug)]
#[error(transparent)]
pub enum BrokerError {
    Config(#[from] figment::Error),
    #[error("{0}")]
    ConfigValidation(String),
    #[error("missing or invalid auth token")]
    Unauthorized,
    #[error("websocket upgrade failed: {0}")]
    Upgrade(String),
}

impl Scribe for BrokerError {
    fn render(self, res: &mut Response) {
        let status_error = match self {
            Self::Config(err) => {
                tracing::error!(error = ?err, "config error");
                StatusError::internal_server_error()
            }
            Self::ConfigValidation(reason) => {
                tracing::error!(reason, "config validation failed");
                StatusError::internal_server_error()
            }
            Self::Unauthorized => {
                StatusError::unauthorized().brief("missing or invalid token")
            }
            Self::Upgrade(reason) => {
                tracing::warn!(reason, "websocket upgrade failed");
                StatusError::bad_request().brief(reason)
            }
        };
        res.render(status_error);
    }
}

impl EndpointOutRegister for BrokerError {
    fn register(
        components: &mut oapi::Components,
        operation: &mut oapi::Operation,
    ) {
        use salvo::http::StatusCode;
        let responses = [
            (StatusCode::BAD_REQUEST, "Bad request"),
            (StatusCode::UNAUTHORIZED, "Invalid or missing token"),
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error"),
        ];
        for (status, description) in responses {
            operation.responses.insert(
                status.as_str(),
                oapi::Response::new(description).add_content(
                    "application/json",
                    StatusError::to_schema(components),
                ),
            );
        }
    }
}
