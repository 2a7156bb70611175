// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for fnhost-core.
//!
//! Every error a worker can trigger maps to an [`RpcError`] with a gRPC-style
//! status code, so a misbehaving worker gets a typed answer instead of a hang.

use fnhost_protocol::rpc::{RpcError, status};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Popped or addressed an id the queue does not hold.
    #[error("Queue has no item with id {id}")]
    NoItem { id: String },

    /// Http call for a request that was never enqueued or already cancelled.
    #[error("No request with id {id}, it was never enqueued or has been cancelled")]
    UnknownRequest { id: String },

    /// The scheduler decided this worker gets nothing (shutdown, drain).
    #[error("No next event for worker {worker_id}")]
    NoNextEvent { worker_id: String },

    #[error("Unknown service '{service}'")]
    UnknownService { service: String },

    #[error("Service '{service}' has no method '{method}'")]
    UnknownMethod { service: String, method: String },

    #[error("Service '{service}' is already registered")]
    DuplicateService { service: String },

    /// Queues can only be added before the listener starts.
    #[error("Service table is frozen, '{service}' must be registered before listening")]
    ServiceTableFrozen { service: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Database error during {operation}: {details}")]
    Database { operation: String, details: String },

    #[error("Transport error: {details}")]
    Transport { details: String },

    #[error("Serialization error: {details}")]
    Serialization { details: String },
}

impl CoreError {
    pub fn to_rpc_error(&self) -> RpcError {
        RpcError {
            code: self.status_code().to_string(),
            message: self.to_string(),
        }
    }

    pub fn status_code(&self) -> &'static str {
        match self {
            Self::NoItem { .. } | Self::UnknownRequest { .. } | Self::NoNextEvent { .. } => {
                status::NOT_FOUND
            }
            Self::UnknownService { .. } | Self::UnknownMethod { .. } => status::UNIMPLEMENTED,
            Self::DuplicateService { .. } | Self::ServiceTableFrozen { .. } => {
                status::FAILED_PRECONDITION
            }
            Self::InvalidRequest { .. } => status::INVALID_ARGUMENT,
            Self::Unavailable { .. } | Self::Transport { .. } => status::UNAVAILABLE,
            Self::Database { .. } | Self::Serialization { .. } => status::INTERNAL,
        }
    }

    pub(crate) fn database(operation: &str, err: impl std::fmt::Display) -> Self {
        Self::Database {
            operation: operation.to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::database("migrate", err)
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization {
            details: err.to_string(),
        }
    }
}

impl From<prost::DecodeError> for CoreError {
    fn from(err: prost::DecodeError) -> Self {
        CoreError::InvalidRequest {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_item_message() {
        let err = CoreError::NoItem { id: "1".into() };
        assert_eq!(err.to_string(), "Queue has no item with id 1");
        assert_eq!(err.status_code(), status::NOT_FOUND);
    }

    #[test]
    fn test_to_rpc_error_codes() {
        let cases = [
            (
                CoreError::UnknownRequest { id: "r".into() },
                status::NOT_FOUND,
            ),
            (
                CoreError::NoNextEvent {
                    worker_id: "w".into(),
                },
                status::NOT_FOUND,
            ),
            (
                CoreError::UnknownService {
                    service: "Mail".into(),
                },
                status::UNIMPLEMENTED,
            ),
            (
                CoreError::UnknownMethod {
                    service: "HttpQueue".into(),
                    method: "rewind".into(),
                },
                status::UNIMPLEMENTED,
            ),
            (
                CoreError::InvalidRequest {
                    message: "bad".into(),
                },
                status::INVALID_ARGUMENT,
            ),
            (
                CoreError::Unavailable {
                    reason: "closed".into(),
                },
                status::UNAVAILABLE,
            ),
            (
                CoreError::database("insert", "disk full"),
                status::INTERNAL,
            ),
        ];

        for (err, code) in cases {
            let rpc = err.to_rpc_error();
            assert_eq!(rpc.code, code, "{err}");
            assert_eq!(rpc.message, err.to_string());
        }
    }

    #[test]
    fn test_decode_error_is_invalid_argument() {
        use prost::Message;

        // Field 1, length 5, no bytes following.
        let decode_err = fnhost_protocol::messages::Pop::decode(&[0x0a, 0x05][..]).unwrap_err();
        let err: CoreError = decode_err.into();
        assert_eq!(err.status_code(), status::INVALID_ARGUMENT);
    }

    #[test]
    fn test_database_display() {
        let err = CoreError::database("acquire_job", "locked");
        assert_eq!(err.to_string(), "Database error during acquire_job: locked");
    }
}
