// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SDK-specific error types.

use fnhost_protocol::ClientError;
use fnhost_protocol::rpc::status;
use thiserror::Error;

/// Errors that can occur in the SDK.
#[derive(Debug, Error)]
pub enum SdkError {
    /// Configuration error (missing or invalid environment variable)
    #[error("configuration error: {0}")]
    Config(String),

    /// The host has no further event for this worker and is retiring it.
    #[error("no next event for worker {0}")]
    NoNextEvent(String),

    /// The payload was already fetched or discarded.
    #[error("no payload for event {0}")]
    NoPayload(String),

    /// Server returned an error response
    #[error("server error: {code} - {message}")]
    Server {
        /// Error code from the server
        code: String,
        /// Error message from the server
        message: String,
    },

    /// Transport failure talking to the host
    #[error("connection error: {0}")]
    Connection(ClientError),

    /// The handler failed
    #[error("handler error: {0}")]
    Handler(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl SdkError {
    /// Map a client error for a call about `id`.
    pub(crate) fn from_client(err: ClientError, id: &str) -> Self {
        match err {
            ClientError::Status { code, .. } if code == status::NOT_FOUND => {
                SdkError::NoPayload(id.to_string())
            }
            ClientError::Status { code, message } => SdkError::Server { code, message },
            other => SdkError::Connection(other),
        }
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        SdkError::Serialization(err.to_string())
    }
}

/// Type alias for SDK results.
pub type Result<T> = std::result::Result<T, SdkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let not_found = ClientError::Status {
            code: status::NOT_FOUND.into(),
            message: "gone".into(),
        };
        assert!(matches!(
            SdkError::from_client(not_found, "e-1"),
            SdkError::NoPayload(id) if id == "e-1"
        ));

        let invalid = ClientError::Status {
            code: status::INVALID_ARGUMENT.into(),
            message: "bad status".into(),
        };
        assert_eq!(
            SdkError::from_client(invalid, "e-1").to_string(),
            "server error: INVALID_ARGUMENT - bad status"
        );

        assert!(matches!(
            SdkError::from_client(ClientError::NotConnected, "e-1"),
            SdkError::Connection(_)
        ));
    }
}
