use revalid_core::ApiError;
use thiserror::Error;

use crate::store::StoreError;

/// Marker carried by connectivity-required failures so callers can render a
/// dedicated offline state.
pub const NETWORK_REQUIRED_MARKER: &str = "NETWORK_REQUIRED";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("NETWORK_REQUIRED: {endpoint} needs an internet connection")]
    NetworkRequired { endpoint: String },
    #[error("offline store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl ServiceError {
    pub fn is_network_required(&self) -> bool {
        matches!(self, ServiceError::NetworkRequired { .. })
    }

    /// A confirmed server response, passed through unchanged.
    pub fn is_server_error(&self) -> bool {
        matches!(self, ServiceError::Api(err) if err.is_server_error())
    }

    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            ServiceError::Api(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_required_message_starts_with_marker() {
        let err = ServiceError::NetworkRequired {
            endpoint: "/api/v1/work-hours".into(),
        };
        assert!(err.to_string().starts_with(NETWORK_REQUIRED_MARKER));
        assert!(err.is_network_required());
        assert!(!err.is_server_error());
    }
}
