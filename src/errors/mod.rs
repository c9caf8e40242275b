//! Error types for the Wayfinder client.

use crate::validation::{DependencyViolation, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Fixed message used by the API for an optimistic-concurrency conflict.
/// The typed object layer matches on this to decide whether an update
/// can be silently retried.
pub const OBJECT_MODIFIED_MESSAGE: &str = "the object has been modified, please try again";

/// Response header which discriminates an object-modified 409 from a
/// dependency-violation 409.
pub const OBJECT_MODIFIED_HEADER: &str = "x-wayfinder-objectmodified";

/// Errors produced by the client.
#[derive(Error, Debug)]
pub enum Error {
    /// The selected profile does not exist in the configuration.
    #[error("missing profile")]
    MissingProfile,

    /// The selected profile is incomplete or inconsistent.
    #[error("invalid profile {profile}: {reason}")]
    InvalidProfile {
        /// Name of the offending profile.
        profile: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A resource request was attempted without an API group and version.
    #[error("unable to determine API group and version for resource, cannot perform API operation")]
    MissingGroupVersion,

    /// A structured error response from the API.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The HTTP request could not be performed. Connection-level errors
    /// are not retried; they propagate as-is.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The operation was cancelled before completion.
    #[error("operation has been cancelled")]
    Cancelled,

    /// The retry budget was exhausted.
    #[error("reached max attempts")]
    MaxAttemptsReached,

    /// A payload or response body could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The client configuration file could not be read or written.
    #[error("configuration error: {0}")]
    Config(String),

    /// A token blob could not be decoded.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// An identity refresh was requested but no refresh or exchange
    /// token is available.
    #[error("no refresh or exchange token available to refresh")]
    NoRefreshToken,

    /// A token presented for exchange did not carry the exchange scope.
    #[error("token is not an exchange token")]
    NonExchangeToken,

    /// The token-exchange call itself failed.
    #[error("failed to exchange access token for API token - please check the access token is valid: {0}")]
    TokenExchange(#[source] Box<Error>),

    /// Re-fetching an object after a conflict failed; the update cannot
    /// be retried.
    #[error("failed to retrieve updated version of the object after an object modified conflict: {0}")]
    ConflictRefetch(#[source] Box<Error>),

    /// The operation is invalid for the target resource type.
    #[error("{0}")]
    InvalidOperation(String),
}

impl Error {
    /// Creates an invalid-profile error.
    pub fn invalid_profile(profile: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidProfile {
            profile: profile.into(),
            reason: reason.into(),
        }
    }

    /// Returns the underlying API error, if this is one.
    pub fn as_api_error(&self) -> Option<&ApiError> {
        match self {
            Self::Api(e) => Some(e),
            _ => None,
        }
    }

    fn has_status(&self, code: u16) -> bool {
        self.as_api_error().map(|e| e.code == code).unwrap_or(false)
    }

    /// Checks if the error is a 404.
    pub fn is_not_found(&self) -> bool {
        self.has_status(404)
    }

    /// Checks if the error is a 401.
    pub fn is_not_authorized(&self) -> bool {
        self.has_status(401)
    }

    /// Checks if the error is a 403.
    pub fn is_not_allowed(&self) -> bool {
        self.has_status(403)
    }

    /// Checks if the error is a 400.
    pub fn is_bad_request(&self) -> bool {
        self.has_status(400)
    }

    /// Checks if the error is a 405.
    pub fn is_method_not_allowed(&self) -> bool {
        self.has_status(405)
    }

    /// Checks if the error is a 503.
    pub fn is_service_unavailable(&self) -> bool {
        self.has_status(503)
    }

    /// Checks if the error is a 501.
    pub fn is_not_implemented(&self) -> bool {
        self.has_status(501)
    }

    /// Checks if the error is the optimistic-concurrency conflict
    /// sentinel.
    pub fn is_object_modified(&self) -> bool {
        self.as_api_error()
            .map(ApiError::is_object_modified)
            .unwrap_or(false)
    }

    /// Checks if the error indicates the resource already exists.
    pub fn is_already_exists(&self) -> bool {
        self.as_api_error()
            .map(|e| e.message.contains("already exists"))
            .unwrap_or(false)
    }
}

/// Client-side representation of a structured error returned by the API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiError {
    /// HTTP status code of the response.
    #[serde(default)]
    pub code: u16,
    /// The actual error thrown by the upstream, when provided.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
    /// Human-readable message related to the error.
    #[serde(default)]
    pub message: String,
    /// URI of the request.
    #[serde(default)]
    pub uri: String,
    /// HTTP verb of the request.
    #[serde(default)]
    pub verb: String,
    /// Structured validation error, populated for 400 responses with a
    /// decodable body.
    #[serde(skip)]
    pub validation: Option<ValidationError>,
    /// Structured dependency violation, populated for 409 responses not
    /// marked as object-modified.
    #[serde(skip)]
    pub dependency_violation: Option<DependencyViolation>,
}

impl ApiError {
    /// Creates an API error for the given request.
    pub fn new(code: u16, verb: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            code,
            verb: verb.into(),
            uri: uri.into(),
            ..Default::default()
        }
    }

    /// Checks if this error is the object-modified conflict sentinel.
    pub fn is_object_modified(&self) -> bool {
        self.message == OBJECT_MODIFIED_MESSAGE
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_display() {
        let err = ApiError {
            message: "Resource does not exist".to_string(),
            ..ApiError::new(404, "GET", "/resources/app.appvia.io/v2beta1/appenvs/x")
        };
        assert_eq!(err.to_string(), "Resource does not exist");
    }

    #[test]
    fn test_predicates() {
        let not_found = Error::Api(ApiError {
            message: "Resource does not exist".to_string(),
            ..ApiError::new(404, "GET", "/x")
        });
        assert!(not_found.is_not_found());
        assert!(!not_found.is_not_allowed());

        let conflict = Error::Api(ApiError {
            message: OBJECT_MODIFIED_MESSAGE.to_string(),
            ..ApiError::new(409, "PUT", "/x")
        });
        assert!(conflict.is_object_modified());

        let exists = Error::Api(ApiError {
            message: "appenv prod already exists".to_string(),
            ..ApiError::new(409, "POST", "/x")
        });
        assert!(exists.is_already_exists());

        assert!(!Error::MissingProfile.is_not_found());
    }

    #[test]
    fn test_api_error_decodes() {
        let body = r#"{"code":503,"message":"boom","detail":"upstream exploded"}"#;
        let err: ApiError = serde_json::from_str(body).unwrap();
        assert_eq!(err.code, 503);
        assert_eq!(err.detail, "upstream exploded");
    }
}
