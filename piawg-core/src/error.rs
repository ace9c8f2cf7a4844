//! Error types for the piawg reconciler
//!
//! This module defines all error types used throughout the application,
//! split by domain. Each networked failure is classified as retryable or
//! not so the retry executor can short-circuit on rejections.

use thiserror::Error;

use crate::retry::Retryable;

/// Main error type for the piawg application
#[derive(Error, Debug)]
pub enum PiawgError {
    /// Errors related to configuration loading/parsing
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Errors returned by the provider API
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// Errors from the tunnel management facility
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Unmet runtime requirements (privileges, external tools)
    #[error("Requirement error: {0}")]
    Requirement(#[from] RequirementError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// State file (de)serialization errors
    #[error("State file error: {0}")]
    State(#[from] serde_json::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {path}")]
    LoadFailed { path: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation error: {message}")]
    ValidationError { message: String },

    #[error("Invalid log level: {value}")]
    InvalidLogLevel { value: String },

    #[error("I/O error: {message}")]
    IoError { message: String },
}

/// Provider API errors
///
/// `Transport` is the only retryable class: everything else is a
/// deliberate rejection or a malformed body, which a retry cannot fix.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("credentials rejected: {message}")]
    AuthenticationFailed { message: String },

    #[error("transport failure: {message}")]
    Transport { message: String },

    #[error("no server for region \"{region}\"")]
    NoSuchRegion { region: String },

    #[error("key registration rejected: {message}")]
    Registration { message: String },

    #[error("malformed provider response: {message}")]
    MalformedResponse { message: String },

    #[error("port forward request rejected: {message}")]
    PortForwardRejected { message: String },
}

impl Retryable for ApiError {
    fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Transport { .. })
    }
}

/// Tunnel management facility errors
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("failed to bring interface up: {reason}")]
    ActivationFailed { reason: String },

    #[error("failed to bring interface down: {reason}")]
    TeardownFailed { reason: String },

    #[error("failed to run tunnel command: {reason}")]
    CommandSpawn { reason: String },

    #[error("tunnel configuration artifact error: {reason}")]
    ConfigArtifact { reason: String },

    #[error("connectivity probe failed: {reason}")]
    ProbeFailed { reason: String },

    #[error("tunnel routes to {observed}, expected {expected}")]
    RouteMismatch {
        expected: std::net::Ipv4Addr,
        observed: std::net::Ipv4Addr,
    },
}

impl Retryable for TunnelError {
    fn is_retryable(&self) -> bool {
        // A missing wg-quick binary or an unwritable config file will not
        // heal between attempts; a failed up/down, an unreachable probe
        // endpoint, or a tunnel that came up routing to the wrong place
        // might.
        !matches!(
            self,
            TunnelError::CommandSpawn { .. } | TunnelError::ConfigArtifact { .. }
        )
    }
}

/// Runtime requirement check failures
#[derive(Error, Debug)]
pub enum RequirementError {
    #[error("not running as root (interface changes need CAP_NET_ADMIN)")]
    NotRoot,

    #[error("required tool not found: {tool}")]
    MissingTool { tool: String },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, PiawgError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_is_the_only_retryable_api_error() {
        assert!(ApiError::Transport {
            message: "timeout".into()
        }
        .is_retryable());

        let rejections = [
            ApiError::AuthenticationFailed {
                message: "bad password".into(),
            },
            ApiError::NoSuchRegion {
                region: "nowhere".into(),
            },
            ApiError::Registration {
                message: "pubkey rejected".into(),
            },
            ApiError::MalformedResponse {
                message: "truncated".into(),
            },
            ApiError::PortForwardRejected {
                message: "expired".into(),
            },
        ];
        for err in rejections {
            assert!(!err.is_retryable(), "{err} must not be retried");
        }
    }

    #[test]
    fn tunnel_spawn_failures_are_not_retryable() {
        assert!(TunnelError::ActivationFailed {
            reason: "exit 1".into()
        }
        .is_retryable());
        assert!(TunnelError::TeardownFailed {
            reason: "exit 1".into()
        }
        .is_retryable());
        assert!(!TunnelError::CommandSpawn {
            reason: "not found".into()
        }
        .is_retryable());
        assert!(!TunnelError::ConfigArtifact {
            reason: "read-only filesystem".into()
        }
        .is_retryable());
    }

    #[test]
    fn verification_failures_are_retryable() {
        assert!(TunnelError::ProbeFailed {
            reason: "timeout".into()
        }
        .is_retryable());
        assert!(TunnelError::RouteMismatch {
            expected: std::net::Ipv4Addr::new(4, 3, 2, 1),
            observed: std::net::Ipv4Addr::new(9, 9, 9, 9),
        }
        .is_retryable());
    }
}
