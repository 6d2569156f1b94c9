//! ---
//! pdk_section: "01-core-functionality"
//! pdk_subsection: "module"
//! pdk_type: "source"
//! pdk_scope: "code"
//! pdk_description: "Shared primitives and utilities for the replay runtime."
//! pdk_version: "v0.0.0-prealpha"
//! pdk_owner: "tbd"
//! ---
use thiserror::Error;

/// Error kinds surfaced to replay clients.
///
/// The first five are client errors and travel outward as `ERROR` events or
/// HTTP 4xx responses; [`ReplayError::Internal`] is logged in full and
/// surfaces only as a generic message.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Session not found: {0}")]
    UnknownSession(String),
    #[error("{0}")]
    InvalidTime(String),
    #[error("Invalid speed multiplier: {0}")]
    InvalidSpeed(f64),
    #[error("No active session: {0}")]
    NoActiveSession(String),
    #[error("{0}")]
    BadFrame(String),
    #[error("Internal error")]
    Internal(#[source] anyhow::Error),
}

impl ReplayError {
    /// Message safe to hand to a client. Internal errors are not leaked.
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(_) => "Internal error processing command".to_owned(),
            other => other.to_string(),
        }
    }

    /// True for errors caused by the client rather than the server.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Internal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_do_not_leak() {
        let err = ReplayError::Internal(anyhow::anyhow!("redis pool exhausted at 10.2.3.4"));
        assert_eq!(err.client_message(), "Internal error processing command");
        assert!(!err.is_client_error());
    }

    #[test]
    fn client_errors_carry_their_message() {
        let err = ReplayError::InvalidTime("Target time outside session bounds".into());
        assert_eq!(err.client_message(), "Target time outside session bounds");
        assert!(err.is_client_error());
    }
}
