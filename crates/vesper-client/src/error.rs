//! Client error types.

use thiserror::Error;
use vesper_core::UserId;

use crate::backend::BackendError;

/// Errors from client operations.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Operation attempted with no valid session.
    #[error("no valid session")]
    IdentityMissing,

    /// Connecting to the backend failed. Retryable on the next identity
    /// event or forced refresh; the coordinator never retries on a timer.
    #[error("connect failed for {identity}: {reason}")]
    ConnectFailure {
        /// Identity the connect was issued for.
        identity: UserId,
        /// Backend-reported reason.
        reason: String,
    },

    /// The current identity may not message the target.
    #[error("not authorized: {reason}")]
    NotAuthorized {
        /// Backend-reported reason.
        reason: String,
    },

    /// A direct conversation was requested between an identity and itself.
    #[error("cannot open a direct conversation with yourself")]
    InvalidTarget,

    /// Network or backend failure. Retryable by the caller.
    #[error("backend unavailable: {reason}")]
    TransientBackend {
        /// Backend-reported reason.
        reason: String,
    },

    /// A completed async operation whose result must be dropped because a
    /// newer identity superseded it. Internal signal: callers discard
    /// silently, nothing user-facing is built from this.
    #[error("result belongs to a superseded identity")]
    StaleOperationDiscarded,
}

impl ClientError {
    /// Whether the caller may retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectFailure { .. }
            | Self::TransientBackend { .. }
            | Self::StaleOperationDiscarded => true,
            Self::IdentityMissing | Self::NotAuthorized { .. } | Self::InvalidTarget => false,
        }
    }

    /// Whether the error should reach the user at all.
    ///
    /// [`Self::StaleOperationDiscarded`] marks soft-cancelled work and must
    /// never surface in UI error handling.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::StaleOperationDiscarded)
    }
}

impl From<BackendError> for ClientError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotAuthorized { reason } => Self::NotAuthorized { reason },
            BackendError::Transport { reason } => Self::TransientBackend { reason },
            BackendError::Timeout => Self::TransientBackend { reason: "timed out".to_string() },
            BackendError::NotConnected => {
                Self::TransientBackend { reason: "no live connection".to_string() }
            },
            BackendError::InvalidRequest { reason } => {
                Self::TransientBackend { reason: format!("rejected request: {reason}") }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_failure_is_retryable() {
        let err = ClientError::ConnectFailure {
            identity: UserId::new("u1"),
            reason: "dns".to_string(),
        };
        assert!(err.is_retryable());
        assert!(err.is_user_visible());
    }

    #[test]
    fn invalid_target_is_terminal() {
        assert!(!ClientError::InvalidTarget.is_retryable());
    }

    #[test]
    fn stale_discard_is_never_user_visible() {
        let err = ClientError::StaleOperationDiscarded;
        assert!(!err.is_user_visible());
        assert!(err.is_retryable());
    }

    #[test]
    fn timeout_maps_to_transient() {
        let err = ClientError::from(BackendError::Timeout);
        assert!(matches!(err, ClientError::TransientBackend { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn not_authorized_maps_through() {
        let err = ClientError::from(BackendError::NotAuthorized { reason: "blocked".into() });
        assert!(matches!(err, ClientError::NotAuthorized { .. }));
        assert!(!err.is_retryable());
    }
}
