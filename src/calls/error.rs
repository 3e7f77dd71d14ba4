//! Call-related error types.

use peercall_core::ParticipantError;
use thiserror::Error;

use super::media::MediaAccessError;
use super::peer::NegotiationError;
use super::state::{EndReason, InvalidTransition};

/// Errors surfaced to the UI layer. Every variant is terminal for the call
/// attempt it was raised for; none is retried by the engine.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("media access failed: {0}")]
    MediaAccess(#[from] MediaAccessError),

    #[error("a call is already in progress")]
    CallInProgress,

    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("signaling transport is not connected")]
    SignalingUnavailable,

    #[error("call rejected by peer")]
    PeerRejected,

    #[error("call ended by peer")]
    PeerEnded,

    #[error("call record service error: {0}")]
    RecordService(String),

    #[error("call not found: {0}")]
    NotFound(String),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("call attempt cancelled")]
    Cancelled,

    #[error(transparent)]
    NotParticipant(#[from] ParticipantError),
}

impl From<NegotiationError> for CallError {
    fn from(err: NegotiationError) -> Self {
        Self::NegotiationFailed(err.to_string())
    }
}

impl CallError {
    /// The terminal reason observers see when this error ends a call.
    pub fn end_reason(&self) -> EndReason {
        match self {
            Self::MediaAccess(_) => EndReason::MediaAccessFailed,
            Self::NegotiationFailed(_) | Self::NotParticipant(_) => EndReason::NegotiationFailed,
            Self::SignalingUnavailable => EndReason::SignalingUnavailable,
            Self::PeerRejected => EndReason::PeerRejected,
            Self::PeerEnded => EndReason::PeerEnded,
            Self::RecordService(_) => EndReason::RecordServiceFailed,
            Self::Cancelled | Self::CallInProgress | Self::NotFound(_) => EndReason::LocalHangup,
            Self::InvalidTransition(_) => EndReason::NegotiationFailed,
        }
    }

    /// Whether the user can fix the condition themselves (grant permission,
    /// wait for the current call to finish).
    pub fn is_user_recoverable(&self) -> bool {
        matches!(self, Self::MediaAccess(_) | Self::CallInProgress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_recoverable_split() {
        assert!(CallError::CallInProgress.is_user_recoverable());
        assert!(CallError::MediaAccess(MediaAccessError::PermissionDenied).is_user_recoverable());
        assert!(!CallError::PeerRejected.is_user_recoverable());
        assert!(!CallError::NegotiationFailed("ice".into()).is_user_recoverable());
        assert!(!CallError::SignalingUnavailable.is_user_recoverable());
    }

    #[test]
    fn test_end_reason_round_trip_for_peer_conditions() {
        for err in [CallError::PeerRejected, CallError::PeerEnded] {
            let reason = err.end_reason();
            assert_eq!(reason.into_error().end_reason(), reason);
        }
    }
}
