//! Call state machine implementation.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::CallError;
use super::media::MediaAccessError;

/// Why a call attempt reached `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// `end_call` on this side, including cancelling a call that was still ringing.
    LocalHangup,
    /// `reject_call` on this side.
    LocalRejected,
    PeerRejected,
    PeerEnded,
    /// SDP or ICE error while negotiating.
    NegotiationFailed,
    /// The peer connection reported `disconnected` or `failed`.
    ConnectionLost,
    MediaAccessFailed,
    SignalingUnavailable,
    RecordServiceFailed,
}

impl EndReason {
    /// Whether the remote participant still has to be told the call is over.
    pub fn notifies_peer(self) -> bool {
        !matches!(self, Self::PeerRejected | Self::PeerEnded)
    }

    pub fn into_error(self) -> CallError {
        match self {
            Self::LocalHangup | Self::LocalRejected => CallError::Cancelled,
            Self::PeerRejected => CallError::PeerRejected,
            Self::PeerEnded => CallError::PeerEnded,
            Self::NegotiationFailed => CallError::NegotiationFailed("negotiation aborted".into()),
            Self::ConnectionLost => CallError::NegotiationFailed("peer connection lost".into()),
            Self::MediaAccessFailed => {
                CallError::MediaAccess(MediaAccessError::Device("capture stopped".into()))
            }
            Self::SignalingUnavailable => CallError::SignalingUnavailable,
            Self::RecordServiceFailed => {
                CallError::RecordService("call record service unavailable".into())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Engine-level call phase. This is the operative truth for the UI; the
/// record service keeps its own `CallStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub enum CallPhase {
    #[default]
    Idle,
    /// `start_call` is acquiring media, creating the offer and persisting it.
    Outgoing { started_at: DateTime<Utc> },
    /// An `incoming-call` event is waiting for `answer_call` or `reject_call`.
    Incoming { received_at: DateTime<Utc> },
    /// Descriptions are being exchanged and ICE is running.
    Negotiating { since: DateTime<Utc> },
    Active { connected_at: DateTime<Utc> },
    Ended {
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallPhase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Outgoing { .. } => "outgoing",
            Self::Incoming { .. } => "incoming",
            Self::Negotiating { .. } => "negotiating",
            Self::Active { .. } => "active",
            Self::Ended { .. } => "ended",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_incoming(&self) -> bool {
        matches!(self, Self::Incoming { .. })
    }

    pub fn is_negotiating(&self) -> bool {
        matches!(self, Self::Negotiating { .. })
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    /// True from the moment a call starts ringing until it ends.
    pub fn is_in_progress(&self) -> bool {
        !matches!(self, Self::Idle | Self::Ended { .. })
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        match self {
            Self::Ended { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Apply a state transition. Returns the new phase, or an error if the
    /// transition is not allowed from the current one.
    pub fn apply(&self, transition: CallTransition) -> Result<CallPhase, InvalidTransition> {
        let now = Utc::now();
        let next = match (self, transition) {
            (Self::Idle, CallTransition::Dial) => Self::Outgoing { started_at: now },
            (Self::Idle, CallTransition::OfferReceived) => Self::Incoming { received_at: now },
            (Self::Outgoing { .. }, CallTransition::OfferPersisted)
            | (Self::Incoming { .. }, CallTransition::LocalAnswered) => {
                Self::Negotiating { since: now }
            }
            (Self::Negotiating { .. }, CallTransition::MediaConnected) => {
                Self::Active { connected_at: now }
            }
            (Self::Active { connected_at }, CallTransition::Terminated { reason }) => Self::Ended {
                reason,
                ended_at: now,
                duration_secs: Some(now.signed_duration_since(*connected_at).num_seconds()),
            },
            (
                Self::Idle | Self::Outgoing { .. } | Self::Incoming { .. } | Self::Negotiating { .. },
                CallTransition::Terminated { reason },
            ) => Self::Ended {
                reason,
                ended_at: now,
                duration_secs: None,
            },
            (Self::Ended { .. }, CallTransition::Reset) => Self::Idle,
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: current.name().to_string(),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        Ok(next)
    }
}

/// State transitions for calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    Dial,
    OfferReceived,
    OfferPersisted,
    LocalAnswered,
    MediaConnected,
    Terminated { reason: EndReason },
    Reset,
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(phase: CallPhase, steps: &[CallTransition]) -> CallPhase {
        steps
            .iter()
            .fold(phase, |p, t| p.apply(*t).expect("valid transition"))
    }

    /// Flow: Idle → Outgoing → Negotiating → Active → Ended → Idle
    #[test]
    fn test_outgoing_call_flow() {
        let phase = drive(
            CallPhase::Idle,
            &[
                CallTransition::Dial,
                CallTransition::OfferPersisted,
                CallTransition::MediaConnected,
            ],
        );
        assert!(phase.is_active());
        assert!(phase.is_in_progress());

        let ended = phase
            .apply(CallTransition::Terminated {
                reason: EndReason::LocalHangup,
            })
            .unwrap();
        assert!(ended.is_ended());
        assert!(!ended.is_in_progress());
        if let CallPhase::Ended { duration_secs, .. } = ended {
            assert!(duration_secs.is_some());
        }

        assert!(ended.apply(CallTransition::Reset).unwrap().is_idle());
    }

    /// Flow: Idle → Incoming → Negotiating → Active
    #[test]
    fn test_incoming_call_flow() {
        let phase = drive(
            CallPhase::Idle,
            &[CallTransition::OfferReceived, CallTransition::LocalAnswered],
        );
        assert!(phase.is_negotiating());
        assert!(
            phase
                .apply(CallTransition::MediaConnected)
                .unwrap()
                .is_active()
        );
    }

    #[test]
    fn test_rejecting_incoming_call_has_no_duration() {
        let phase = drive(CallPhase::Idle, &[CallTransition::OfferReceived]);
        let ended = phase
            .apply(CallTransition::Terminated {
                reason: EndReason::LocalRejected,
            })
            .unwrap();
        assert_eq!(ended.end_reason(), Some(EndReason::LocalRejected));
        if let CallPhase::Ended { duration_secs, .. } = ended {
            assert!(duration_secs.is_none());
        }
    }

    #[test]
    fn test_idle_can_short_circuit_to_ended() {
        let ended = CallPhase::Idle
            .apply(CallTransition::Terminated {
                reason: EndReason::PeerEnded,
            })
            .unwrap();
        assert!(ended.is_ended());
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(CallPhase::Idle.apply(CallTransition::MediaConnected).is_err());
        assert!(CallPhase::Idle.apply(CallTransition::LocalAnswered).is_err());

        let outgoing = CallPhase::Idle.apply(CallTransition::Dial).unwrap();
        assert!(outgoing.apply(CallTransition::Dial).is_err());
        assert!(outgoing.apply(CallTransition::LocalAnswered).is_err());
        assert!(outgoing.apply(CallTransition::MediaConnected).is_err());
    }

    #[test]
    fn test_ended_call_rejects_everything_but_reset() {
        let ended = CallPhase::Idle
            .apply(CallTransition::Dial)
            .unwrap()
            .apply(CallTransition::Terminated {
                reason: EndReason::MediaAccessFailed,
            })
            .unwrap();

        let err = ended
            .apply(CallTransition::Terminated {
                reason: EndReason::LocalHangup,
            })
            .unwrap_err();
        assert_eq!(err.current_state, "ended");
        assert!(ended.apply(CallTransition::MediaConnected).is_err());
        assert!(ended.apply(CallTransition::Reset).is_ok());
    }

    #[test]
    fn test_peer_initiated_endings_do_not_notify_back() {
        assert!(!EndReason::PeerEnded.notifies_peer());
        assert!(!EndReason::PeerRejected.notifies_peer());
        assert!(EndReason::LocalHangup.notifies_peer());
        assert!(EndReason::ConnectionLost.notifies_peer());
    }
}
