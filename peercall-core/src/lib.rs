//! Runtime-agnostic building blocks shared by the call engine and its
//! transports: the call data model, the signaling-event contract and the
//! network seams (`HttpClient`, `SignalingTransport`).

pub mod net;
pub mod signaling;
pub mod types;

pub use signaling::{SignalingEvent, SignalingTransport};
pub use types::call::{
    CallId, CallRecord, CallStatus, CallType, ConversationId, ParticipantError, UserId,
    other_participant,
};
pub use types::negotiation::{IceCandidate, SdpType, SessionDescription};
