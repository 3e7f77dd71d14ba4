pub use peercall_core::{net, signaling, types};
pub use peercall_core::{
    CallId, CallRecord, CallStatus, CallType, ConversationId, IceCandidate, ParticipantError,
    SdpType, SessionDescription, SignalingEvent, SignalingTransport, UserId, other_participant,
};

pub mod calls;

#[cfg(test)]
mod test_utils;
