use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::negotiation::SessionDescription;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier assigned by the call record service. Never generated locally.
    CallId
);
string_id!(
    /// Identity of an authenticated participant.
    UserId
);
string_id!(
    /// Messaging thread a call is scoped to.
    ConversationId
);

/// Media kind of a call, fixed when the call record is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn has_video(self) -> bool {
        self == Self::Video
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status as tracked by the call record service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    #[default]
    Ringing,
    Answered,
    Rejected,
    Ended,
}

/// One call attempt, as acknowledged by the call record service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: CallId,
    pub conversation_id: ConversationId,
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub call_type: CallType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    #[serde(default)]
    pub status: CallStatus,
}

impl CallRecord {
    pub fn is_caller(&self, user: &UserId) -> bool {
        &self.caller_id == user
    }

    pub fn is_receiver(&self, user: &UserId) -> bool {
        &self.receiver_id == user
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParticipantError {
    #[error("user {user} is not a participant of call {call_id}")]
    NotParticipant { call_id: CallId, user: UserId },
}

/// Returns the participant of `record` that is not `self_id`.
///
/// Fails when `self_id` is neither the caller nor the receiver.
pub fn other_participant<'a>(
    record: &'a CallRecord,
    self_id: &UserId,
) -> Result<&'a UserId, ParticipantError> {
    if record.is_caller(self_id) {
        Ok(&record.receiver_id)
    } else if record.is_receiver(self_id) {
        Ok(&record.caller_id)
    } else {
        Err(ParticipantError::NotParticipant {
            call_id: record.id.clone(),
            user: self_id.clone(),
        })
    }
}
