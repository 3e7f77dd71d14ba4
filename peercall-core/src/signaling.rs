//! The signaling-event contract.
//!
//! Five directed events travel over the relay. On the wire every event is a
//! JSON object `{"event": "<name>", "data": {...}}`; the payload always carries
//! the call id and, for client-originated events, the user the relay should
//! route it to.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::call::{CallId, CallRecord, UserId};
use crate::types::negotiation::{IceCandidate, SessionDescription};

pub const INCOMING_CALL: &str = "incoming-call";
pub const CALL_ANSWERED: &str = "call-answered";
pub const CALL_REJECTED: &str = "call-rejected";
pub const CALL_ENDED: &str = "call-ended";
pub const ICE_CANDIDATE: &str = "ice-candidate";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum SignalingEvent {
    /// Relay -> receiver, after the caller's record was persisted.
    #[serde(rename_all = "camelCase")]
    IncomingCall {
        call: CallRecord,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_user_id: Option<UserId>,
    },
    /// Receiver -> caller.
    #[serde(rename_all = "camelCase")]
    CallAnswered {
        call_id: CallId,
        answer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_user_id: Option<UserId>,
    },
    /// Receiver -> caller.
    #[serde(rename_all = "camelCase")]
    CallRejected {
        call_id: CallId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_user_id: Option<UserId>,
    },
    /// Either direction; also used to cancel a call that is still ringing.
    #[serde(rename_all = "camelCase")]
    CallEnded {
        call_id: CallId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_user_id: Option<UserId>,
    },
    /// Either direction, many per call.
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        call_id: CallId,
        candidate: IceCandidate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_user_id: Option<UserId>,
    },
}

impl SignalingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::IncomingCall { .. } => INCOMING_CALL,
            Self::CallAnswered { .. } => CALL_ANSWERED,
            Self::CallRejected { .. } => CALL_REJECTED,
            Self::CallEnded { .. } => CALL_ENDED,
            Self::IceCandidate { .. } => ICE_CANDIDATE,
        }
    }

    pub fn call_id(&self) -> &CallId {
        match self {
            Self::IncomingCall { call, .. } => &call.id,
            Self::CallAnswered { call_id, .. }
            | Self::CallRejected { call_id, .. }
            | Self::CallEnded { call_id, .. }
            | Self::IceCandidate { call_id, .. } => call_id,
        }
    }

    /// The user the relay should deliver this event to.
    pub fn target_user_id(&self) -> Option<&UserId> {
        match self {
            Self::IncomingCall {
                call,
                target_user_id,
            } => target_user_id.as_ref().or(Some(&call.receiver_id)),
            Self::CallAnswered { target_user_id, .. }
            | Self::CallRejected { target_user_id, .. }
            | Self::CallEnded { target_user_id, .. }
            | Self::IceCandidate { target_user_id, .. } => target_user_id.as_ref(),
        }
    }

    pub fn answered(call_id: CallId, answer: SessionDescription, target: UserId) -> Self {
        Self::CallAnswered {
            call_id,
            answer,
            target_user_id: Some(target),
        }
    }

    pub fn rejected(call_id: CallId, target: UserId) -> Self {
        Self::CallRejected {
            call_id,
            target_user_id: Some(target),
        }
    }

    pub fn ended(call_id: CallId, target: UserId) -> Self {
        Self::CallEnded {
            call_id,
            target_user_id: Some(target),
        }
    }

    pub fn candidate(call_id: CallId, candidate: IceCandidate, target: UserId) -> Self {
        Self::IceCandidate {
            call_id,
            candidate,
            target_user_id: Some(target),
        }
    }
}

/// A persistent, authenticated, bidirectional event channel to the relay.
///
/// Inbound events are delivered through the receiver returned by `connect`;
/// a consumer stops listening by dropping it. Events the transport cannot
/// decode are skipped, never delivered half-parsed.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Opens the channel using `credential` as the bearer token.
    async fn connect(&self, credential: &str) -> Result<mpsc::Receiver<SignalingEvent>>;

    /// Sends one event toward the user named in the event.
    async fn emit(&self, event: SignalingEvent) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self);
}
