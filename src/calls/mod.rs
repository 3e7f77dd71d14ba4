//! Peer-to-peer audio/video calls.
//!
//! Two independent intents ("start call", "answer call") are turned into a
//! negotiated media session, coordinated through the signaling relay and the
//! call record service.
//!
//! # Architecture
//!
//! - [`media`]: local capture; acquires and releases device streams
//! - [`peer`]: one negotiated peer connection per call (SDP + ICE trickle)
//! - [`records`]: client for the call record service (REST)
//! - [`CallPhase`] & [`CallTransition`]: the lifecycle state machine
//! - [`CallEngine`]: orchestrates all of the above and exposes the call to the UI
//!
//! # Lifecycle
//!
//! `Idle -> Outgoing | Incoming -> Negotiating -> Active -> Ended`, with any
//! non-terminal phase able to end directly. The engine resets to `Idle` as
//! soon as teardown has released every resource of the ended call.

mod engine;
mod error;
pub mod media;
pub mod peer;
pub mod records;
mod state;

pub use engine::{CallEngine, CallEvent, EngineConfig, EngineSnapshot};
pub use error::CallError;
pub use records::{CallRecordService, OfferRequest, RestCallRecordService};
pub use state::{CallDirection, CallPhase, CallTransition, EndReason, InvalidTransition};
