pub mod call;
pub mod negotiation;
