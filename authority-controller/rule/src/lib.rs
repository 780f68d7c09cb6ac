#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Versioned rule storage and the observe protocol that streams rules to
//! connected workloads.
//!
//! A [`RuleHandler`] holds the policies of one rule type. Every effective
//! change produces a new immutable [`Origin`] that is published to the
//! [`ConnectionRegistry`], which fans it out to each live [`Connection`].
//! Each connection renders the origin for its own endpoint and pushes it,
//! keeping at most one unacknowledged push per rule type.

mod connection;
mod handler;
pub mod metrics;
mod origin;
mod registry;

pub use self::{
    connection::Connection,
    handler::RuleHandler,
    metrics::RegistryMetrics,
    origin::{Origin, PolicyOrigin, ToClient},
    registry::ConnectionRegistry,
};
pub use dubbo_authority_core::RuleType;

/// A message received from a client on an observe stream. An empty nonce
/// subscribes to the rule type; otherwise it acknowledges the push that
/// carried the nonce.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObserveRequest {
    pub nonce: String,
    pub rule_type: String,
}

/// A push sent to a client on an observe stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObserveResponse {
    pub nonce: String,
    pub rule_type: RuleType,
    pub revision: i64,

    /// The JSON array of policies that apply to the client.
    pub data: String,
}
