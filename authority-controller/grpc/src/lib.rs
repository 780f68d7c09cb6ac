#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! gRPC services exposed to mesh workloads: certificate issuance and rule
//! observation.

pub mod authority;
pub mod identity;
pub mod metrics;
pub mod observe;
pub mod peer;

/// Protobuf bindings for `proto/authority.proto`, checked in under `src/gen`.
#[allow(clippy::derive_partial_eq_without_eq)]
pub mod api {
    include!("gen/org.apache.dubbo.auth.v1alpha1.rs");
}

pub use self::{
    authority::AuthorityServer,
    identity::{Credentials, IdentityResolver},
    observe::RuleServer,
    peer::{PeerInfo, PeerIo},
};
