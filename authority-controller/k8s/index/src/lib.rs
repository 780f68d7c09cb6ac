#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Kubernetes glue for the authority: policy resources are indexed into the
//! rule handlers, and [`KubeCluster`] backs the core [`Cluster`] trait with
//! API calls.
//!
//! [`Cluster`]: dubbo_authority_core::Cluster

mod cluster;
mod policy;

pub use self::{
    cluster::KubeCluster,
    policy::{Index, SharedIndex},
};
