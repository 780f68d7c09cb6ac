#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod authentication;
pub mod authorization;
mod cluster;
mod endpoint;
mod policy;
mod rule_type;
mod selector;

pub use self::{
    cluster::{AuthoritySecret, AuthorizationType, Cluster, WebhookConfig},
    endpoint::{Endpoint, KubernetesEnv},
    policy::{InvalidPolicy, RulePolicy},
    rule_type::{RuleType, UnknownRuleType},
    selector::Extend,
};
pub use ipnet::IpNet;

/// The trust domain used when none is configured.
pub const DEFAULT_TRUST_DOMAIN: &str = "cluster.local";

/// Builds the SPIFFE ID for a Kubernetes service account.
pub fn service_account_spiffe_id(trust_domain: &str, namespace: &str, sa: &str) -> String {
    format!("spiffe://{trust_domain}/ns/{namespace}/sa/{sa}")
}
