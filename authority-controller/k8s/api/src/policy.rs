pub mod authentication_policy;
pub mod authorization_policy;

pub use self::{
    authentication_policy::{AuthenticationPolicy, AuthenticationPolicySpec},
    authorization_policy::{AuthorizationPolicy, AuthorizationPolicySpec},
};

/// Matches an attribute of a workload's identity by key path.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
pub struct Extend {
    #[serde(default)]
    pub key: String,

    #[serde(default)]
    pub value: String,
}
