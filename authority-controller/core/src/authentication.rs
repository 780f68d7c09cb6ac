//! Authentication policies select the workloads that must present a mesh
//! identity and describe the action applied to them.

use crate::{
    policy::is_zero, selector::Criteria, Endpoint, Extend, InvalidPolicy, RulePolicy, RuleType,
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default)]
    pub spec: Option<PolicySpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    #[serde(default)]
    pub action: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<PolicyRule>,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub order: i32,

    /// `anyMatch` or `allMatch`; interpreted by clients.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub match_type: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Source>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Target>,
}

/// Selects the workloads a policy is sent to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not_namespaces: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_blocks: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not_ip_blocks: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub principals: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not_principals: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extends: Vec<Extend>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not_extends: Vec<Extend>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_blocks: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not_ip_blocks: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub principals: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not_principals: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extends: Vec<Extend>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not_extends: Vec<Extend>,
}

// === impl Policy ===

impl RulePolicy for Policy {
    const RULE_TYPE: RuleType = RuleType::Authentication;

    fn validate(&self) -> Result<(), InvalidPolicy> {
        match self.spec {
            Some(_) => Ok(()),
            None => Err(InvalidPolicy::MissingSpec(self.name.clone())),
        }
    }

    /// A policy applies when it has no rules or when any rule's source
    /// selects the endpoint. Applicable policies are sent whole; clients
    /// combine the rules according to `matchType`.
    fn to_client(&self, endpoint: &Endpoint) -> Option<Self> {
        let spec = self.spec.as_ref()?;
        if !spec.rules.is_empty() && !spec.rules.iter().any(|r| r.selects(endpoint)) {
            return None;
        }
        Some(self.clone())
    }
}

// === impl PolicyRule ===

impl PolicyRule {
    fn selects(&self, endpoint: &Endpoint) -> bool {
        self.from.as_ref().map_or(true, |from| from.matches(endpoint))
    }
}

// === impl Source ===

impl Source {
    pub fn matches(&self, endpoint: &Endpoint) -> bool {
        Criteria {
            namespaces: &self.namespaces,
            not_namespaces: &self.not_namespaces,
            ip_blocks: &self.ip_blocks,
            not_ip_blocks: &self.not_ip_blocks,
            principals: &self.principals,
            not_principals: &self.not_principals,
            extends: &self.extends,
            not_extends: &self.not_extends,
        }
        .matches(endpoint)
    }
}
