//! Authorization policies are evaluated by clients against live traffic, so
//! every stored policy is sent to every subscriber.

use crate::{policy::is_zero, Endpoint, Extend, InvalidPolicy, RulePolicy, RuleType};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default)]
    pub spec: Option<PolicySpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<PolicyRule>,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub samples: f32,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub order: f32,

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

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,
}

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

    #[serde(default, rename = "sourceExtends", skip_serializing_if = "Vec::is_empty")]
    pub extends: Vec<Extend>,

    #[serde(default, rename = "sourceNotExtends", skip_serializing_if = "Vec::is_empty")]
    pub not_extends: Vec<Extend>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
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

    #[serde(default, rename = "targetExtends", skip_serializing_if = "Vec::is_empty")]
    pub extends: Vec<Extend>,

    #[serde(default, rename = "targetNotExtends", skip_serializing_if = "Vec::is_empty")]
    pub not_extends: Vec<Extend>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Match>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not_values: Vec<Match>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
}

// === impl Policy ===

impl RulePolicy for Policy {
    const RULE_TYPE: RuleType = RuleType::Authorization;

    fn validate(&self) -> Result<(), InvalidPolicy> {
        match self.spec {
            Some(_) => Ok(()),
            None => Err(InvalidPolicy::MissingSpec(self.name.clone())),
        }
    }

    /// Authorization policies are not filtered by endpoint. The target half
    /// of each rule describes this control plane's view and is not sent.
    fn to_client(&self, _: &Endpoint) -> Option<Self> {
        let spec = self.spec.as_ref()?;
        let rules = spec
            .rules
            .iter()
            .map(|r| PolicyRule {
                from: r.from.clone(),
                to: None,
                when: r.when.clone(),
            })
            .collect();
        Some(Self {
            name: self.name.clone(),
            spec: Some(PolicySpec {
                rules,
                ..spec.clone()
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn minimal_policy_renders_action_only() {
        let policy = Policy {
            name: "p1".to_string(),
            spec: Some(PolicySpec {
                action: "ALLOW".to_string(),
                ..Default::default()
            }),
        };
        let client = policy.to_client(&Endpoint::default()).unwrap();
        assert_eq!(
            serde_json::to_string(&client).unwrap(),
            r#"{"name":"p1","spec":{"action":"ALLOW"}}"#
        );
    }

    #[test]
    fn target_is_not_sent() {
        let policy: Policy = serde_json::from_value(serde_json::json!({
            "name": "p2",
            "spec": {
                "action": "DENY",
                "samples": 0.5,
                "matchType": "anyMatch",
                "rules": [{
                    "from": { "namespaces": ["default"], "sourceExtends": [{ "key": "id", "value": "a" }] },
                    "to": { "namespaces": ["backend"], "targetExtends": [{ "key": "id", "value": "b" }] },
                    "when": { "key": "method", "values": [{ "type": "equals", "value": "GET" }] },
                }],
            },
        }))
        .unwrap();
        let spec = policy.spec.as_ref().unwrap();
        assert_eq!(spec.rules[0].to.as_ref().unwrap().extends[0].value, "b");

        let client = policy.to_client(&Endpoint::default()).unwrap();
        assert_eq!(
            serde_json::to_value(&client).unwrap(),
            serde_json::json!({
                "name": "p2",
                "spec": {
                    "action": "DENY",
                    "samples": 0.5,
                    "matchType": "anyMatch",
                    "rules": [{
                        "from": { "namespaces": ["default"], "sourceExtends": [{ "key": "id", "value": "a" }] },
                        "when": { "key": "method", "values": [{ "type": "equals", "value": "GET" }] },
                    }],
                },
            })
        );
    }
}
