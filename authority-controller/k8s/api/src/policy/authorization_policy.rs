use super::Extend;

#[derive(
    Clone,
    Debug,
    Default,
    kube::CustomResource,
    serde::Deserialize,
    serde::Serialize,
    schemars::JsonSchema,
)]
#[kube(
    group = "dubbo.apache.org",
    version = "v1beta1",
    kind = "AuthorizationPolicy",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationPolicySpec {
    /// One of `ALLOW`, `DENY` or `ADUIT`.
    pub action: String,

    #[serde(default)]
    pub rules: Vec<AuthorizationPolicyRule>,

    /// Percentage of requests the policy applies to.
    #[serde(default)]
    pub samples: f32,

    #[serde(default)]
    pub order: f32,

    /// `anyMatch` or `allMatch`.
    #[serde(default)]
    pub match_type: String,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
pub struct AuthorizationPolicyRule {
    #[serde(default)]
    pub from: Source,

    #[serde(default)]
    pub to: Target,

    #[serde(default)]
    pub when: Condition,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub not_namespaces: Vec<String>,
    #[serde(default)]
    pub ip_blocks: Vec<String>,
    #[serde(default)]
    pub not_ip_blocks: Vec<String>,
    #[serde(default)]
    pub principals: Vec<String>,
    #[serde(default)]
    pub not_principals: Vec<String>,
    #[serde(default)]
    pub extends: Vec<Extend>,
    #[serde(default)]
    pub not_extends: Vec<Extend>,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub not_namespaces: Vec<String>,
    #[serde(default)]
    pub ip_blocks: Vec<String>,
    #[serde(default)]
    pub not_ip_blocks: Vec<String>,
    #[serde(default)]
    pub principals: Vec<String>,
    #[serde(default)]
    pub not_principals: Vec<String>,
    #[serde(default)]
    pub extends: Vec<Extend>,
    #[serde(default)]
    pub not_extends: Vec<Extend>,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub values: Vec<Match>,
    #[serde(default)]
    pub not_values: Vec<Match>,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
pub struct Match {
    #[serde(default, rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn resource_identity() {
        assert_eq!(
            AuthorizationPolicy::crd_name(),
            "authorizationpolicies.dubbo.apache.org"
        );
    }

    #[test]
    fn parses_rules() {
        let policy: AuthorizationPolicy = serde_json::from_value(serde_json::json!({
            "apiVersion": "dubbo.apache.org/v1beta1",
            "kind": "AuthorizationPolicy",
            "metadata": { "name": "deny-get", "namespace": "default" },
            "spec": {
                "action": "DENY",
                "samples": 100,
                "matchType": "anyMatch",
                "rules": [{
                    "from": { "principals": ["cluster.local/ns/default/sa/web"] },
                    "when": {
                        "key": "method",
                        "values": [{ "type": "equals", "value": "GET" }],
                        "notValues": [{ "type": "equals", "value": "HEAD" }],
                    },
                }],
            },
        }))
        .unwrap();
        let rule = &policy.spec.rules[0];
        assert_eq!(rule.from.principals, vec!["cluster.local/ns/default/sa/web"]);
        assert_eq!(rule.to, Target::default());
        assert_eq!(rule.when.values[0].kind, "equals");
        assert_eq!(rule.when.not_values[0].value, "HEAD");
        assert_eq!(policy.spec.samples, 100.0);
    }
}
