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
    kind = "AuthenticationPolicy",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationPolicySpec {
    /// One of `NONE`, `DISABLED`, `PERMISSIVE` or `STRICT`.
    pub action: String,

    #[serde(default)]
    pub rules: Vec<AuthenticationPolicyRule>,

    /// Policies with a higher order take precedence.
    #[serde(default)]
    pub order: i32,

    /// `anyMatch` or `allMatch`.
    #[serde(default)]
    pub match_type: String,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
pub struct AuthenticationPolicyRule {
    #[serde(default)]
    pub from: Source,

    #[serde(default)]
    pub to: Target,
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

#[cfg(test)]
mod tests {
    use super::*;
    use kube::{CustomResourceExt, Resource};

    #[test]
    fn resource_identity() {
        assert_eq!(AuthenticationPolicy::group(&()), "dubbo.apache.org");
        assert_eq!(AuthenticationPolicy::version(&()), "v1beta1");
        assert_eq!(
            AuthenticationPolicy::crd_name(),
            "authenticationpolicies.dubbo.apache.org"
        );
    }

    #[test]
    fn parses_rules() {
        let policy: AuthenticationPolicy = serde_json::from_value(serde_json::json!({
            "apiVersion": "dubbo.apache.org/v1beta1",
            "kind": "AuthenticationPolicy",
            "metadata": { "name": "strict", "namespace": "default" },
            "spec": {
                "action": "STRICT",
                "order": 3,
                "matchType": "allMatch",
                "rules": [
                    { "from": { "namespaces": ["default"], "notExtends": [{ "key": "app", "value": "legacy" }] } },
                    { "to": { "notIpBlocks": ["10.0.0.0/8"] } },
                ],
            },
        }))
        .unwrap();
        assert_eq!(policy.spec.order, 3);
        assert_eq!(policy.spec.match_type, "allMatch");
        assert_eq!(policy.spec.rules[0].from.namespaces, vec!["default"]);
        assert_eq!(policy.spec.rules[0].from.not_extends[0].value, "legacy");
        assert_eq!(policy.spec.rules[0].to, Target::default());
        assert_eq!(policy.spec.rules[1].from, Source::default());
        assert_eq!(policy.spec.rules[1].to.not_ip_blocks, vec!["10.0.0.0/8"]);
    }

    #[test]
    fn rules_are_optional() {
        let policy: AuthenticationPolicy = serde_json::from_value(serde_json::json!({
            "apiVersion": "dubbo.apache.org/v1beta1",
            "kind": "AuthenticationPolicy",
            "metadata": { "name": "permissive", "namespace": "default" },
            "spec": { "action": "PERMISSIVE" },
        }))
        .unwrap();
        assert!(policy.spec.rules.is_empty());
        assert_eq!(policy.spec.order, 0);
        assert_eq!(policy.spec.match_type, "");
    }
}
