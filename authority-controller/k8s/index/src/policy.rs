use dubbo_authority_core::{authentication, authorization, Extend};
use dubbo_authority_k8s_api::{
    policy::{self as k8s, AuthenticationPolicy, AuthorizationPolicy},
    ResourceExt,
};
use dubbo_authority_rule::{ConnectionRegistry, RuleHandler};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info_span;

pub type SharedIndex = Arc<RwLock<Index>>;

/// Feeds policy resources into the rule handlers, keyed by `{namespace}/{name}`.
#[derive(Debug)]
pub struct Index {
    /// Policies in this namespace apply mesh-wide.
    root_namespace: String,
    authentication: RuleHandler<authentication::Policy>,
    authorization: RuleHandler<authorization::Policy>,
}

// === impl Index ===

impl Index {
    pub fn shared(root_namespace: impl Into<String>, registry: ConnectionRegistry) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            root_namespace: root_namespace.into(),
            authentication: RuleHandler::new(registry.clone()),
            authorization: RuleHandler::new(registry),
        }))
    }

    pub fn authentication(&self) -> &RuleHandler<authentication::Policy> {
        &self.authentication
    }

    pub fn authorization(&self) -> &RuleHandler<authorization::Policy> {
        &self.authorization
    }
}

impl kubert::index::IndexNamespacedResource<AuthenticationPolicy> for Index {
    fn apply(&mut self, policy: AuthenticationPolicy) {
        let Some(ns) = policy.namespace() else {
            tracing::warn!(name = %policy.name_any(), "AuthenticationPolicy has no namespace");
            return;
        };
        let name = policy.name_any();
        let _span = info_span!("apply", %ns, %name).entered();

        let key = format!("{ns}/{name}");
        let policy = to_authentication(key.clone(), ns == self.root_namespace, &ns, policy.spec);
        self.authentication.update(key, policy);
    }

    fn delete(&mut self, ns: String, name: String) {
        let _span = info_span!("delete", %ns, %name).entered();
        tracing::debug!("Deleting AuthenticationPolicy");
        self.authentication.delete(&format!("{ns}/{name}"));
    }
}

impl kubert::index::IndexNamespacedResource<AuthorizationPolicy> for Index {
    fn apply(&mut self, policy: AuthorizationPolicy) {
        let Some(ns) = policy.namespace() else {
            tracing::warn!(name = %policy.name_any(), "AuthorizationPolicy has no namespace");
            return;
        };
        let name = policy.name_any();
        let _span = info_span!("apply", %ns, %name).entered();

        let key = format!("{ns}/{name}");
        let policy = to_authorization(key.clone(), policy.spec);
        self.authorization.update(key, policy);
    }

    fn delete(&mut self, ns: String, name: String) {
        let _span = info_span!("delete", %ns, %name).entered();
        tracing::debug!("Deleting AuthorizationPolicy");
        self.authorization.delete(&format!("{ns}/{name}"));
    }
}

/// Policies outside the root namespace only select workloads in their own
/// namespace.
fn to_authentication(
    key: String,
    is_root: bool,
    ns: &str,
    spec: k8s::AuthenticationPolicySpec,
) -> authentication::Policy {
    let mut rules = spec
        .rules
        .into_iter()
        .map(|k8s::authentication_policy::AuthenticationPolicyRule { from, to }| {
            authentication::PolicyRule {
                from: non_default(authentication::Source {
                    namespaces: from.namespaces,
                    not_namespaces: from.not_namespaces,
                    ip_blocks: from.ip_blocks,
                    not_ip_blocks: from.not_ip_blocks,
                    principals: from.principals,
                    not_principals: from.not_principals,
                    extends: to_extends(from.extends),
                    not_extends: to_extends(from.not_extends),
                }),
                to: non_default(authentication::Target {
                    ip_blocks: to.ip_blocks,
                    not_ip_blocks: to.not_ip_blocks,
                    principals: to.principals,
                    not_principals: to.not_principals,
                    extends: to_extends(to.extends),
                    not_extends: to_extends(to.not_extends),
                }),
            }
        })
        .collect::<Vec<_>>();

    if !is_root {
        if rules.is_empty() {
            rules.push(authentication::PolicyRule::default());
        }
        for rule in &mut rules {
            let from = rule.from.get_or_insert_with(Default::default);
            if !from.namespaces.iter().any(|n| n == ns) {
                from.namespaces.push(ns.to_string());
            }
        }
    }

    authentication::Policy {
        name: key,
        spec: Some(authentication::PolicySpec {
            action: spec.action,
            rules,
            order: spec.order,
            match_type: spec.match_type,
        }),
    }
}

fn to_authorization(key: String, spec: k8s::AuthorizationPolicySpec) -> authorization::Policy {
    let rules = spec
        .rules
        .into_iter()
        .map(|k8s::authorization_policy::AuthorizationPolicyRule { from, to, when }| {
            authorization::PolicyRule {
                from: non_default(authorization::Source {
                    namespaces: from.namespaces,
                    not_namespaces: from.not_namespaces,
                    ip_blocks: from.ip_blocks,
                    not_ip_blocks: from.not_ip_blocks,
                    principals: from.principals,
                    not_principals: from.not_principals,
                    extends: to_extends(from.extends),
                    not_extends: to_extends(from.not_extends),
                }),
                to: non_default(authorization::Target {
                    namespaces: to.namespaces,
                    not_namespaces: to.not_namespaces,
                    ip_blocks: to.ip_blocks,
                    not_ip_blocks: to.not_ip_blocks,
                    principals: to.principals,
                    not_principals: to.not_principals,
                    extends: to_extends(to.extends),
                    not_extends: to_extends(to.not_extends),
                }),
                when: non_default(authorization::Condition {
                    key: when.key,
                    values: to_matches(when.values),
                    not_values: to_matches(when.not_values),
                }),
            }
        })
        .collect();

    authorization::Policy {
        name: key,
        spec: Some(authorization::PolicySpec {
            action: spec.action,
            rules,
            samples: spec.samples,
            order: spec.order,
            match_type: spec.match_type,
        }),
    }
}

fn non_default<T: Default + PartialEq>(value: T) -> Option<T> {
    if value == T::default() {
        return None;
    }
    Some(value)
}

fn to_extends(extends: Vec<k8s::Extend>) -> Vec<Extend> {
    extends
        .into_iter()
        .map(|e| Extend {
            key: e.key,
            value: e.value,
        })
        .collect()
}

fn to_matches(matches: Vec<k8s::authorization_policy::Match>) -> Vec<authorization::Match> {
    matches
        .into_iter()
        .map(|m| authorization::Match {
            kind: m.kind,
            value: m.value,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dubbo_authority_core::{Endpoint, KubernetesEnv, RulePolicy};
    use dubbo_authority_k8s_api::ObjectMeta;
    use dubbo_authority_rule::Origin;
    use kubert::index::IndexNamespacedResource;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn index() -> SharedIndex {
        Index::shared("dubbo-system", ConnectionRegistry::new(Duration::from_secs(30)))
    }

    fn meta(ns: &str, name: &str) -> ObjectMeta {
        ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn authn(
        ns: &str,
        name: &str,
        rules: Vec<k8s::authentication_policy::AuthenticationPolicyRule>,
    ) -> AuthenticationPolicy {
        AuthenticationPolicy {
            metadata: meta(ns, name),
            spec: k8s::AuthenticationPolicySpec {
                action: "STRICT".to_string(),
                rules,
                order: 1,
                match_type: "anyMatch".to_string(),
            },
        }
    }

    fn endpoint(ns: &str) -> Endpoint {
        Endpoint {
            id: "pod".to_string(),
            kubernetes_env: Some(KubernetesEnv {
                namespace: ns.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn root_namespace_policies_are_not_scoped() {
        let index = index();
        index.write().apply(authn("dubbo-system", "mesh", vec![]));

        let index = index.read();
        let policy = index.authentication().get("dubbo-system/mesh").unwrap();
        assert_eq!(policy.name, "dubbo-system/mesh");
        let spec = policy.clone().spec.unwrap();
        assert!(spec.rules.is_empty());
        assert_eq!(spec.order, 1);
        assert_eq!(spec.match_type, "anyMatch");
        assert!(policy.to_client(&endpoint("other")).is_some());
        assert_eq!(index.authentication().revision(), 1);
    }

    #[test]
    fn namespaced_policies_select_their_namespace() {
        let index = index();
        index.write().apply(authn("default", "empty", vec![]));
        index.write().apply(authn(
            "default",
            "labelled",
            vec![
                k8s::authentication_policy::AuthenticationPolicyRule {
                    from: k8s::authentication_policy::Source {
                        not_extends: vec![k8s::Extend {
                            key: "kubernetesEnv.podLabels.app".to_string(),
                            value: "legacy".to_string(),
                        }],
                        ..Default::default()
                    },
                    ..Default::default()
                },
                k8s::authentication_policy::AuthenticationPolicyRule {
                    from: k8s::authentication_policy::Source {
                        namespaces: vec!["default".to_string()],
                        ..Default::default()
                    },
                    ..Default::default()
                },
            ],
        ));

        let index = index.read();
        let empty = index.authentication().get("default/empty").unwrap().spec.unwrap();
        assert_eq!(
            empty.rules,
            vec![authentication::PolicyRule {
                from: Some(authentication::Source {
                    namespaces: vec!["default".to_string()],
                    ..Default::default()
                }),
                to: None,
            }]
        );

        let labelled = index.authentication().get("default/labelled").unwrap().spec.unwrap();
        let first = labelled.rules[0].from.as_ref().unwrap();
        assert_eq!(first.namespaces, vec!["default".to_string()]);
        assert_eq!(first.not_extends[0].value, "legacy");
        let second = labelled.rules[1].from.as_ref().unwrap();
        assert_eq!(second.namespaces, vec!["default".to_string()]);
    }

    #[test]
    fn namespaced_rules_do_not_leak_to_other_namespaces() {
        let index = index();
        let policy: AuthenticationPolicy = serde_json::from_value(serde_json::json!({
            "apiVersion": "dubbo.apache.org/v1beta1",
            "kind": "AuthenticationPolicy",
            "metadata": { "name": "strict", "namespace": "default" },
            "spec": {
                "action": "STRICT",
                "order": 2,
                "matchType": "allMatch",
                "rules": [
                    { "from": { "notNamespaces": ["legacy"] } },
                    { "to": { "principals": ["cluster.local/ns/default/sa/api"] } },
                ],
            },
        }))
        .unwrap();
        index.write().apply(policy);

        let index = index.read();
        let policy = index.authentication().get("default/strict").unwrap();
        let spec = policy.spec.as_ref().unwrap();
        assert_eq!(spec.order, 2);
        assert_eq!(spec.match_type, "allMatch");
        assert_eq!(
            spec.rules[1].to.as_ref().unwrap().principals,
            vec!["cluster.local/ns/default/sa/api".to_string()]
        );
        for rule in &spec.rules {
            assert_eq!(
                rule.from.as_ref().unwrap().namespaces,
                vec!["default".to_string()]
            );
        }

        assert!(policy.to_client(&endpoint("default")).is_some());
        assert_eq!(policy.to_client(&endpoint("other")), None);
        let origin = index.authentication().snapshot();
        assert_eq!(origin.exact(&endpoint("other")).unwrap().data, "[]");
    }

    #[test]
    fn reapplying_unchanged_policy_keeps_revision() {
        let index = index();
        index.write().apply(authn("default", "p", vec![]));
        index.write().apply(authn("default", "p", vec![]));
        assert_eq!(index.read().authentication().revision(), 1);

        <Index as IndexNamespacedResource<AuthenticationPolicy>>::delete(
            &mut index.write(),
            "default".to_string(),
            "p".to_string(),
        );
        assert_eq!(index.read().authentication().get("default/p"), None);
        assert_eq!(index.read().authentication().revision(), 2);
    }

    #[test]
    fn authorization_rules_are_converted() {
        let index = index();
        let policy: AuthorizationPolicy = serde_json::from_value(serde_json::json!({
            "apiVersion": "dubbo.apache.org/v1beta1",
            "kind": "AuthorizationPolicy",
            "metadata": { "name": "deny-get", "namespace": "default" },
            "spec": {
                "action": "DENY",
                "samples": 50,
                "order": 1,
                "matchType": "allMatch",
                "rules": [{
                    "from": { "namespaces": ["web"], "extends": [{ "key": "id", "value": "a" }] },
                    "to": { "principals": ["cluster.local/ns/default/sa/api"] },
                    "when": {
                        "key": "method",
                        "values": [{ "type": "equals", "value": "GET" }],
                        "notValues": [{ "type": "equals", "value": "HEAD" }],
                    },
                }],
            },
        }))
        .unwrap();
        index.write().apply(policy);

        let index = index.read();
        let spec = index
            .authorization()
            .get("default/deny-get")
            .unwrap()
            .spec
            .unwrap();
        assert_eq!(spec.action, "DENY");
        assert_eq!(spec.samples, 50.0);
        assert_eq!(spec.order, 1.0);
        assert_eq!(spec.match_type, "allMatch");

        let rule = &spec.rules[0];
        let from = rule.from.as_ref().unwrap();
        assert_eq!(from.namespaces, vec!["web".to_string()]);
        assert_eq!(from.extends[0].key, "id");
        assert_eq!(
            rule.to.as_ref().unwrap().principals,
            vec!["cluster.local/ns/default/sa/api".to_string()]
        );
        let when = rule.when.as_ref().unwrap();
        assert_eq!(when.values[0].value, "GET");
        assert_eq!(when.not_values[0].value, "HEAD");
    }
}
