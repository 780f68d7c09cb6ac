use crate::{Endpoint, IpNet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;

/// Matches an attribute of the serialized endpoint.
///
/// `key` is a dot-separated path into the endpoint's JSON form, e.g.
/// `kubernetesEnv.podLabels.app`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extend {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
}

/// The positive and negative lists shared by every selector kind.
///
/// An empty positive list matches everything; a negative list only ever
/// excludes.
pub(crate) struct Criteria<'a> {
    pub namespaces: &'a [String],
    pub not_namespaces: &'a [String],
    pub ip_blocks: &'a [String],
    pub not_ip_blocks: &'a [String],
    pub principals: &'a [String],
    pub not_principals: &'a [String],
    pub extends: &'a [Extend],
    pub not_extends: &'a [Extend],
}

// === impl Criteria ===

impl Criteria<'_> {
    pub(crate) fn matches(&self, endpoint: &Endpoint) -> bool {
        let ns = endpoint.namespace();
        if !self.namespaces.is_empty() && !self.namespaces.iter().any(|n| Some(n.as_str()) == ns) {
            return false;
        }
        if self.not_namespaces.iter().any(|n| Some(n.as_str()) == ns) {
            return false;
        }

        let ips = endpoint_ips(endpoint);
        if !self.ip_blocks.is_empty() && !any_block_contains(self.ip_blocks, &ips) {
            return false;
        }
        if any_block_contains(self.not_ip_blocks, &ips) {
            return false;
        }

        if !self.principals.is_empty() && !self.principals.iter().any(|p| endpoint.has_principal(p))
        {
            return false;
        }
        if self.not_principals.iter().any(|p| endpoint.has_principal(p)) {
            return false;
        }

        if self.extends.is_empty() && self.not_extends.is_empty() {
            return true;
        }
        let json = match serde_json::to_value(endpoint) {
            Ok(json) => json,
            Err(error) => {
                tracing::warn!(%error, "Failed to serialize endpoint");
                return false;
            }
        };
        if !self.extends.is_empty() && !self.extends.iter().any(|e| e.matches(&json)) {
            return false;
        }
        !self.not_extends.iter().any(|e| e.matches(&json))
    }
}

// === impl Extend ===

impl Extend {
    fn matches(&self, endpoint: &Value) -> bool {
        lookup(endpoint, &self.key) == self.value
    }
}

/// Resolves a dotted path against a JSON value, rendering the result as a
/// string. Missing values and nulls render as the empty string.
pub(crate) fn lookup(json: &Value, key: &str) -> String {
    let pointer = key
        .split('.')
        .map(|seg| seg.replace('~', "~0").replace('/', "~1"))
        .fold(String::new(), |mut acc, seg| {
            acc.push('/');
            acc.push_str(&seg);
            acc
        });
    match json.pointer(&pointer) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(v) => v.to_string(),
    }
}

fn endpoint_ips(endpoint: &Endpoint) -> Vec<IpAddr> {
    endpoint
        .ips
        .iter()
        .filter_map(|ip| match ip.parse() {
            Ok(ip) => Some(ip),
            Err(error) => {
                tracing::warn!(%ip, %error, "Invalid endpoint IP");
                None
            }
        })
        .collect()
}

fn any_block_contains(blocks: &[String], ips: &[IpAddr]) -> bool {
    blocks.iter().any(|block| match block.parse::<IpNet>() {
        Ok(net) => ips.iter().any(|ip| net.contains(ip)),
        Err(error) => {
            tracing::warn!(%block, %error, "Invalid IP block");
            false
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KubernetesEnv;
    use maplit::btreemap;

    fn endpoint() -> Endpoint {
        Endpoint {
            id: "web-0".to_string(),
            ips: vec!["10.1.2.3".to_string()],
            spiffe_id: Some("spiffe://cluster.local/ns/default/sa/web".to_string()),
            kubernetes_env: Some(KubernetesEnv {
                namespace: "default".to_string(),
                pod_name: "web-0".to_string(),
                pod_labels: btreemap! { "app".to_string() => "web".to_string() },
                ..Default::default()
            }),
        }
    }

    fn criteria<'a>(
        lists: &'a [&'a [String]; 6],
        extends: &'a [Extend],
        not_extends: &'a [Extend],
    ) -> Criteria<'a> {
        Criteria {
            namespaces: lists[0],
            not_namespaces: lists[1],
            ip_blocks: lists[2],
            not_ip_blocks: lists[3],
            principals: lists[4],
            not_principals: lists[5],
            extends,
            not_extends,
        }
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_criteria_match_everything() {
        let lists: [&[String]; 6] = [&[], &[], &[], &[], &[], &[]];
        assert!(criteria(&lists, &[], &[]).matches(&endpoint()));
        assert!(criteria(&lists, &[], &[]).matches(&Endpoint::default()));
    }

    #[test]
    fn namespaces() {
        let default = strings(&["default"]);
        let other = strings(&["other"]);
        let lists: [&[String]; 6] = [&default, &[], &[], &[], &[], &[]];
        assert!(criteria(&lists, &[], &[]).matches(&endpoint()));
        let lists: [&[String]; 6] = [&other, &[], &[], &[], &[], &[]];
        assert!(!criteria(&lists, &[], &[]).matches(&endpoint()));
        let lists: [&[String]; 6] = [&[], &default, &[], &[], &[], &[]];
        assert!(!criteria(&lists, &[], &[]).matches(&endpoint()));
        // Endpoints without a Kubernetes environment never match a namespace.
        let lists: [&[String]; 6] = [&default, &[], &[], &[], &[], &[]];
        assert!(!criteria(&lists, &[], &[]).matches(&Endpoint::default()));
    }

    #[test]
    fn ip_blocks() {
        let inside = strings(&["10.1.0.0/16"]);
        let outside = strings(&["192.168.0.0/16", "not-a-cidr"]);
        let lists: [&[String]; 6] = [&[], &[], &inside, &[], &[], &[]];
        assert!(criteria(&lists, &[], &[]).matches(&endpoint()));
        let lists: [&[String]; 6] = [&[], &[], &outside, &[], &[], &[]];
        assert!(!criteria(&lists, &[], &[]).matches(&endpoint()));
        let lists: [&[String]; 6] = [&[], &[], &[], &inside, &[], &[]];
        assert!(!criteria(&lists, &[], &[]).matches(&endpoint()));
        let lists: [&[String]; 6] = [&[], &[], &[], &outside, &[], &[]];
        assert!(criteria(&lists, &[], &[]).matches(&endpoint()));
    }

    #[test]
    fn principals() {
        let bare = strings(&["cluster.local/ns/default/sa/web"]);
        let other = strings(&["spiffe://cluster.local/ns/default/sa/api"]);
        let lists: [&[String]; 6] = [&[], &[], &[], &[], &bare, &[]];
        assert!(criteria(&lists, &[], &[]).matches(&endpoint()));
        let lists: [&[String]; 6] = [&[], &[], &[], &[], &other, &[]];
        assert!(!criteria(&lists, &[], &[]).matches(&endpoint()));
        let lists: [&[String]; 6] = [&[], &[], &[], &[], &[], &bare];
        assert!(!criteria(&lists, &[], &[]).matches(&endpoint()));
    }

    #[test]
    fn extends() {
        let lists: [&[String]; 6] = [&[], &[], &[], &[], &[], &[]];
        let app = [Extend {
            key: "kubernetesEnv.podLabels.app".to_string(),
            value: "web".to_string(),
        }];
        let missing = [Extend {
            key: "kubernetesEnv.podLabels.tier".to_string(),
            value: "db".to_string(),
        }];
        assert!(criteria(&lists, &app, &[]).matches(&endpoint()));
        assert!(!criteria(&lists, &missing, &[]).matches(&endpoint()));
        assert!(!criteria(&lists, &[], &app).matches(&endpoint()));
        assert!(criteria(&lists, &[], &missing).matches(&endpoint()));
    }

    #[test]
    fn negated_lists_only_exclude_listed_values() {
        let other_ns = strings(&["other"]);
        let other_block = strings(&["192.168.0.0/16"]);
        let other_sa = strings(&["cluster.local/ns/default/sa/api"]);
        let lists: [&[String]; 6] = [&[], &other_ns, &[], &other_block, &[], &other_sa];
        assert!(criteria(&lists, &[], &[]).matches(&endpoint()));
        assert!(criteria(&lists, &[], &[]).matches(&Endpoint::default()));

        let default_ns = strings(&["default"]);
        let lists: [&[String]; 6] = [&[], &default_ns, &[], &other_block, &[], &[]];
        assert!(!criteria(&lists, &[], &[]).matches(&endpoint()));
    }

    #[test]
    fn lookup_renders_scalars() {
        let json = serde_json::json!({
            "id": "a",
            "ips": ["10.0.0.1"],
            "n": 3,
            "nested": { "flag": true, "null": null },
        });
        assert_eq!(lookup(&json, "id"), "a");
        assert_eq!(lookup(&json, "ips.0"), "10.0.0.1");
        assert_eq!(lookup(&json, "n"), "3");
        assert_eq!(lookup(&json, "nested.flag"), "true");
        assert_eq!(lookup(&json, "nested.null"), "");
        assert_eq!(lookup(&json, "nested.missing"), "");
    }
}
