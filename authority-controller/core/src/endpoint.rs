use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The resolved identity of a connected workload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub ips: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spiffe_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_env: Option<KubernetesEnv>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesEnv {
    #[serde(default)]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deployment_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stateful_set_name: String,

    #[serde(default)]
    pub pod_name: String,

    #[serde(default)]
    pub pod_labels: BTreeMap<String, String>,

    #[serde(default)]
    pub pod_annotations: BTreeMap<String, String>,
}

// === impl Endpoint ===

impl Endpoint {
    /// An endpoint known only by its transport peer address.
    pub fn from_peer(addr: std::net::SocketAddr) -> Self {
        Self {
            id: addr.to_string(),
            ips: vec![addr.ip().to_string()],
            ..Default::default()
        }
    }

    pub fn with_spiffe_id(mut self, spiffe_id: impl Into<String>) -> Self {
        self.spiffe_id = Some(spiffe_id.into());
        self
    }

    pub fn namespace(&self) -> Option<&str> {
        self.kubernetes_env.as_ref().map(|env| env.namespace.as_str())
    }

    /// Returns true if `principal` names this endpoint's SPIFFE ID, with or
    /// without the `spiffe://` scheme.
    pub fn has_principal(&self, principal: &str) -> bool {
        match self.spiffe_id.as_deref() {
            Some(id) => id == principal || id.strip_prefix("spiffe://") == Some(principal),
            None => false,
        }
    }
}
