use crate::Endpoint;
use anyhow::Result;
use std::str::FromStr;

/// The authority certificate and key as persisted in the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthoritySecret {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Describes the admission webhook that is backed by this authority.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookConfig {
    pub namespace: String,
    pub service_name: String,
    pub port: u16,
    /// Admit pods when the webhook cannot be reached.
    pub allow_on_err: bool,
}

/// How a bearer token presented by a workload should be verified.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum AuthorizationType {
    /// A service account token reviewed by the cluster.
    #[default]
    Kubernetes,
    /// A projected service account token bound to the `dubbo-ca` audience.
    DubboCaToken,
    /// A token previously issued by this authority.
    DubboJwt,
}

/// The cluster operations consumed by the authority.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync + 'static {
    async fn get_authority_cert(&self, namespace: &str) -> Result<Option<AuthoritySecret>>;

    async fn update_authority_cert(&self, secret: &AuthoritySecret, namespace: &str) -> Result<()>;

    /// Mirrors the authority certificate into every namespace's trust
    /// config map.
    async fn update_authority_public_key(&self, cert_pem: &str) -> Result<()>;

    async fn update_webhook_config(&self, webhook: &WebhookConfig, ca_pem: &str) -> Result<()>;

    /// Reviews a service account token, returning the pod it was issued to.
    async fn verify_service_account(
        &self,
        token: &str,
        authorization_type: AuthorizationType,
    ) -> Result<Option<Endpoint>>;
}

// === impl AuthorizationType ===

impl AuthorizationType {
    pub const HEADER: &'static str = "authorization-type";

    /// The token audience required by this type, if any.
    pub fn audience(&self) -> Option<&'static str> {
        match self {
            Self::DubboCaToken => Some("dubbo-ca"),
            _ => None,
        }
    }
}

impl FromStr for AuthorizationType {
    type Err = std::convert::Infallible;

    /// Unrecognized values are treated as Kubernetes tokens.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "dubbo-ca-token" => Self::DubboCaToken,
            "dubbo-jwt" => Self::DubboJwt,
            _ => Self::Kubernetes,
        })
    }
}
