//! Resolves the workload identity behind a request.

use crate::PeerInfo;
use dubbo_authority_cert::{jwt, CertStorage};
use dubbo_authority_core::{AuthorizationType, Cluster, Endpoint};
use std::{fmt, sync::Arc};

#[derive(Clone)]
pub struct IdentityResolver {
    cluster: Arc<dyn Cluster>,
    storage: Arc<CertStorage>,
    trust_anyone: bool,
    enable_oidc_check: bool,
}

/// The identity material carried by a request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    pub peer: Option<PeerInfo>,
    pub token: Option<String>,
    pub authorization_type: AuthorizationType,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("peer address unknown")]
    NoPeer,

    #[error("no identity presented by {0}")]
    NoIdentity(std::net::SocketAddr),

    #[error("token is not signed by a trusted authority")]
    UntrustedToken,

    #[error("invalid token claims: {0}")]
    InvalidClaims(#[source] serde_json::Error),

    #[error("service account tokens are not accepted")]
    TokenCheckDisabled,

    #[error("service account token was rejected")]
    ServiceAccountRejected,

    #[error("failed to review service account token: {0}")]
    Cluster(#[source] anyhow::Error),
}

// === impl IdentityResolver ===

impl IdentityResolver {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        storage: Arc<CertStorage>,
        trust_anyone: bool,
        enable_oidc_check: bool,
    ) -> Self {
        Self {
            cluster,
            storage,
            trust_anyone,
            enable_oidc_check,
        }
    }

    /// Resolves the caller's endpoint.
    ///
    /// When every caller is trusted, the peer address alone identifies the
    /// caller. Otherwise a bearer token is tried first, then the SPIFFE ID of
    /// the TLS client certificate.
    pub async fn resolve(&self, creds: Credentials) -> Result<Endpoint, Error> {
        let peer = creds.peer.ok_or(Error::NoPeer)?;
        if self.trust_anyone {
            return Ok(Endpoint::from_peer(peer.remote_addr));
        }

        let token_error = match creds.token {
            Some(token) => match self.verify_token(&token, creds.authorization_type).await {
                Ok(endpoint) => return Ok(endpoint),
                Err(error) => {
                    tracing::debug!(peer = %peer.remote_addr, %error, "Token not accepted");
                    Some(error)
                }
            },
            None => None,
        };

        if let Some(id) = peer.spiffe_id {
            return Ok(Endpoint::from_peer(peer.remote_addr).with_spiffe_id(id));
        }

        Err(token_error.unwrap_or(Error::NoIdentity(peer.remote_addr)))
    }

    async fn verify_token(
        &self,
        token: &str,
        authorization_type: AuthorizationType,
    ) -> Result<Endpoint, Error> {
        if authorization_type == AuthorizationType::DubboJwt {
            let claims = jwt::verify(token, &self.storage.trusted_certs())
                .ok_or(Error::UntrustedToken)?;
            return claims.endpoint().map_err(Error::InvalidClaims);
        }

        if !self.enable_oidc_check {
            return Err(Error::TokenCheckDisabled);
        }
        self.cluster
            .verify_service_account(token, authorization_type)
            .await
            .map_err(Error::Cluster)?
            .ok_or(Error::ServiceAccountRejected)
    }
}

impl fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("trust_anyone", &self.trust_anyone)
            .field("enable_oidc_check", &self.enable_oidc_check)
            .finish_non_exhaustive()
    }
}

// === impl Credentials ===

impl Credentials {
    const AUTHORIZATION: &'static str = "authorization";

    pub fn from_request<T>(req: &tonic::Request<T>) -> Self {
        let peer = req
            .extensions()
            .get::<PeerInfo>()
            .cloned()
            .or_else(|| req.remote_addr().map(PeerInfo::plaintext));

        let meta = req.metadata();
        let token = meta
            .get(Self::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.trim().to_string());
        let authorization_type = meta
            .get(AuthorizationType::HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();

        Self {
            peer,
            token,
            authorization_type,
        }
    }
}
