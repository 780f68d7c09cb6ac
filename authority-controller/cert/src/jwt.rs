//! Identity tokens issued alongside workload certificates.
//!
//! A token carries the serialized endpoint so that its bearer can later be
//! identified without presenting a new CSR.

use crate::{Cert, Error};
use dubbo_authority_core::Endpoint;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

pub const ISSUER: &str = "dubbo-authority";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,

    /// The endpoint's SPIFFE ID.
    pub sub: String,

    /// Expiry as seconds since the epoch.
    pub exp: u64,

    /// The endpoint ID.
    pub cn: String,

    /// The JSON-serialized endpoint.
    pub ext: String,
}

// === impl Claims ===

impl Claims {
    pub fn new(endpoint: &Endpoint, validity: Duration) -> Result<Self, serde_json::Error> {
        let exp = (SystemTime::now() + validity)
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Ok(Self {
            iss: ISSUER.to_string(),
            sub: endpoint.spiffe_id.clone().unwrap_or_default(),
            exp,
            cn: endpoint.id.clone(),
            ext: serde_json::to_string(endpoint)?,
        })
    }

    /// Recovers the endpoint described by these claims.
    pub fn endpoint(&self) -> Result<Endpoint, serde_json::Error> {
        let mut endpoint: Endpoint = serde_json::from_str(&self.ext)?;
        if endpoint.spiffe_id.is_none() && !self.sub.is_empty() {
            endpoint.spiffe_id = Some(self.sub.clone());
        }
        Ok(endpoint)
    }
}

/// Signs an ES256 token for `endpoint` with the authority's key.
pub fn issue(endpoint: &Endpoint, authority: &Cert, validity: Duration) -> Result<String, Error> {
    let claims = Claims::new(endpoint, validity).map_err(|e| Error::Parse(e.to_string()))?;
    let key = EncodingKey::from_ec_pem(authority.key_pem().as_bytes())?;
    let token = jsonwebtoken::encode(&Header::new(Algorithm::ES256), &claims, &key)?;
    Ok(token)
}

/// Verifies a token against each trusted certificate's public key,
/// returning the claims of the first that validates.
pub fn verify(token: &str, trusted: &[Arc<Cert>]) -> Option<Claims> {
    let mut validation = Validation::new(Algorithm::ES256);
    validation.set_issuer(&[ISSUER]);

    trusted.iter().find_map(|cert| {
        let key = DecodingKey::from_ec_pem(cert.public_key_pem().as_bytes())
            .map_err(|error| tracing::debug!(%error, "Unusable trusted key"))
            .ok()?;
        match jsonwebtoken::decode::<Claims>(token, &key, &validation) {
            Ok(data) => Some(data.claims),
            Err(error) => {
                tracing::trace!(%error, "Token not signed by trusted key");
                None
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate_authority_cert;
    use dubbo_authority_core::KubernetesEnv;

    const HOUR: Duration = Duration::from_secs(60 * 60);

    fn endpoint() -> Endpoint {
        Endpoint {
            id: "web-0".to_string(),
            ips: vec!["10.0.0.1".to_string()],
            spiffe_id: Some("spiffe://cluster.local/ns/default/sa/web".to_string()),
            kubernetes_env: Some(KubernetesEnv {
                namespace: "default".to_string(),
                pod_name: "web-0".to_string(),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn issued_tokens_verify() {
        let authority = Arc::new(generate_authority_cert(None, HOUR).unwrap());
        let token = issue(&endpoint(), &authority, HOUR).unwrap();

        let claims = verify(&token, &[authority]).expect("token must verify");
        assert_eq!(claims.iss, ISSUER);
        assert_eq!(claims.cn, "web-0");
        assert_eq!(claims.sub, "spiffe://cluster.local/ns/default/sa/web");
        assert_eq!(claims.endpoint().unwrap(), endpoint());
    }

    #[test]
    fn tries_every_trusted_cert() {
        let old = Arc::new(generate_authority_cert(None, HOUR).unwrap());
        let new = Arc::new(generate_authority_cert(None, HOUR).unwrap());
        let token = issue(&endpoint(), &old, HOUR).unwrap();
        assert!(verify(&token, &[new.clone()]).is_none());
        assert!(verify(&token, &[new, old]).is_some());
    }

    #[test]
    fn rejects_garbage() {
        let authority = Arc::new(generate_authority_cert(None, HOUR).unwrap());
        assert!(verify("not.a.token", &[authority]).is_none());
    }
}
