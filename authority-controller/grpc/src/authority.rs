use crate::{
    api::{
        authority_service_server::{AuthorityService, AuthorityServiceServer},
        dubbo_certificate_service_server::{
            DubboCertificateService, DubboCertificateServiceServer,
        },
        DubboCertificateRequest, DubboCertificateResponse, IdentityRequest, IdentityResponse,
    },
    identity::{Credentials, IdentityResolver},
    metrics::{AuthorityMetrics, Failure},
};
use dubbo_authority_cert::{jwt, sign_from_csr, Cert, CertStorage, Csr};
use dubbo_authority_core::Endpoint;
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

const CREATE_IDENTITY: &str = "CreateIdentity";
const CREATE_CERTIFICATE: &str = "CreateCertificate";

/// Signs workload certificates for resolved endpoints.
///
/// Domain failures are reported in the response's `success` and `message`
/// fields rather than as gRPC errors.
#[derive(Clone, Debug)]
pub struct AuthorityServer {
    storage: Arc<CertStorage>,
    resolver: IdentityResolver,
    metrics: AuthorityMetrics,
}

struct Issued {
    cert_pem: String,
    endpoint: Endpoint,
    authority: Arc<Cert>,
}

struct Refused {
    failure: Failure,
    message: String,
}

// === impl AuthorityServer ===

impl AuthorityServer {
    pub fn new(
        storage: Arc<CertStorage>,
        resolver: IdentityResolver,
        metrics: AuthorityMetrics,
    ) -> Self {
        Self {
            storage,
            resolver,
            metrics,
        }
    }

    pub fn svc(self) -> AuthorityServiceServer<Self> {
        AuthorityServiceServer::new(self)
    }

    pub fn certificate_svc(self) -> DubboCertificateServiceServer<Self> {
        DubboCertificateServiceServer::new(self)
    }

    async fn issue(
        &self,
        method: &'static str,
        csr: &str,
        creds: Credentials,
    ) -> Result<Issued, Refused> {
        if csr.is_empty() {
            return Err(Refused::new(Failure::InvalidCsr, "CSR is empty."));
        }
        let csr = Csr::from_pem(csr).map_err(|error| {
            tracing::debug!(%error, "Invalid CSR");
            Refused::new(Failure::InvalidCsr, "Decode csr failed.")
        })?;

        let peer = creds.peer.as_ref().map(|p| p.remote_addr);
        let endpoint = self.resolver.resolve(creds).await.map_err(|error| {
            tracing::warn!(?peer, %error, "Failed to resolve endpoint");
            Refused::new(Failure::Unauthenticated, error.to_string())
        })?;

        let authority = self
            .storage
            .authority_cert()
            .filter(|c| c.is_valid())
            .ok_or_else(|| Refused::new(Failure::NoAuthority, "No valid authority certificate."))?;
        let cert_pem = sign_from_csr(
            csr,
            Some(&endpoint),
            &authority,
            self.storage.config().cert_validity,
        )
        .map_err(|error| {
            tracing::warn!(?peer, %error, "Failed to sign certificate");
            Refused::new(Failure::Signing, error.to_string())
        })?;

        tracing::info!(?peer, endpoint = %endpoint.id, method, "Signed certificate");
        Ok(Issued {
            cert_pem,
            endpoint,
            authority,
        })
    }

    /// Unix milliseconds halfway through a new certificate's lifetime.
    fn renew_at(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let half = self.storage.config().cert_validity / 2;
        i64::try_from((now + half).as_millis()).unwrap_or(i64::MAX)
    }
}

#[async_trait::async_trait]
impl AuthorityService for AuthorityServer {
    async fn create_identity(
        &self,
        req: tonic::Request<IdentityRequest>,
    ) -> Result<tonic::Response<IdentityResponse>, tonic::Status> {
        let creds = Credentials::from_request(&req);
        let IdentityRequest { csr, .. } = req.into_inner();

        let issued = self.issue(CREATE_IDENTITY, &csr, creds).await;
        let rsp = match issued.and_then(|issued| self.with_token(issued)) {
            Ok((issued, token)) => {
                self.metrics.issued(CREATE_IDENTITY);
                let trusted = self.storage.trusted_certs();
                let renew_at = self.renew_at();
                IdentityResponse {
                    success: true,
                    message: "OK".to_string(),
                    cert_pem: issued.cert_pem,
                    trust_certs: trusted.iter().map(|c| c.pem().to_string()).collect(),
                    token,
                    trusted_token_public_keys: trusted
                        .iter()
                        .map(|c| c.public_key_pem().to_string())
                        .collect(),
                    refresh_time: renew_at,
                    expire_time: renew_at,
                }
            }
            Err(Refused { failure, message }) => {
                self.metrics.failed(CREATE_IDENTITY, failure);
                IdentityResponse {
                    success: false,
                    message,
                    ..Default::default()
                }
            }
        };
        Ok(tonic::Response::new(rsp))
    }
}

#[async_trait::async_trait]
impl DubboCertificateService for AuthorityServer {
    async fn create_certificate(
        &self,
        req: tonic::Request<DubboCertificateRequest>,
    ) -> Result<tonic::Response<DubboCertificateResponse>, tonic::Status> {
        let creds = Credentials::from_request(&req);
        let DubboCertificateRequest { csr, .. } = req.into_inner();

        let rsp = match self.issue(CREATE_CERTIFICATE, &csr, creds).await {
            Ok(issued) => {
                self.metrics.issued(CREATE_CERTIFICATE);
                DubboCertificateResponse {
                    success: true,
                    message: "OK".to_string(),
                    cert_pem: issued.cert_pem,
                    trust_certs: vec![issued.authority.pem().to_string()],
                    expire_time: self.renew_at(),
                }
            }
            Err(Refused { failure, message }) => {
                self.metrics.failed(CREATE_CERTIFICATE, failure);
                DubboCertificateResponse {
                    success: false,
                    message,
                    ..Default::default()
                }
            }
        };
        Ok(tonic::Response::new(rsp))
    }
}

impl AuthorityServer {
    fn with_token(&self, issued: Issued) -> Result<(Issued, String), Refused> {
        let validity = self.storage.config().cert_validity;
        match jwt::issue(&issued.endpoint, &issued.authority, validity) {
            Ok(token) => Ok((issued, token)),
            Err(error) => {
                tracing::warn!(endpoint = %issued.endpoint.id, %error, "Failed to sign token");
                Err(Refused::new(Failure::Signing, error.to_string()))
            }
        }
    }
}

// === impl Refused ===

impl Refused {
    fn new(failure: Failure, message: impl Into<String>) -> Self {
        Self {
            failure,
            message: message.into(),
        }
    }
}
