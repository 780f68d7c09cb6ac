//! TLS server configuration backed by a [`CertStorage`].
//!
//! Server certificates are resolved per-handshake by SNI, and client
//! certificates are optional but, when presented, must chain to a currently
//! trusted authority.

use crate::{CertStorage, Error};
use rustls::{
    client::danger::HandshakeSignatureValid,
    crypto::{self, CryptoProvider},
    pki_types::{CertificateDer, UnixTime},
    server::{
        danger::{ClientCertVerified, ClientCertVerifier},
        WebPkiClientVerifier,
    },
    CertificateError, DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig,
    SignatureScheme,
};
use std::sync::Arc;

/// Builds a server configuration that serves certificates from `storage`
/// and verifies client certificates against its trust bundle.
pub fn server_config(storage: Arc<CertStorage>) -> Result<Arc<ServerConfig>, Error> {
    let provider = Arc::new(crypto::ring::default_provider());
    let verifier = Arc::new(TrustedClientVerifier {
        storage: storage.clone(),
        provider: provider.clone(),
    });
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(storage);
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(Arc::new(config))
}

/// Verifies client certificates against the storage's trusted authorities as
/// of the handshake, so that rotated authorities are honored immediately.
#[derive(Debug)]
struct TrustedClientVerifier {
    storage: Arc<CertStorage>,
    provider: Arc<CryptoProvider>,
}

// === impl TrustedClientVerifier ===

impl TrustedClientVerifier {
    fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        for cert in self.storage.trusted_certs() {
            if let Err(error) = roots.add(cert.der().clone()) {
                tracing::warn!(%error, "Skipping unusable trusted certificate");
            }
        }
        roots
    }
}

impl ClientCertVerifier for TrustedClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let roots = self.roots();
        if roots.is_empty() {
            return Err(CertificateError::UnknownIssuer.into());
        }
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), self.provider.clone())
                .allow_unauthenticated()
                .build()
                .map_err(|e| rustls::Error::General(e.to_string()))?;
        verifier.verify_client_cert(end_entity, intermediates, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decode_cert, generate_authority_cert, generate_csr, sign_from_csr, Config, Csr};
    use dubbo_authority_core::Endpoint;
    use std::time::Duration;

    const HOUR: Duration = Duration::from_secs(60 * 60);

    fn verifier(storage: &Arc<CertStorage>) -> TrustedClientVerifier {
        TrustedClientVerifier {
            storage: storage.clone(),
            provider: Arc::new(crypto::ring::default_provider()),
        }
    }

    fn client_cert(authority: &crate::Cert) -> CertificateDer<'static> {
        let (csr, key) = generate_csr("client").unwrap();
        let endpoint = Endpoint {
            id: "client".to_string(),
            spiffe_id: Some("spiffe://cluster.local/ns/default/sa/client".to_string()),
            ..Default::default()
        };
        let csr = Csr::from_pem(&csr).unwrap();
        let pem = sign_from_csr(csr, Some(&endpoint), authority, HOUR).unwrap();
        decode_cert(&pem, &key).unwrap().der().clone()
    }

    #[test]
    fn builds_server_config() {
        let storage = Arc::new(CertStorage::new(Config::default()));
        storage.rotate_authority().unwrap();
        let config = server_config(storage).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
    }

    #[test]
    fn verifies_clients_of_trusted_authorities() {
        let storage = Arc::new(CertStorage::new(Config::default()));
        let verifier = verifier(&storage);
        assert!(!verifier.client_auth_mandatory());

        let authority = storage.rotate_authority().unwrap().unwrap();
        let cert = client_cert(&authority);
        verifier
            .verify_client_cert(&cert, &[], UnixTime::now())
            .expect("client of trusted authority must verify");

        let stranger = generate_authority_cert(None, HOUR).unwrap();
        assert!(verifier
            .verify_client_cert(&client_cert(&stranger), &[], UnixTime::now())
            .is_err());
    }

    #[test]
    fn rejects_clients_without_trust_bundle() {
        let storage = Arc::new(CertStorage::new(Config::default()));
        let authority = generate_authority_cert(None, HOUR).unwrap();
        assert!(verifier(&storage)
            .verify_client_cert(&client_cert(&authority), &[], UnixTime::now())
            .is_err());
    }
}
