use crate::Error;
use rcgen::KeyPair;
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    sign::CertifiedKey,
};
use std::{
    fmt,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use x509_parser::extensions::GeneralName;

/// An X.509 certificate together with its private key.
///
/// A `Cert` is never modified after it is built; rotating a certificate
/// means building a new one.
pub struct Cert {
    pem: String,
    der: CertificateDer<'static>,
    key: KeyPair,
    key_pem: String,
    public_key_pem: String,
    not_before: SystemTime,
    not_after: SystemTime,
    keys_match: bool,
    certified_key: Option<Arc<CertifiedKey>>,
}

/// Decodes a PEM-encoded certificate and key, returning `None` if either
/// cannot be parsed.
pub fn decode_cert(cert_pem: &str, key_pem: &str) -> Option<Cert> {
    let key = match KeyPair::from_pem(key_pem) {
        Ok(key) => key,
        Err(error) => {
            tracing::warn!(%error, "Failed to decode private key");
            return None;
        }
    };
    match Cert::new(cert_pem.to_string(), key, Vec::new()) {
        Ok(cert) => Some(cert),
        Err(error) => {
            tracing::warn!(%error, "Failed to decode certificate");
            None
        }
    }
}

/// Returns the first SPIFFE URI SAN in a DER-encoded certificate.
pub fn spiffe_id_from_der(der: &[u8]) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    let san = cert.subject_alternative_name().ok()??;
    san.value.general_names.iter().find_map(|name| match name {
        GeneralName::URI(uri) if uri.starts_with("spiffe://") => Some(uri.to_string()),
        _ => None,
    })
}

// === impl Cert ===

impl Cert {
    /// Builds a certificate from its PEM form and key. `chain` holds any
    /// issuer certificates served after the leaf.
    pub(crate) fn new(
        pem: String,
        key: KeyPair,
        chain: Vec<CertificateDer<'static>>,
    ) -> Result<Self, Error> {
        let der = CertificateDer::from(
            ::pem::parse(pem.as_bytes())
                .map_err(|e| Error::Parse(e.to_string()))?
                .into_contents(),
        );

        let key_der = key.serialize_der();
        let (not_before, not_after, public_key_pem, keys_match) = {
            let (_, x509) = x509_parser::parse_x509_certificate(&der)
                .map_err(|e| Error::Parse(e.to_string()))?;
            let validity = x509.validity();
            let spki = x509.public_key();
            let public_key_pem = ::pem::encode(&::pem::Pem::new("PUBLIC KEY", spki.raw.to_vec()));
            let keys_match = public_point(&key_der).as_deref()
                == Some(spki.subject_public_key.data.as_ref());
            (
                from_unix(validity.not_before.timestamp()),
                from_unix(validity.not_after.timestamp()),
                public_key_pem,
                keys_match,
            )
        };

        let certified_key = {
            let mut certs = Vec::with_capacity(chain.len() + 1);
            certs.push(der.clone());
            certs.extend(chain);
            let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der));
            match rustls::crypto::ring::sign::any_supported_type(&key) {
                Ok(signer) => Some(Arc::new(CertifiedKey::new(certs, signer))),
                Err(error) => {
                    tracing::warn!(%error, "Certificate key is not usable for TLS");
                    None
                }
            }
        };

        Ok(Self {
            key_pem: key.serialize_pem(),
            pem,
            der,
            key,
            public_key_pem,
            not_before,
            not_after,
            keys_match,
            certified_key,
        })
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub(crate) fn key_pair(&self) -> &KeyPair {
        &self.key
    }

    /// The PEM-encoded subject public key info.
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    pub fn not_before(&self) -> SystemTime {
        self.not_before
    }

    pub fn not_after(&self) -> SystemTime {
        self.not_after
    }

    /// The certificate chain and signing key used to serve TLS.
    pub fn certified_key(&self) -> Option<Arc<CertifiedKey>> {
        self.certified_key.clone()
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(SystemTime::now())
    }

    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        !self.pem.is_empty()
            && !self.key_pem.is_empty()
            && self.certified_key.is_some()
            && self.not_before <= now
            && now <= self.not_after
    }

    pub fn need_refresh(&self) -> bool {
        self.need_refresh_at(SystemTime::now())
    }

    /// True when the certificate is invalid, has entered the last fifth of
    /// its validity window, or no longer matches its key.
    pub fn need_refresh_at(&self, now: SystemTime) -> bool {
        if !self.is_valid_at(now) || !self.keys_match {
            return true;
        }
        let validity = self
            .not_after
            .duration_since(self.not_before)
            .unwrap_or_default();
        now + validity / 5 >= self.not_after
    }

    /// The DNS names in the certificate's subject alternative names.
    pub fn dns_names(&self) -> Vec<String> {
        self.general_names(|name| match name {
            GeneralName::DNSName(dns) => Some(dns.to_string()),
            _ => None,
        })
    }

    /// The URIs in the certificate's subject alternative names.
    pub fn uris(&self) -> Vec<String> {
        self.general_names(|name| match name {
            GeneralName::URI(uri) => Some(uri.to_string()),
            _ => None,
        })
    }

    fn general_names<F>(&self, f: F) -> Vec<String>
    where
        F: Fn(&GeneralName<'_>) -> Option<String>,
    {
        let Ok((_, cert)) = x509_parser::parse_x509_certificate(&self.der) else {
            return Vec::new();
        };
        match cert.subject_alternative_name() {
            Ok(Some(san)) => san.value.general_names.iter().filter_map(f).collect(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Debug for Cert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cert")
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("keys_match", &self.keys_match)
            .finish_non_exhaustive()
    }
}

fn from_unix(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

/// The uncompressed EC point of a PKCS#8 P-256 key.
fn public_point(pkcs8: &[u8]) -> Option<Vec<u8>> {
    use ring::signature::{EcdsaKeyPair, KeyPair as _, ECDSA_P256_SHA256_ASN1_SIGNING};
    let rng = ring::rand::SystemRandom::new();
    EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8, &rng)
        .ok()
        .map(|key| key.public_key().as_ref().to_vec())
}
