use crate::{Cert, Error};
use dubbo_authority_core::Endpoint;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
    SerialNumber,
};
use std::{
    fmt,
    net::IpAddr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

const AUTHORITY_CN: &str = "Dubbo RA";
const AUTHORITY_ORG: &str = "Apache Dubbo";
const SERVER_CN: &str = "Dubbo";

/// A decoded certificate signing request.
pub struct Csr(CertificateSigningRequestParams);

/// Generates a new authority certificate. Without a root, the authority is
/// self-signed.
pub fn generate_authority_cert(root: Option<&Cert>, validity: Duration) -> Result<Cert, Error> {
    let key = KeyPair::generate().map_err(Error::Key)?;

    let mut params = CertificateParams::default();
    params.serial_number = Some(random_serial());
    params.distinguished_name = {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, AUTHORITY_CN);
        dn.push(DnType::OrganizationName, AUTHORITY_ORG);
        dn
    };
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    set_validity(&mut params, validity);

    let cert = match root {
        None => params.self_signed(&key).map_err(Error::Sign)?,
        Some(root) => {
            let issuer =
                Issuer::from_ca_cert_pem(root.pem(), root.key_pair()).map_err(Error::Sign)?;
            params.signed_by(&key, &issuer).map_err(Error::Sign)?
        }
    };
    Cert::new(cert.pem(), key, Vec::new())
}

/// Signs a server certificate covering every name in `names`.
pub fn sign_server_cert<'n, I>(authority: &Cert, names: I, validity: Duration) -> Result<Cert, Error>
where
    I: IntoIterator<Item = &'n String>,
{
    let key = KeyPair::generate().map_err(Error::Key)?;

    let mut params = CertificateParams::default();
    params.serial_number = Some(random_serial());
    params.distinguished_name = {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, SERVER_CN);
        dn
    };
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.subject_alt_names = names
        .into_iter()
        .map(|name| {
            name.as_str()
                .try_into()
                .map(SanType::DnsName)
                .map_err(|source| Error::InvalidName {
                    name: name.clone(),
                    source,
                })
        })
        .collect::<Result<_, _>>()?;
    set_validity(&mut params, validity);

    let issuer = Issuer::from_ca_cert_pem(authority.pem(), authority.key_pair())
        .map_err(Error::Sign)?;
    let cert = params.signed_by(&key, &issuer).map_err(Error::Sign)?;
    Cert::new(cert.pem(), key, vec![authority.der().clone()])
}

/// Signs the public key of a CSR, binding it to `endpoint`.
///
/// The subject is taken from the request, with the common name replaced by
/// the endpoint ID. The endpoint's SPIFFE ID and IPs become SANs.
pub fn sign_from_csr(
    csr: Csr,
    endpoint: Option<&Endpoint>,
    authority: &Cert,
    validity: Duration,
) -> Result<String, Error> {
    let Csr(mut csr) = csr;

    let params = &mut csr.params;
    params.serial_number = Some(random_serial());
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.subject_alt_names = Vec::new();
    if let Some(endpoint) = endpoint {
        if !endpoint.id.is_empty() {
            params
                .distinguished_name
                .push(DnType::CommonName, endpoint.id.as_str());
        }
        if let Some(id) = endpoint.spiffe_id.as_deref() {
            match id.try_into() {
                Ok(uri) => params.subject_alt_names.push(SanType::URI(uri)),
                Err(error) => tracing::warn!(%id, %error, "Invalid SPIFFE ID"),
            }
        }
        for ip in &endpoint.ips {
            match ip.parse::<IpAddr>() {
                Ok(ip) => params.subject_alt_names.push(SanType::IpAddress(ip)),
                Err(error) => tracing::debug!(%ip, %error, "Skipping invalid endpoint IP"),
            }
        }
    }
    set_validity(params, validity);

    let issuer = Issuer::from_ca_cert_pem(authority.pem(), authority.key_pair())
        .map_err(Error::Sign)?;
    let cert = csr.signed_by(&issuer).map_err(Error::Sign)?;
    Ok(cert.pem())
}

/// Generates a key pair and a CSR for it, returning `(csr_pem, key_pem)`.
pub fn generate_csr(common_name: &str) -> Result<(String, String), Error> {
    let key = KeyPair::generate().map_err(Error::Key)?;
    let mut params = CertificateParams::default();
    params.distinguished_name = {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn
    };
    let csr = params
        .serialize_request(&key)
        .map_err(Error::Sign)?
        .pem()
        .map_err(Error::Sign)?;
    Ok((csr, key.serialize_pem()))
}

// === impl Csr ===

impl Csr {
    pub fn from_pem(pem: &str) -> Result<Self, Error> {
        CertificateSigningRequestParams::from_pem(pem)
            .map(Self)
            .map_err(Error::InvalidCsr)
    }
}

impl fmt::Debug for Csr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Csr")
            .field("subject", &self.0.params.distinguished_name)
            .finish_non_exhaustive()
    }
}

fn set_validity(params: &mut CertificateParams, validity: Duration) {
    // X.509 times have a resolution of one second.
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| UNIX_EPOCH + Duration::from_secs(d.as_secs()))
        .unwrap_or(UNIX_EPOCH);
    params.not_before = now.into();
    params.not_after = (now + validity).into();
}

fn random_serial() -> SerialNumber {
    let mut serial: [u8; 16] = rand::random();
    serial[0] &= 0x7f;
    SerialNumber::from_slice(&serial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode_cert;
    use dubbo_authority_core::KubernetesEnv;

    const HOUR: Duration = Duration::from_secs(60 * 60);
    const YEAR: Duration = Duration::from_secs(365 * 24 * 60 * 60);

    #[test]
    fn authority_is_valid_after_generation() {
        let authority = generate_authority_cert(None, YEAR).unwrap();
        assert!(authority.is_valid());
        assert!(!authority.need_refresh());
        assert_eq!(
            authority.not_after().duration_since(authority.not_before()).unwrap(),
            YEAR
        );
    }

    #[test]
    fn authority_needs_refresh_in_last_fifth() {
        let authority = generate_authority_cert(None, Duration::from_secs(1000)).unwrap();
        let refresh_at = authority.not_after() - Duration::from_secs(200);
        assert!(!authority.need_refresh_at(refresh_at - Duration::from_secs(1)));
        assert!(authority.need_refresh_at(refresh_at));
        assert!(authority.need_refresh_at(authority.not_after() + Duration::from_secs(1)));
        assert!(!authority.is_valid_at(authority.not_after() + Duration::from_secs(1)));
    }

    #[test]
    fn authority_signed_by_root() {
        let root = generate_authority_cert(None, YEAR).unwrap();
        let authority = generate_authority_cert(Some(&root), YEAR).unwrap();
        assert!(authority.is_valid());
        assert_ne!(authority.pem(), root.pem());
    }

    #[test]
    fn sign_csr_round_trip() {
        let authority = generate_authority_cert(None, YEAR).unwrap();
        let (csr, key) = generate_csr("workload").unwrap();
        let endpoint = Endpoint {
            id: "web-0".to_string(),
            ips: vec!["10.0.0.1".to_string()],
            spiffe_id: Some("spiffe://cluster.local/ns/default/sa/web".to_string()),
            kubernetes_env: Some(KubernetesEnv::default()),
        };

        let csr = Csr::from_pem(&csr).unwrap();
        let pem = sign_from_csr(csr, Some(&endpoint), &authority, HOUR).unwrap();
        let cert = decode_cert(&pem, &key).expect("signed certificate must decode");
        assert!(cert.is_valid());
        assert!(!cert.need_refresh());
        assert_eq!(cert.not_after().duration_since(cert.not_before()).unwrap(), HOUR);
        assert_eq!(cert.uris(), vec![endpoint.spiffe_id.clone().unwrap()]);
        assert_eq!(
            crate::spiffe_id_from_der(cert.der()),
            endpoint.spiffe_id.clone()
        );
    }

    #[test]
    fn decoded_with_wrong_key_needs_refresh() {
        let authority = generate_authority_cert(None, YEAR).unwrap();
        let (csr, _) = generate_csr("workload").unwrap();
        let (_, other_key) = generate_csr("other").unwrap();
        let pem = sign_from_csr(Csr::from_pem(&csr).unwrap(), None, &authority, HOUR).unwrap();
        let cert = decode_cert(&pem, &other_key).unwrap();
        assert!(cert.need_refresh());
    }

    #[test]
    fn same_csr_gets_new_serials() {
        let authority = generate_authority_cert(None, YEAR).unwrap();
        let (csr, _) = generate_csr("workload").unwrap();
        let a = sign_from_csr(Csr::from_pem(&csr).unwrap(), None, &authority, HOUR).unwrap();
        let b = sign_from_csr(Csr::from_pem(&csr).unwrap(), None, &authority, HOUR).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_garbage_csr() {
        assert!(matches!(
            Csr::from_pem("not a csr"),
            Err(Error::InvalidCsr(_))
        ));
    }

    #[test]
    fn server_cert_covers_names() {
        let authority = generate_authority_cert(None, YEAR).unwrap();
        let names = vec!["localhost".to_string(), "dubbo-ca.dubbo-system.svc".to_string()];
        let cert = sign_server_cert(&authority, &names, HOUR).unwrap();
        assert!(cert.is_valid());
        assert_eq!(cert.dns_names(), names);
        assert_eq!(cert.certified_key().unwrap().cert.len(), 2);
    }
}
