use crate::{generate_authority_cert, sign_server_cert, Cert, Error};
use parking_lot::Mutex;
use rustls::{
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use std::{collections::BTreeSet, fmt, sync::Arc, time::Duration};
use tokio::time;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Lifetime of authority certificates.
    pub ca_validity: Duration,

    /// Lifetime of server and workload certificates.
    pub cert_validity: Duration,
}

/// Holds the authority certificate, the trust bundle, and the server
/// certificate served to TLS clients.
pub struct CertStorage {
    config: Config,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    authority: Option<Arc<Cert>>,
    root: Option<Arc<Cert>>,
    trusted: Vec<Arc<Cert>>,
    server: Option<Arc<Cert>>,
    server_names: BTreeSet<String>,
}

/// How often the server certificate is checked.
pub fn refresh_interval(cert_validity: Duration) -> Duration {
    (cert_validity / 100)
        .min(Duration::from_secs(10))
        .max(Duration::from_millis(1))
}

// === impl Config ===

impl Default for Config {
    fn default() -> Self {
        Self {
            ca_validity: Duration::from_secs(30 * 24 * 60 * 60),
            cert_validity: Duration::from_secs(60 * 60),
        }
    }
}

// === impl CertStorage ===

impl CertStorage {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: Mutex::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn authority_cert(&self) -> Option<Arc<Cert>> {
        self.state.lock().authority.clone()
    }

    /// Installs `cert` as the signing authority and trusts it. The server
    /// certificate is re-signed by the new authority on next use.
    pub fn set_authority_cert(&self, cert: Arc<Cert>) {
        let mut state = self.state.lock();
        state.trust(cert.clone());
        state.authority = Some(cert);
        state.server = None;
    }

    pub fn root_cert(&self) -> Option<Arc<Cert>> {
        self.state.lock().root.clone()
    }

    /// Sets the root that signs new authorities. The root is trusted.
    pub fn set_root_cert(&self, cert: Arc<Cert>) {
        let mut state = self.state.lock();
        state.trust(cert.clone());
        state.root = Some(cert);
    }

    /// Returns true if a valid authority certificate is loaded.
    pub fn is_authority_valid(&self) -> bool {
        self.authority_cert().is_some_and(|c| c.is_valid())
    }

    /// Returns true if the authority certificate is missing or due for
    /// rotation.
    pub fn need_refresh(&self) -> bool {
        self.authority_cert().map_or(true, |c| c.need_refresh())
    }

    /// Adds `cert` to the trust bundle unless it is already present.
    /// Certificates are never removed.
    pub fn add_trusted_cert(&self, cert: Arc<Cert>) {
        self.state.lock().trust(cert);
    }

    pub fn trusted_certs(&self) -> Vec<Arc<Cert>> {
        self.state.lock().trusted.clone()
    }

    /// Generates a new authority certificate if the current one needs
    /// refreshing. The new certificate is installed and trusted, and returned
    /// so that it can be published.
    pub fn rotate_authority(&self) -> Result<Option<Arc<Cert>>, Error> {
        if !self.need_refresh() {
            return Ok(None);
        }
        let root = self.root_cert();
        let cert = Arc::new(generate_authority_cert(
            root.as_deref(),
            self.config.ca_validity,
        )?);
        tracing::info!(not_after = ?cert.not_after(), "Generated authority certificate");
        self.set_authority_cert(cert.clone());
        Ok(Some(cert))
    }

    /// Returns a server certificate valid for `name` and every name
    /// previously requested. An empty name requests the current certificate.
    pub fn get_server_cert(&self, name: &str) -> Result<Arc<Cert>, Error> {
        let mut state = self.state.lock();
        if name.is_empty() || state.server_names.contains(name) {
            if let Some(server) = state.server.as_ref().filter(|c| c.is_valid()) {
                return Ok(server.clone());
            }
        }

        let authority = state
            .authority
            .clone()
            .filter(|c| c.is_valid())
            .ok_or(Error::NoAuthority)?;

        // A name is only remembered once a certificate covering it is signed.
        let mut names = state.server_names.clone();
        let added = !name.is_empty() && names.insert(name.to_string());
        let server = Arc::new(sign_server_cert(&authority, &names, self.config.cert_validity)?);
        if added {
            tracing::debug!(%name, "Added server name");
        }
        state.server_names = names;
        state.server = Some(server.clone());
        Ok(server)
    }

    /// Re-signs the server certificate if it is no longer valid. Does nothing
    /// while the authority is invalid.
    pub fn refresh_server_cert(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        let Some(authority) = state.authority.clone().filter(|c| c.is_valid()) else {
            return Ok(());
        };
        if state.server.as_ref().is_some_and(|c| c.is_valid()) {
            return Ok(());
        }
        let server = sign_server_cert(&authority, &state.server_names, self.config.cert_validity)?;
        tracing::debug!(names = state.server_names.len(), "Refreshed server certificate");
        state.server = Some(Arc::new(server));
        Ok(())
    }

    /// Keeps the server certificate fresh until shutdown.
    pub async fn refresh_server_certs(self: Arc<Self>, drain: drain::Watch) {
        let interval = refresh_interval(self.config.cert_validity);
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = time::sleep(interval) => {}
                _ = &mut shutdown => return,
            }
            if let Err(error) = self.refresh_server_cert() {
                tracing::warn!(%error, "Failed to refresh server certificate");
            }
        }
    }
}

// === impl State ===

impl State {
    fn trust(&mut self, cert: Arc<Cert>) {
        if !self.trusted.iter().any(|t| t.pem() == cert.pem()) {
            self.trusted.push(cert);
        }
    }
}

impl fmt::Debug for CertStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CertStorage")
            .field("config", &self.config)
            .field("authority", &state.authority)
            .field("trusted", &state.trusted.len())
            .field("server_names", &state.server_names)
            .finish()
    }
}

/// Serves server certificates by SNI.
impl ResolvesServerCert for CertStorage {
    fn resolve(&self, hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = hello.server_name().unwrap_or_default();
        match self.get_server_cert(name) {
            Ok(cert) => cert.certified_key(),
            Err(error) => {
                tracing::warn!(%name, %error, "No server certificate");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ready;

    fn storage() -> CertStorage {
        let storage = CertStorage::new(Config::default());
        storage.rotate_authority().unwrap();
        storage
    }

    #[test]
    fn server_names_accumulate() {
        let storage = storage();
        let a = storage.get_server_cert("a.example.com").unwrap();
        assert_eq!(a.dns_names(), vec!["a.example.com".to_string()]);

        let b = storage.get_server_cert("b.example.com").unwrap();
        assert_eq!(
            b.dns_names(),
            vec!["a.example.com".to_string(), "b.example.com".to_string()]
        );

        // Known and empty names reuse the cached certificate.
        assert!(Arc::ptr_eq(&b, &storage.get_server_cert("a.example.com").unwrap()));
        assert!(Arc::ptr_eq(&b, &storage.get_server_cert("").unwrap()));
    }

    #[test]
    fn rejected_names_are_not_remembered() {
        let storage = storage();
        let a = storage.get_server_cert("a.example.com").unwrap();

        assert!(matches!(
            storage.get_server_cert("bücher.example.com"),
            Err(Error::InvalidName { .. })
        ));

        // Earlier names keep being served and new names still sign.
        assert!(Arc::ptr_eq(&a, &storage.get_server_cert("a.example.com").unwrap()));
        let b = storage.get_server_cert("b.example.com").unwrap();
        assert_eq!(
            b.dns_names(),
            vec!["a.example.com".to_string(), "b.example.com".to_string()]
        );
        storage.refresh_server_cert().unwrap();
    }

    #[test]
    fn server_cert_requires_authority() {
        let storage = CertStorage::new(Config::default());
        assert!(matches!(
            storage.get_server_cert("localhost"),
            Err(Error::NoAuthority)
        ));
        // Nothing to do until an authority is present.
        storage.refresh_server_cert().unwrap();
    }

    #[test]
    fn rotation_only_when_needed() {
        let storage = CertStorage::new(Config::default());
        assert!(storage.need_refresh());
        let first = storage.rotate_authority().unwrap().expect("must generate");
        assert!(storage.is_authority_valid());
        assert!(storage.rotate_authority().unwrap().is_none());
        assert_eq!(storage.trusted_certs().len(), 1);
        assert!(Arc::ptr_eq(&first, &storage.authority_cert().unwrap()));
    }

    #[test]
    fn short_lived_authority_rotates() {
        let storage = CertStorage::new(Config {
            // An authority without a validity window is never valid.
            ca_validity: Duration::ZERO,
            ..Config::default()
        });
        let first = storage.rotate_authority().unwrap().unwrap();
        let second = storage.rotate_authority().unwrap().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(storage.trusted_certs().len(), 2);
    }

    #[test]
    fn root_is_trusted_and_signs_authorities() {
        let storage = CertStorage::new(Config::default());
        let root = Arc::new(
            crate::generate_authority_cert(None, storage.config().ca_validity).unwrap(),
        );
        storage.set_root_cert(root.clone());
        storage.add_trusted_cert(root.clone());

        let authority = storage.rotate_authority().unwrap().unwrap();
        assert_ne!(authority.pem(), root.pem());
        let trusted = storage.trusted_certs();
        assert_eq!(trusted.len(), 2);
        assert!(Arc::ptr_eq(&trusted[0], &root));
        assert!(Arc::ptr_eq(&trusted[1], &authority));
    }

    #[test]
    fn installed_authority_resigns_server_cert() {
        let storage = storage();
        let before = storage.get_server_cert("localhost").unwrap();

        let other = Arc::new(
            crate::generate_authority_cert(None, storage.config().ca_validity).unwrap(),
        );
        storage.set_authority_cert(other.clone());
        storage.set_authority_cert(other.clone());
        assert_eq!(storage.trusted_certs().len(), 2);

        let after = storage.get_server_cert("").unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.dns_names(), vec!["localhost".to_string()]);
    }

    #[test]
    fn refresh_interval_bounds() {
        assert_eq!(
            refresh_interval(Duration::from_secs(60 * 60)),
            Duration::from_secs(10)
        );
        assert_eq!(
            refresh_interval(Duration::from_secs(100)),
            Duration::from_secs(1)
        );
        assert_eq!(refresh_interval(Duration::ZERO), Duration::from_millis(1));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn refresh_task_stops_on_shutdown() {
        let storage = Arc::new(storage());
        let (signal, watch) = drain::channel();
        let mut task = tokio_test::task::spawn(storage.refresh_server_certs(watch));
        let mut drained = tokio_test::task::spawn(signal.drain());
        assert!(drained.poll().is_pending());
        assert_ready!(task.poll());
        assert_ready!(drained.poll());
    }
}
