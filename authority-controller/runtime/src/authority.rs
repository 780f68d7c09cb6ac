use crate::{
    cert::{decode_cert, Cert, CertStorage},
    core::{AuthoritySecret, Cluster, WebhookConfig},
};
use anyhow::{bail, Result};
use std::sync::Arc;
use tokio::{sync::watch, time};

/// Keeps the local authority certificate in step with the one stored in the
/// cluster.
///
/// The lease holder rotates the authority when it nears expiry and publishes
/// it to the CA secret, the trust config maps and the webhook
/// configuration. Other replicas install whatever the secret holds.
pub(crate) struct Authority {
    cluster: Arc<dyn Cluster>,
    storage: Arc<CertStorage>,
    namespace: String,
    webhook: WebhookConfig,
    leading: bool,

    /// Installed locally but not yet written to the cluster.
    unpublished: Option<Arc<Cert>>,
}

// === impl Authority ===

impl Authority {
    pub(crate) fn new(
        cluster: Arc<dyn Cluster>,
        storage: Arc<CertStorage>,
        namespace: String,
        webhook: WebhookConfig,
    ) -> Self {
        Self {
            cluster,
            storage,
            namespace,
            webhook,
            leading: false,
            unpublished: None,
        }
    }

    /// Reconciles immediately and then every `interval` until shutdown.
    pub(crate) async fn run(
        mut self,
        claims: watch::Receiver<Arc<kubert::lease::Claim>>,
        hostname: String,
        interval: time::Duration,
        drain: drain::Watch,
    ) {
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);
        loop {
            let leader = claims.borrow().is_current_for(&hostname);
            self.reconcile(leader).await;

            tokio::select! {
                _ = time::sleep(interval) => {}
                _ = &mut shutdown => {
                    tracing::debug!("Shutting down");
                    return;
                }
            }
        }
    }

    pub(crate) async fn reconcile(&mut self, leader: bool) {
        let gained = leader && !self.leading;
        if leader != self.leading {
            tracing::info!(leader, "Authority leadership changed");
            self.leading = leader;
        }

        // A pending certificate is newer than anything stored.
        if !(leader && self.unpublished.is_some()) {
            if let Err(error) = self.load().await {
                tracing::warn!(%error, "Failed to load authority certificate");
            }
        }

        if !leader {
            return;
        }

        match self.storage.rotate_authority() {
            Ok(Some(cert)) => self.unpublished = Some(cert),
            Ok(None) => {}
            Err(error) => tracing::error!(%error, "Failed to generate authority certificate"),
        }
        if gained && self.unpublished.is_none() {
            // The previous leader may not have finished publishing.
            self.unpublished = self.storage.authority_cert();
        }

        if let Some(cert) = self.unpublished.clone() {
            match self.publish(&cert).await {
                Ok(()) => {
                    tracing::info!(not_after = ?cert.not_after(), "Published authority certificate");
                    self.unpublished = None;
                }
                Err(error) => {
                    tracing::warn!(%error, "Failed to publish authority certificate");
                }
            }
        }
    }

    /// Installs the stored authority certificate if it is valid and differs
    /// from the local one.
    async fn load(&self) -> Result<()> {
        let Some(secret) = self.cluster.get_authority_cert(&self.namespace).await? else {
            tracing::debug!("No authority certificate stored");
            return Ok(());
        };
        if self
            .storage
            .authority_cert()
            .is_some_and(|c| c.pem() == secret.cert_pem)
        {
            return Ok(());
        }

        let Some(cert) = decode_cert(&secret.cert_pem, &secret.key_pem) else {
            bail!("stored authority certificate could not be decoded");
        };
        if !cert.is_valid() {
            tracing::info!(not_after = ?cert.not_after(), "Stored authority certificate is not valid");
            return Ok(());
        }

        tracing::info!(not_after = ?cert.not_after(), "Loaded authority certificate");
        self.storage.set_authority_cert(Arc::new(cert));
        Ok(())
    }

    async fn publish(&self, cert: &Cert) -> Result<()> {
        let secret = AuthoritySecret {
            cert_pem: cert.pem().to_string(),
            key_pem: cert.key_pem().to_string(),
        };
        self.cluster
            .update_authority_cert(&secret, &self.namespace)
            .await?;
        self.cluster.update_authority_public_key(cert.pem()).await?;
        self.cluster
            .update_webhook_config(&self.webhook, cert.pem())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cert::{generate_authority_cert, Config},
        core::{AuthorizationType, Endpoint},
    };
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct MockCluster {
        state: Mutex<State>,
    }

    #[derive(Debug, Default)]
    struct State {
        secret: Option<AuthoritySecret>,
        public_key: Option<String>,
        webhook_ca: Option<String>,
        fail_updates: bool,
    }

    #[async_trait::async_trait]
    impl Cluster for MockCluster {
        async fn get_authority_cert(&self, _namespace: &str) -> Result<Option<AuthoritySecret>> {
            Ok(self.state.lock().secret.clone())
        }

        async fn update_authority_cert(
            &self,
            secret: &AuthoritySecret,
            _namespace: &str,
        ) -> Result<()> {
            let mut state = self.state.lock();
            if state.fail_updates {
                bail!("forbidden");
            }
            state.secret = Some(secret.clone());
            Ok(())
        }

        async fn update_authority_public_key(&self, cert_pem: &str) -> Result<()> {
            self.state.lock().public_key = Some(cert_pem.to_string());
            Ok(())
        }

        async fn update_webhook_config(&self, _: &WebhookConfig, ca_pem: &str) -> Result<()> {
            self.state.lock().webhook_ca = Some(ca_pem.to_string());
            Ok(())
        }

        async fn verify_service_account(
            &self,
            _token: &str,
            _: AuthorizationType,
        ) -> Result<Option<Endpoint>> {
            Ok(None)
        }
    }

    fn authority(cluster: Arc<MockCluster>) -> (Authority, Arc<CertStorage>) {
        let storage = Arc::new(CertStorage::new(Config::default()));
        let authority = Authority::new(
            cluster,
            storage.clone(),
            "dubbo-system".to_string(),
            WebhookConfig {
                namespace: "dubbo-system".to_string(),
                service_name: "dubbo-ca".to_string(),
                port: 30080,
                allow_on_err: true,
            },
        );
        (authority, storage)
    }

    fn stored(cert: &Cert) -> AuthoritySecret {
        AuthoritySecret {
            cert_pem: cert.pem().to_string(),
            key_pem: cert.key_pem().to_string(),
        }
    }

    #[tokio::test]
    async fn leader_generates_and_publishes() {
        let cluster = Arc::new(MockCluster::default());
        let (mut authority, storage) = authority(cluster.clone());

        authority.reconcile(true).await;

        let cert = storage.authority_cert().expect("authority must be generated");
        assert!(storage.is_authority_valid());
        let state = cluster.state.lock();
        assert_eq!(state.secret, Some(stored(&cert)));
        assert_eq!(state.public_key.as_deref(), Some(cert.pem()));
        assert_eq!(state.webhook_ca.as_deref(), Some(cert.pem()));
    }

    #[tokio::test]
    async fn leader_reuses_stored_authority() {
        let cert = generate_authority_cert(None, Duration::from_secs(30 * 24 * 60 * 60)).unwrap();
        let cluster = Arc::new(MockCluster::default());
        cluster.state.lock().secret = Some(stored(&cert));
        let (mut authority, storage) = authority(cluster.clone());

        authority.reconcile(true).await;

        assert_eq!(storage.authority_cert().unwrap().pem(), cert.pem());
        assert_eq!(storage.trusted_certs().len(), 1);
        assert_eq!(cluster.state.lock().secret, Some(stored(&cert)));
    }

    #[tokio::test]
    async fn followers_install_stored_authority() {
        let cluster = Arc::new(MockCluster::default());
        let (mut follower, storage) = authority(cluster.clone());

        follower.reconcile(false).await;
        assert!(storage.authority_cert().is_none());

        let cert = generate_authority_cert(None, Duration::from_secs(3600)).unwrap();
        cluster.state.lock().secret = Some(stored(&cert));
        follower.reconcile(false).await;
        assert_eq!(storage.authority_cert().unwrap().pem(), cert.pem());
        assert!(cluster.state.lock().public_key.is_none());
    }

    #[tokio::test]
    async fn failed_publish_is_retried() {
        let cluster = Arc::new(MockCluster::default());
        let old = generate_authority_cert(None, Duration::ZERO).unwrap();
        cluster.state.lock().secret = Some(stored(&old));
        cluster.state.lock().fail_updates = true;
        let (mut authority, storage) = authority(cluster.clone());

        authority.reconcile(true).await;
        let cert = storage.authority_cert().unwrap();
        assert_ne!(cert.pem(), old.pem());
        assert_eq!(cluster.state.lock().secret, Some(stored(&old)));

        // The pending certificate is not replaced by the stored one.
        cluster.state.lock().fail_updates = false;
        authority.reconcile(true).await;
        assert_eq!(storage.authority_cert().unwrap().pem(), cert.pem());
        assert_eq!(cluster.state.lock().secret, Some(stored(&cert)));
    }

    #[tokio::test]
    async fn new_leader_republishes() {
        let cert = generate_authority_cert(None, Duration::from_secs(3600)).unwrap();
        let cluster = Arc::new(MockCluster::default());
        cluster.state.lock().secret = Some(stored(&cert));
        let (mut authority, _storage) = authority(cluster.clone());

        authority.reconcile(false).await;
        assert!(cluster.state.lock().webhook_ca.is_none());

        authority.reconcile(true).await;
        assert_eq!(cluster.state.lock().webhook_ca.as_deref(), Some(cert.pem()));
    }
}
