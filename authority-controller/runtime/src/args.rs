use crate::{
    authority::Authority,
    cert::{self, CertStorage},
    core::{Cluster, WebhookConfig},
    grpc::{metrics::AuthorityMetrics, IdentityResolver},
    index,
    k8s::policy::{AuthenticationPolicy, AuthorizationPolicy},
    lease,
    rule::{ConnectionRegistry, RegistryMetrics},
    server::{self, Services},
};
use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "dubbo-authority",
    about = "Issues workload certificates and streams rules to a Dubbo mesh"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "dubbo=info,warn",
        env = "DUBBO_AUTHORITY_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The namespace holding the authority secret. Policies in this namespace
    /// apply mesh-wide.
    #[clap(long, default_value = "dubbo-system", env = "DUBBO_NAMESPACE")]
    namespace: String,

    #[clap(long, default_value = "dubbo-ca")]
    service_name: String,

    /// The Deployment that owns the leader lease.
    #[clap(long, default_value = "dubbo-ca")]
    deployment_name: String,

    /// This replica's name when competing for the leader lease.
    #[clap(long, env = "HOSTNAME")]
    hostname: String,

    #[clap(long, default_value = "30080")]
    webhook_port: u16,

    #[clap(long, default_value_t = true, action = ArgAction::Set)]
    webhook_allow_on_err: bool,

    #[clap(long, default_value = "2592000000")]
    ca_validity_ms: u64,

    #[clap(long, default_value = "3600000")]
    cert_validity_ms: u64,

    /// Accept service account tokens as proof of identity.
    #[clap(long, default_value_t = true, action = ArgAction::Set)]
    enable_oidc_check: bool,

    /// Identify every caller by its address alone.
    #[clap(long)]
    is_trust_anyone: bool,

    #[clap(long, default_value = "30000")]
    push_timeout_ms: u64,

    #[clap(long, default_value = "0.0.0.0:30060")]
    grpc_addr: SocketAddr,

    #[clap(long, default_value = "0.0.0.0:30062")]
    secure_grpc_addr: SocketAddr,

    #[clap(long, default_value = "cluster.local")]
    cluster_domain: String,

    /// A PEM certificate that signs generated authorities.
    #[clap(long, requires = "root_key")]
    root_cert: Option<PathBuf>,

    /// The PEM private key of `--root-cert`.
    #[clap(long, requires = "root_cert")]
    root_key: Option<PathBuf>,
}

impl Args {
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            namespace,
            service_name,
            deployment_name,
            hostname,
            webhook_port,
            webhook_allow_on_err,
            ca_validity_ms,
            cert_validity_ms,
            enable_oidc_check,
            is_trust_anyone,
            push_timeout_ms,
            grpc_addr,
            secure_grpc_addr,
            cluster_domain,
            root_cert,
            root_key,
        } = self;

        let mut prom = <Registry>::default();
        let registry_metrics = RegistryMetrics::register(prom.sub_registry_with_prefix("rule"));
        let authority_metrics = AuthorityMetrics::register(prom.sub_registry_with_prefix("ca"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let claims = lease::init(&runtime, &namespace, &deployment_name, &hostname).await?;

        let config = cert::Config {
            ca_validity: Duration::from_millis(ca_validity_ms),
            cert_validity: Duration::from_millis(cert_validity_ms),
        };
        let storage = Arc::new(CertStorage::new(config));
        if let (Some(cert), Some(key)) = (root_cert, root_key) {
            let root = load_root(&cert, &key)?;
            tracing::info!(
                cert = %cert.display(),
                not_after = ?root.not_after(),
                "Loaded root certificate"
            );
            storage.set_root_cert(Arc::new(root));
        }
        let cluster: Arc<dyn Cluster> = Arc::new(index::KubeCluster::new(
            runtime.client(),
            cluster_domain.clone(),
        ));

        // Load or create the authority before serving so that the first
        // requests can be signed.
        let mut authority = Authority::new(
            cluster.clone(),
            storage.clone(),
            namespace.clone(),
            WebhookConfig {
                namespace: namespace.clone(),
                service_name: service_name.clone(),
                port: webhook_port,
                allow_on_err: webhook_allow_on_err,
            },
        );
        let leader = claims.borrow().is_current_for(&hostname);
        authority.reconcile(leader).await;

        for name in [
            "localhost".to_string(),
            format!("{service_name}.{namespace}.svc"),
            format!("{service_name}.{namespace}.svc.{cluster_domain}"),
        ] {
            if let Err(error) = storage.get_server_cert(&name) {
                tracing::warn!(%name, %error, "Failed to sign server certificate");
            }
        }

        tokio::spawn(
            authority
                .run(
                    claims,
                    hostname,
                    cert::refresh_interval(config.ca_validity),
                    runtime.shutdown_handle(),
                )
                .instrument(info_span!("authority")),
        );
        tokio::spawn(
            storage
                .clone()
                .refresh_server_certs(runtime.shutdown_handle())
                .instrument(info_span!("server_cert")),
        );

        let registry = ConnectionRegistry::with_metrics(
            Duration::from_millis(push_timeout_ms),
            registry_metrics,
        );
        let policy_index = index::Index::shared(namespace, registry.clone());

        let authentication_policies =
            runtime.watch_all::<AuthenticationPolicy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(policy_index.clone(), authentication_policies)
                .instrument(info_span!("authenticationpolicies")),
        );

        let authorization_policies =
            runtime.watch_all::<AuthorizationPolicy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(policy_index, authorization_policies)
                .instrument(info_span!("authorizationpolicies")),
        );

        let services = Services {
            resolver: IdentityResolver::new(
                cluster,
                storage.clone(),
                is_trust_anyone,
                enable_oidc_check,
            ),
            storage,
            registry,
            metrics: authority_metrics,
        };
        tokio::spawn(server::grpc(
            grpc_addr,
            services.clone(),
            runtime.shutdown_handle(),
        ));
        tokio::spawn(server::secure_grpc(
            secure_grpc_addr,
            services,
            runtime.shutdown_handle(),
        ));

        // Block the main thread on the shutdown signal. Once it fires, wait
        // for the background tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

fn load_root(cert: &Path, key: &Path) -> Result<cert::Cert> {
    let cert_pem = std::fs::read_to_string(cert)
        .with_context(|| format!("failed to read {}", cert.display()))?;
    let key_pem = std::fs::read_to_string(key)
        .with_context(|| format!("failed to read {}", key.display()))?;
    match cert::decode_cert(&cert_pem, &key_pem) {
        Some(root) if root.is_valid() => Ok(root),
        Some(_) => bail!("root certificate {} is not valid", cert.display()),
        None => bail!("failed to decode root certificate {}", cert.display()),
    }
}
