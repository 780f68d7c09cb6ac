use anyhow::{bail, Result};
use dubbo_authority_core::{
    service_account_spiffe_id, AuthoritySecret, AuthorizationType, Cluster, Endpoint,
    KubernetesEnv, WebhookConfig,
};
use dubbo_authority_k8s_api::{
    self as k8s,
    api::{
        admissionregistration::v1::{
            MutatingWebhook, RuleWithOperations, ServiceReference, WebhookClientConfig,
        },
        authentication::v1::{TokenReviewSpec, TokenReviewStatus},
    },
    Api, ByteString, ConfigMap, MutatingWebhookConfiguration, Namespace, ObjectMeta, Patch,
    PatchParams, Pod, PostParams, ResourceExt, Secret, TokenReview,
};
const FIELD_MANAGER: &str = "dubbo-authority";

const SECRET_NAME: &str = "dubbo-ca-secret";
const SECRET_CERT_KEY: &str = "cert.pem";
const SECRET_KEY_KEY: &str = "pri.pem";

const TRUST_CONFIG_MAP: &str = "dubbo-ca-cert";
const TRUST_CONFIG_KEY: &str = "ca.crt";

const WEBHOOK_CONFIG_NAME: &str = "dubbo-ca";
const WEBHOOK_NAME: &str = "dubbo-ca.k8s.io";
const WEBHOOK_PATH: &str = "/mutating-services";

const POD_NAME_EXTRA: &str = "authentication.kubernetes.io/pod-name";
const POD_UID_EXTRA: &str = "authentication.kubernetes.io/pod-uid";

/// Backs [`Cluster`] with the Kubernetes API.
#[derive(Clone)]
pub struct KubeCluster {
    client: k8s::Client,
    trust_domain: String,
}

/// The pod a reviewed service account token was bound to.
#[derive(Debug, PartialEq, Eq)]
struct ReviewedPod {
    namespace: String,
    service_account: String,
    pod_name: String,
    pod_uid: String,
}

// === impl KubeCluster ===

impl KubeCluster {
    pub fn new(client: k8s::Client, trust_domain: impl Into<String>) -> Self {
        Self {
            client,
            trust_domain: trust_domain.into(),
        }
    }

    async fn apply<K>(&self, api: Api<K>, name: &str, resource: &K) -> Result<()>
    where
        K: k8s::Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned + serde::Serialize,
    {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(name, &params, &Patch::Apply(resource)).await?;
        Ok(())
    }
}

impl std::fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCluster")
            .field("trust_domain", &self.trust_domain)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Cluster for KubeCluster {
    async fn get_authority_cert(&self, namespace: &str) -> Result<Option<AuthoritySecret>> {
        let api = Api::<Secret>::namespaced(self.client.clone(), namespace);
        let Some(secret) = api.get_opt(SECRET_NAME).await? else {
            return Ok(None);
        };
        Ok(secret_to_authority(secret))
    }

    async fn update_authority_cert(&self, secret: &AuthoritySecret, namespace: &str) -> Result<()> {
        let api = Api::<Secret>::namespaced(self.client.clone(), namespace);
        if let Some(current) = api.get_opt(SECRET_NAME).await? {
            if secret_to_authority(current).as_ref() == Some(secret) {
                tracing::debug!(%namespace, "Authority secret is up to date");
                return Ok(());
            }
        }
        self.apply(api, SECRET_NAME, &authority_to_secret(secret, namespace))
            .await?;
        tracing::info!(%namespace, name = SECRET_NAME, "Updated authority secret");
        Ok(())
    }

    async fn update_authority_public_key(&self, cert_pem: &str) -> Result<()> {
        let namespaces = Api::<Namespace>::all(self.client.clone())
            .list(&Default::default())
            .await?;

        let mut failed = 0;
        for ns in namespaces.items {
            let ns = ns.name_any();
            if ns == "kube-system" {
                continue;
            }

            let api = Api::<ConfigMap>::namespaced(self.client.clone(), &ns);
            let current = match api.get_opt(TRUST_CONFIG_MAP).await {
                Ok(cm) => cm,
                Err(error) => {
                    tracing::warn!(%ns, %error, "Failed to get trust config map");
                    failed += 1;
                    continue;
                }
            };
            let up_to_date = current
                .and_then(|cm| cm.data)
                .and_then(|mut data| data.remove(TRUST_CONFIG_KEY))
                .is_some_and(|ca| ca == cert_pem);
            if up_to_date {
                continue;
            }

            match self.apply(api, TRUST_CONFIG_MAP, &trust_config_map(cert_pem, &ns)).await {
                Ok(()) => tracing::info!(%ns, "Updated trust config map"),
                Err(error) => {
                    tracing::warn!(%ns, %error, "Failed to update trust config map");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            bail!("failed to update the trust config map in {failed} namespaces");
        }
        Ok(())
    }

    async fn update_webhook_config(&self, webhook: &WebhookConfig, ca_pem: &str) -> Result<()> {
        let api = Api::<MutatingWebhookConfiguration>::all(self.client.clone());
        if let Some(current) = api.get_opt(WEBHOOK_CONFIG_NAME).await? {
            let bundle = current
                .webhooks
                .as_ref()
                .and_then(|hooks| hooks.first())
                .and_then(|hook| hook.client_config.ca_bundle.as_ref());
            if bundle.is_some_and(|b| b.0 == ca_pem.as_bytes()) {
                tracing::debug!("Webhook config is up to date");
                return Ok(());
            }
        }
        self.apply(api, WEBHOOK_CONFIG_NAME, &webhook_config(webhook, ca_pem))
            .await?;
        tracing::info!(name = WEBHOOK_CONFIG_NAME, "Updated webhook config");
        Ok(())
    }

    async fn verify_service_account(
        &self,
        token: &str,
        authorization_type: AuthorizationType,
    ) -> Result<Option<Endpoint>> {
        let review = TokenReview {
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: authorization_type.audience().map(|a| vec![a.to_string()]),
            },
            ..Default::default()
        };
        let review = Api::<TokenReview>::all(self.client.clone())
            .create(&PostParams::default(), &review)
            .await?;

        let Some(reviewed) = review.status.as_ref().and_then(reviewed_pod) else {
            return Ok(None);
        };

        let pods = Api::<Pod>::namespaced(self.client.clone(), &reviewed.namespace);
        let Some(pod) = pods.get_opt(&reviewed.pod_name).await? else {
            tracing::warn!(ns = %reviewed.namespace, pod = %reviewed.pod_name, "Reviewed pod not found");
            return Ok(None);
        };
        if pod.metadata.uid.as_deref() != Some(reviewed.pod_uid.as_str()) {
            tracing::warn!(ns = %reviewed.namespace, pod = %reviewed.pod_name, "Reviewed pod was replaced");
            return Ok(None);
        }

        Ok(Some(pod_endpoint(&reviewed, pod, &self.trust_domain)))
    }
}

fn secret_to_authority(secret: Secret) -> Option<AuthoritySecret> {
    let mut data = secret.data?;
    let cert = data.remove(SECRET_CERT_KEY)?;
    let key = data.remove(SECRET_KEY_KEY)?;
    Some(AuthoritySecret {
        cert_pem: String::from_utf8(cert.0).ok()?,
        key_pem: String::from_utf8(key.0).ok()?,
    })
}

fn authority_to_secret(authority: &AuthoritySecret, namespace: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(SECRET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(
            [
                (SECRET_CERT_KEY, &authority.cert_pem),
                (SECRET_KEY_KEY, &authority.key_pem),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
            .collect(),
        ),
        ..Default::default()
    }
}

fn trust_config_map(cert_pem: &str, namespace: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(TRUST_CONFIG_MAP.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(
            [(TRUST_CONFIG_KEY.to_string(), cert_pem.to_string())]
                .into_iter()
                .collect(),
        ),
        ..Default::default()
    }
}

fn webhook_config(webhook: &WebhookConfig, ca_pem: &str) -> MutatingWebhookConfiguration {
    let failure_policy = if webhook.allow_on_err { "Ignore" } else { "Fail" };
    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(WEBHOOK_CONFIG_NAME.to_string()),
            ..Default::default()
        },
        webhooks: Some(vec![MutatingWebhook {
            name: WEBHOOK_NAME.to_string(),
            client_config: WebhookClientConfig {
                service: Some(ServiceReference {
                    name: webhook.service_name.clone(),
                    namespace: webhook.namespace.clone(),
                    port: Some(webhook.port.into()),
                    path: Some(WEBHOOK_PATH.to_string()),
                }),
                ca_bundle: Some(ByteString(ca_pem.as_bytes().to_vec())),
                ..Default::default()
            },
            failure_policy: Some(failure_policy.to_string()),
            rules: Some(vec![RuleWithOperations {
                operations: Some(vec!["CREATE".to_string()]),
                api_groups: Some(vec![String::new()]),
                api_versions: Some(vec!["v1".to_string()]),
                resources: Some(vec!["pods".to_string()]),
                ..Default::default()
            }]),
            side_effects: "None".to_string(),
            admission_review_versions: vec!["v1".to_string()],
            ..Default::default()
        }]),
    }
}

/// Extracts the pod binding from a successful review of a pod-bound service
/// account token.
fn reviewed_pod(status: &TokenReviewStatus) -> Option<ReviewedPod> {
    if let Some(error) = status.error.as_deref().filter(|e| !e.is_empty()) {
        tracing::debug!(%error, "Token review failed");
        return None;
    }
    if status.authenticated != Some(true) {
        return None;
    }

    let user = status.user.as_ref()?;
    let username = user.username.as_deref()?;
    let (namespace, service_account) = match username.split(':').collect::<Vec<_>>()[..] {
        ["system", "serviceaccount", ns, sa] => (ns.to_string(), sa.to_string()),
        _ => {
            tracing::debug!(%username, "Token is not a service account token");
            return None;
        }
    };

    let extra = user.extra.as_ref()?;
    let single = |key: &str| match extra.get(key).map(Vec::as_slice) {
        Some([value]) => Some(value.clone()),
        _ => None,
    };
    let (Some(pod_name), Some(pod_uid)) = (single(POD_NAME_EXTRA), single(POD_UID_EXTRA)) else {
        tracing::debug!(%username, "Token is not bound to a pod");
        return None;
    };

    Some(ReviewedPod {
        namespace,
        service_account,
        pod_name,
        pod_uid,
    })
}

fn pod_endpoint(reviewed: &ReviewedPod, pod: Pod, trust_domain: &str) -> Endpoint {
    let ips = pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ips.as_ref())
        .into_iter()
        .flatten()
        .map(|ip| ip.ip.clone())
        .filter(|ip| !ip.is_empty())
        .collect();

    let mut env = KubernetesEnv {
        namespace: reviewed.namespace.clone(),
        pod_name: reviewed.pod_name.clone(),
        ..Default::default()
    };
    let template_hash = pod.labels().get("pod-template-hash").cloned();
    for owner in pod.owner_references() {
        match owner.kind.as_str() {
            "ReplicaSet" => {
                let deployment = template_hash
                    .as_deref()
                    .and_then(|hash| owner.name.strip_suffix(hash))
                    .and_then(|name| name.strip_suffix('-'));
                if let Some(name) = deployment {
                    env.deployment_name = name.to_string();
                }
            }
            "StatefulSet" => env.stateful_set_name = owner.name.clone(),
            _ => {}
        }
    }
    env.pod_labels = pod.metadata.labels.unwrap_or_default();
    env.pod_annotations = pod.metadata.annotations.unwrap_or_default();

    Endpoint {
        id: reviewed.pod_uid.clone(),
        ips,
        spiffe_id: Some(service_account_spiffe_id(
            trust_domain,
            &reviewed.namespace,
            &reviewed.service_account,
        )),
        kubernetes_env: Some(env),
    }
}
