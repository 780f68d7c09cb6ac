use crate::{ConnectionRegistry, PolicyOrigin};
use dubbo_authority_core::RulePolicy;
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};

/// Stores the policies of a single rule type.
///
/// The policy map is never modified in place: each effective change installs
/// a new map together with the next revision, so snapshots handed out
/// earlier are unaffected.
#[derive(Debug)]
pub struct RuleHandler<P> {
    state: Mutex<State<P>>,
    registry: ConnectionRegistry,
}

#[derive(Debug)]
struct State<P> {
    revision: i64,
    policies: Arc<BTreeMap<String, P>>,
}

// === impl RuleHandler ===

impl<P: RulePolicy> RuleHandler<P> {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self {
            state: Mutex::new(State {
                revision: 0,
                policies: Arc::default(),
            }),
            registry,
        }
    }

    pub fn add(&self, key: String, policy: P) {
        if let Err(error) = policy.validate() {
            tracing::warn!(rule_type = %P::RULE_TYPE, %key, %error, "Ignoring invalid policy");
            return;
        }
        self.apply(key, Some(policy));
    }

    pub fn update(&self, key: String, policy: P) {
        self.add(key, policy)
    }

    pub fn delete(&self, key: &str) {
        self.apply(key.to_string(), None);
    }

    pub fn get(&self, key: &str) -> Option<P> {
        self.state.lock().policies.get(key).cloned()
    }

    pub fn revision(&self) -> i64 {
        self.state.lock().revision
    }

    pub fn snapshot(&self) -> PolicyOrigin<P> {
        let state = self.state.lock();
        PolicyOrigin::new(state.revision, state.policies.clone())
    }

    fn apply(&self, key: String, policy: Option<P>) {
        let mut state = self.state.lock();
        if state.policies.get(&key) == policy.as_ref() {
            tracing::trace!(rule_type = %P::RULE_TYPE, %key, "Policy unchanged");
            return;
        }

        let mut policies = (*state.policies).clone();
        match policy {
            Some(policy) => {
                tracing::debug!(rule_type = %P::RULE_TYPE, %key, "Storing policy");
                policies.insert(key, policy);
            }
            None => {
                tracing::debug!(rule_type = %P::RULE_TYPE, %key, "Removing policy");
                policies.remove(&key);
            }
        }
        state.policies = Arc::new(policies);
        state.revision += 1;

        // Publishing while the state is locked keeps origins in revision
        // order.
        let origin = PolicyOrigin::new(state.revision, state.policies.clone());
        self.registry.publish(Arc::new(origin));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Origin;
    use dubbo_authority_core::{authorization, Endpoint};
    use std::time::Duration;

    type Handler = RuleHandler<authorization::Policy>;

    fn handler() -> (Handler, ConnectionRegistry) {
        let registry = ConnectionRegistry::new(Duration::from_secs(30));
        (RuleHandler::new(registry.clone()), registry)
    }

    fn policy(name: &str, action: &str) -> authorization::Policy {
        authorization::Policy {
            name: name.to_string(),
            spec: Some(authorization::PolicySpec {
                action: action.to_string(),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn add_renders_for_any_endpoint() {
        let (handler, registry) = handler();
        handler.add("default/p1".to_string(), policy("p1", "ALLOW"));
        assert_eq!(handler.revision(), 1);

        let origin = registry
            .latest(authorization::Policy::RULE_TYPE)
            .expect("origin must be published");
        assert_eq!(origin.revision(), 1);
        let rendered = origin.exact(&Endpoint::default()).unwrap();
        assert_eq!(rendered.data, r#"[{"name":"p1","spec":{"action":"ALLOW"}}]"#);
    }

    #[test]
    fn identical_updates_do_not_bump_revision() {
        let (handler, _) = handler();
        handler.add("default/p1".to_string(), policy("p1", "ALLOW"));
        handler.update("default/p1".to_string(), policy("p1", "ALLOW"));
        assert_eq!(handler.revision(), 1);

        handler.update("default/p1".to_string(), policy("p1", "DENY"));
        assert_eq!(handler.revision(), 2);
        assert_eq!(handler.get("default/p1"), Some(policy("p1", "DENY")));
    }

    #[test]
    fn delete_missing_is_a_noop() {
        let (handler, _) = handler();
        handler.delete("default/p1");
        assert_eq!(handler.revision(), 0);

        handler.add("default/p1".to_string(), policy("p1", "ALLOW"));
        handler.delete("default/p1");
        assert_eq!(handler.revision(), 2);
        assert_eq!(handler.get("default/p1"), None);
    }

    #[test]
    fn invalid_policies_are_dropped() {
        let (handler, registry) = handler();
        handler.add(
            "default/p1".to_string(),
            authorization::Policy {
                name: "p1".to_string(),
                spec: None,
            },
        );
        assert_eq!(handler.revision(), 0);
        assert!(registry.latest(authorization::Policy::RULE_TYPE).is_none());

        // An update without a spec leaves the stored policy in place.
        handler.add("default/p1".to_string(), policy("p1", "ALLOW"));
        handler.update(
            "default/p1".to_string(),
            authorization::Policy {
                name: "p1".to_string(),
                spec: None,
            },
        );
        assert_eq!(handler.revision(), 1);
        assert_eq!(handler.get("default/p1"), Some(policy("p1", "ALLOW")));
    }

    #[test]
    fn snapshots_are_not_affected_by_later_changes() {
        let (handler, _) = handler();
        handler.add("default/p1".to_string(), policy("p1", "ALLOW"));
        let before = handler.snapshot();
        handler.add("default/p2".to_string(), policy("p2", "ALLOW"));
        assert_eq!(before.revision(), 1);
        assert_eq!(before.policies().len(), 1);
        assert_eq!(handler.snapshot().policies().len(), 2);
    }
}
