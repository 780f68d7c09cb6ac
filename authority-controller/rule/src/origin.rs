use dubbo_authority_core::{Endpoint, RulePolicy, RuleType};
use std::{collections::BTreeMap, fmt, sync::Arc};

/// An immutable snapshot of one rule type's policies at a revision.
pub trait Origin: fmt::Debug + Send + Sync + 'static {
    fn rule_type(&self) -> RuleType;

    fn revision(&self) -> i64;

    /// Renders the policies that apply to `endpoint`.
    fn exact(&self, endpoint: &Endpoint) -> Result<ToClient, serde_json::Error>;
}

/// An origin rendered for a single endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToClient {
    pub rule_type: RuleType,
    pub revision: i64,
    pub data: String,
}

/// The origin published by a [`crate::RuleHandler`].
pub struct PolicyOrigin<P> {
    revision: i64,
    policies: Arc<BTreeMap<String, P>>,
}

// === impl PolicyOrigin ===

impl<P> PolicyOrigin<P> {
    pub(crate) fn new(revision: i64, policies: Arc<BTreeMap<String, P>>) -> Self {
        Self { revision, policies }
    }

    pub fn policies(&self) -> &BTreeMap<String, P> {
        &self.policies
    }
}

impl<P: RulePolicy> Origin for PolicyOrigin<P> {
    fn rule_type(&self) -> RuleType {
        P::RULE_TYPE
    }

    fn revision(&self) -> i64 {
        self.revision
    }

    fn exact(&self, endpoint: &Endpoint) -> Result<ToClient, serde_json::Error> {
        let policies = self
            .policies
            .values()
            .filter_map(|p| p.to_client(endpoint))
            .collect::<Vec<_>>();
        Ok(ToClient {
            rule_type: P::RULE_TYPE,
            revision: self.revision,
            data: serde_json::to_string(&policies)?,
        })
    }
}

impl<P> fmt::Debug for PolicyOrigin<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyOrigin")
            .field("revision", &self.revision)
            .field("policies", &self.policies.len())
            .finish()
    }
}
