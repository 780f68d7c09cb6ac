use crate::{Endpoint, RuleType};
use serde::Serialize;

/// A policy kind that can be stored in a rule handler and rendered for a
/// specific endpoint.
pub trait RulePolicy: Clone + PartialEq + Serialize + std::fmt::Debug + Send + Sync + 'static {
    const RULE_TYPE: RuleType;

    fn validate(&self) -> Result<(), InvalidPolicy>;

    /// Returns the form of this policy sent to `endpoint`, or `None` if the
    /// policy does not apply to it.
    fn to_client(&self, endpoint: &Endpoint) -> Option<Self>;
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidPolicy {
    #[error("policy {0:?} has no spec")]
    MissingSpec(String),
}

pub(crate) fn is_zero<T: Default + PartialEq>(v: &T) -> bool {
    *v == T::default()
}
