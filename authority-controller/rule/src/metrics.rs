use dubbo_authority_core::RuleType;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct RegistryMetrics {
    connections: Gauge,
    pushes: Family<Labels, Counter>,
    push_timeouts: Family<Labels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct Labels {
    rule_type: &'static str,
}

// === impl RegistryMetrics ===

impl RegistryMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let connections = Gauge::default();
        reg.register(
            "connections",
            "The number of live rule observation streams",
            connections.clone(),
        );

        let pushes = Family::<Labels, Counter>::default();
        reg.register(
            "pushes",
            "Total number of rule pushes sent to clients",
            pushes.clone(),
        );

        let push_timeouts = Family::<Labels, Counter>::default();
        reg.register(
            "push_timeouts",
            "Total number of rule pushes that were not acknowledged in time",
            push_timeouts.clone(),
        );

        Self {
            connections,
            pushes,
            push_timeouts,
        }
    }

    pub(crate) fn connected(&self) {
        self.connections.inc();
    }

    pub(crate) fn disconnected(&self) {
        self.connections.dec();
    }

    pub(crate) fn pushed(&self, rule_type: RuleType) {
        self.pushes.get_or_create(&Labels::from(rule_type)).inc();
    }

    pub(crate) fn push_timed_out(&self, rule_type: RuleType) {
        self.push_timeouts.get_or_create(&Labels::from(rule_type)).inc();
    }

    #[cfg(test)]
    pub(crate) fn live_connections(&self) -> i64 {
        self.connections.get()
    }

    #[cfg(test)]
    pub(crate) fn push_timeouts(&self, rule_type: RuleType) -> u64 {
        self.push_timeouts.get_or_create(&Labels::from(rule_type)).get()
    }
}

impl From<RuleType> for Labels {
    fn from(rule_type: RuleType) -> Self {
        Self {
            rule_type: rule_type.as_str(),
        }
    }
}
