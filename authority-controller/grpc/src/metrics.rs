use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Counts certificate issuance outcomes.
#[derive(Clone, Debug, Default)]
pub struct AuthorityMetrics {
    issued: Family<Labels, Counter>,
    failed: Family<FailureLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct Labels {
    grpc_method: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct FailureLabels {
    grpc_method: &'static str,
    reason: &'static str,
}

/// Why a certificate was not issued.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Failure {
    InvalidCsr,
    Unauthenticated,
    NoAuthority,
    Signing,
}

// === impl AuthorityMetrics ===

impl AuthorityMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let issued = Family::<Labels, Counter>::default();
        reg.register(
            "issued",
            "Total number of workload certificates issued",
            issued.clone(),
        );

        let failed = Family::<FailureLabels, Counter>::default();
        reg.register(
            "failed",
            "Total number of certificate requests that were refused",
            failed.clone(),
        );

        Self { issued, failed }
    }

    pub(crate) fn issued(&self, grpc_method: &'static str) {
        self.issued.get_or_create(&Labels { grpc_method }).inc();
    }

    pub(crate) fn failed(&self, grpc_method: &'static str, failure: Failure) {
        self.failed
            .get_or_create(&FailureLabels {
                grpc_method,
                reason: failure.as_str(),
            })
            .inc();
    }

    #[cfg(test)]
    pub(crate) fn issued_count(&self, grpc_method: &'static str) -> u64 {
        self.issued.get_or_create(&Labels { grpc_method }).get()
    }

    #[cfg(test)]
    pub(crate) fn failed_count(&self, grpc_method: &'static str, failure: Failure) -> u64 {
        self.failed
            .get_or_create(&FailureLabels {
                grpc_method,
                reason: failure.as_str(),
            })
            .get()
    }
}

// === impl Failure ===

impl Failure {
    fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidCsr => "invalid_csr",
            Self::Unauthenticated => "unauthenticated",
            Self::NoAuthority => "no_authority",
            Self::Signing => "signing",
        }
    }
}
