use std::{fmt, str::FromStr};

/// The kinds of rules distributed to workloads.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuleType {
    Authentication,
    Authorization,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unsupported rule type: {0}")]
pub struct UnknownRuleType(pub String);

// === impl RuleType ===

impl RuleType {
    pub const ALL: [RuleType; 2] = [RuleType::Authentication, RuleType::Authorization];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication/v1beta1",
            Self::Authorization => "authorization/v1beta1",
        }
    }
}

impl FromStr for RuleType {
    type Err = UnknownRuleType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownRuleType(s.to_string()))
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
