//! Client tiers: per-identity threshold overrides.
//!
//! Whether a client is entitled to a higher limit is owned by whatever
//! holds the user records. The limiter only asks through [`TierLookup`].

use std::collections::HashMap;

use async_trait::async_trait;

use super::key::ClientIdentity;

/// The rate limit tier of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tier {
    /// Use the threshold of the matching rule
    #[default]
    Standard,
    /// Use this threshold instead of the rule's
    Elevated { threshold: u64 },
}

impl Tier {
    /// Apply the tier to a rule threshold.
    pub fn threshold(&self, rule_threshold: u64) -> u64 {
        match self {
            Tier::Standard => rule_threshold,
            Tier::Elevated { threshold } => *threshold,
        }
    }
}

/// Capability to look up the tier of a client.
///
/// Implementations handle their own failures and fall back to
/// [`Tier::Standard`].
#[async_trait]
pub trait TierLookup: Send + Sync {
    async fn tier_for(&self, identity: &ClientIdentity) -> Tier;
}

/// Every client is [`Tier::Standard`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardTier;

#[async_trait]
impl TierLookup for StandardTier {
    async fn tier_for(&self, _identity: &ClientIdentity) -> Tier {
        Tier::Standard
    }
}

/// A fixed table of elevated thresholds keyed by identity.
#[derive(Debug, Clone, Default)]
pub struct StaticTiers {
    thresholds: HashMap<String, u64>,
}

impl StaticTiers {
    pub fn new(thresholds: HashMap<String, u64>) -> Self {
        Self { thresholds }
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }
}

#[async_trait]
impl TierLookup for StaticTiers {
    async fn tier_for(&self, identity: &ClientIdentity) -> Tier {
        match self.thresholds.get(identity.as_str()) {
            Some(&threshold) => Tier::Elevated { threshold },
            None => Tier::Standard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_threshold() {
        assert_eq!(Tier::Standard.threshold(10), 10);
        assert_eq!(Tier::Elevated { threshold: 500 }.threshold(10), 500);
    }

    #[tokio::test]
    async fn test_static_tiers() {
        let tiers = StaticTiers::new(HashMap::from([("10.0.0.5".to_string(), 1000)]));

        assert_eq!(
            tiers.tier_for(&ClientIdentity::new("10.0.0.5")).await,
            Tier::Elevated { threshold: 1000 }
        );
        assert_eq!(
            tiers.tier_for(&ClientIdentity::new("10.0.0.6")).await,
            Tier::Standard
        );
    }
}
