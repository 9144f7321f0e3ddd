//! Subscription tier to priority mapping.

use std::collections::HashMap;

use pq_common::PriorityLevel;

const BUILTIN_TIERS: &[(&str, PriorityLevel)] = &[
    ("enterprise", PriorityLevel::Critical),
    ("business", PriorityLevel::High),
    ("professional", PriorityLevel::Normal),
    ("starter", PriorityLevel::Normal),
    ("gift", PriorityLevel::Low),
    ("free", PriorityLevel::Background),
];

/// Case-insensitive tier lookup. Unknown tiers map to `Normal`.
#[derive(Debug, Clone)]
pub struct PriorityMapper {
    tiers: HashMap<String, PriorityLevel>,
}

impl PriorityMapper {
    pub fn new() -> Self {
        Self {
            tiers: BUILTIN_TIERS
                .iter()
                .map(|(tier, level)| (tier.to_string(), *level))
                .collect(),
        }
    }

    /// Built-in tiers plus configured ones; configured entries win.
    pub fn with_tiers(extra: &HashMap<String, PriorityLevel>) -> Self {
        let mut mapper = Self::new();
        for (tier, level) in extra {
            mapper.insert_tier(tier, *level);
        }
        mapper
    }

    pub fn insert_tier(&mut self, tier: &str, level: PriorityLevel) {
        self.tiers.insert(normalize(tier), level);
    }

    pub fn get_tier_priority(&self, tier: &str) -> PriorityLevel {
        self.tiers.get(&normalize(tier)).copied().unwrap_or_default()
    }
}

impl Default for PriorityMapper {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(tier: &str) -> String {
    tier.trim().to_ascii_lowercase()
}
