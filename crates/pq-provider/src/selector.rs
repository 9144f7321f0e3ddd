//! Provider registry and selection strategies.
//!
//! Providers keep their registration order, which breaks every tie:
//! equal weights, equal estimated costs and the stable failover sort.

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::GenerationError;
use crate::provider::{GenerationProvider, ProviderDescriptor, ProviderId};
use crate::Result;

/// Width and height used when comparing provider prices.
const COST_PROBE_SIZE: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    #[default]
    HighestPriority,
    Failover,
    LowestCost,
    RoundRobin,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::HighestPriority => "highest-priority",
            SelectionStrategy::Failover => "failover",
            SelectionStrategy::LowestCost => "lowest-cost",
            SelectionStrategy::RoundRobin => "round-robin",
        }
    }
}

impl FromStr for SelectionStrategy {
    type Err = GenerationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "highest-priority" | "priority" => Ok(SelectionStrategy::HighestPriority),
            "failover" => Ok(SelectionStrategy::Failover),
            "lowest-cost" | "cost" => Ok(SelectionStrategy::LowestCost),
            "round-robin" => Ok(SelectionStrategy::RoundRobin),
            other => Err(GenerationError::Validation(format!("unknown selection strategy {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SelectionOptions {
    /// Falls back to the selector's default strategy.
    pub strategy: Option<SelectionStrategy>,
    pub model: Option<String>,
    pub exclude: Vec<ProviderId>,
}

impl SelectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn exclude(mut self, id: ProviderId) -> Self {
        self.exclude.push(id);
        self
    }
}

#[derive(Clone)]
pub struct RegisteredProvider {
    pub descriptor: ProviderDescriptor,
    pub client: Arc<dyn GenerationProvider>,
}

impl RegisteredProvider {
    pub fn id(&self) -> &ProviderId {
        &self.descriptor.id
    }
}

pub struct ProviderSelector {
    providers: Vec<RegisteredProvider>,
    default_strategy: SelectionStrategy,
    default_model: Option<String>,
    round_robin: AtomicUsize,
}

impl Default for ProviderSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderSelector {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            default_strategy: SelectionStrategy::default(),
            default_model: None,
            round_robin: AtomicUsize::new(0),
        }
    }

    pub fn with_default_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Model used by cost-based selection when the caller names none.
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    /// Add a provider. Ids must be unique.
    pub fn register(&mut self, descriptor: ProviderDescriptor, client: Arc<dyn GenerationProvider>) -> Result<()> {
        if self.providers.iter().any(|p| p.descriptor.id == descriptor.id) {
            return Err(GenerationError::Validation(format!(
                "provider {} is already registered",
                descriptor.id
            )));
        }
        debug!(provider = %descriptor.id, weight = descriptor.priority_weight, "Provider registered");
        self.providers.push(RegisteredProvider { descriptor, client });
        Ok(())
    }

    pub fn get(&self, id: &ProviderId) -> Result<&RegisteredProvider> {
        self.providers
            .iter()
            .find(|p| &p.descriptor.id == id)
            .ok_or_else(|| GenerationError::ProviderNotFound(id.to_string()))
    }

    pub fn providers(&self) -> &[RegisteredProvider] {
        &self.providers
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Unknown providers support nothing.
    pub fn is_model_supported(&self, id: &ProviderId, model: &str) -> bool {
        self.get(id)
            .map(|p| p.descriptor.supports_model(model))
            .unwrap_or(false)
    }

    /// Every registered provider that serves `model`, enabled or not.
    pub fn get_providers_for_model(&self, model: &str) -> Vec<&RegisteredProvider> {
        self.providers
            .iter()
            .filter(|p| p.descriptor.supports_model(model))
            .collect()
    }

    fn eligible(&self, model: Option<&str>, exclude: &[ProviderId]) -> Vec<&RegisteredProvider> {
        self.providers
            .iter()
            .filter(|p| p.descriptor.enabled)
            .filter(|p| !exclude.contains(&p.descriptor.id))
            .filter(|p| model.map_or(true, |m| p.descriptor.supports_model(m)))
            .collect()
    }

    /// Pick one provider with the requested strategy.
    pub fn select_provider(&self, options: &SelectionOptions) -> Result<&RegisteredProvider> {
        let strategy = options.strategy.unwrap_or(self.default_strategy);

        let selected = match strategy {
            SelectionStrategy::HighestPriority | SelectionStrategy::Failover => {
                let candidates = self.eligible(options.model.as_deref(), &options.exclude);
                highest_weight(&candidates)
            }
            SelectionStrategy::LowestCost => {
                let model = options
                    .model
                    .as_deref()
                    .or(self.default_model.as_deref())
                    .ok_or_else(|| {
                        GenerationError::Validation("lowest-cost selection requires a model".to_string())
                    })?;
                let candidates = self.eligible(Some(model), &options.exclude);
                cheapest(&candidates, model)
            }
            SelectionStrategy::RoundRobin => {
                let candidates = self.eligible(options.model.as_deref(), &options.exclude);
                if candidates.is_empty() {
                    None
                } else {
                    let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % candidates.len();
                    Some(candidates[index])
                }
            }
        };

        let provider = selected.ok_or(GenerationError::NoProvidersAvailable)?;
        debug!(provider = %provider.id(), strategy = strategy.as_str(), "Provider selected");
        Ok(provider)
    }

    /// Eligible providers by descending weight, registration order on ties.
    pub fn get_failover_order(&self, options: &SelectionOptions) -> Vec<&RegisteredProvider> {
        let mut order = self.eligible(options.model.as_deref(), &options.exclude);
        order.sort_by(|a, b| b.descriptor.priority_weight.cmp(&a.descriptor.priority_weight));
        order
    }

    /// The strategy's pick first, then the remaining failover order.
    /// Empty when nothing is eligible.
    pub fn get_dispatch_order(&self, options: &SelectionOptions) -> Result<Vec<&RegisteredProvider>> {
        let first = match self.select_provider(options) {
            Ok(provider) => provider,
            Err(GenerationError::NoProvidersAvailable) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut order = vec![first];
        order.extend(
            self.get_failover_order(options)
                .into_iter()
                .filter(|p| p.id() != first.id()),
        );
        Ok(order)
    }
}

fn highest_weight<'a>(candidates: &[&'a RegisteredProvider]) -> Option<&'a RegisteredProvider> {
    let mut best: Option<&'a RegisteredProvider> = None;
    for candidate in candidates {
        match best {
            Some(current) if candidate.descriptor.priority_weight <= current.descriptor.priority_weight => {}
            _ => best = Some(*candidate),
        }
    }
    best
}

fn cheapest<'a>(candidates: &[&'a RegisteredProvider], model: &str) -> Option<&'a RegisteredProvider> {
    let mut best: Option<(&'a RegisteredProvider, f64)> = None;
    for candidate in candidates {
        let cost = candidate
            .client
            .estimate_cost(model, COST_PROBE_SIZE, COST_PROBE_SIZE, 1);
        let cost = if cost.is_nan() { f64::INFINITY } else { cost };
        match best {
            Some((_, current)) if cost >= current => {}
            _ => best = Some((*candidate, cost)),
        }
    }
    best.map(|(provider, _)| provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::ProviderJobStatus;
    use async_trait::async_trait;
    use pq_common::{GenerationRequest, GenerationResult};

    struct PricedProvider(f64);

    #[async_trait]
    impl GenerationProvider for PricedProvider {
        async fn is_available(&self) -> std::result::Result<bool, ProviderError> {
            Ok(true)
        }

        async fn generate(&self, _request: &GenerationRequest) -> std::result::Result<GenerationResult, ProviderError> {
            Err(ProviderError::Connection("not used".into()))
        }

        async fn poll_job(&self, _job_id: &str) -> std::result::Result<ProviderJobStatus, ProviderError> {
            Ok(ProviderJobStatus::Queued)
        }

        fn estimate_cost(&self, _model: &str, _width: u32, _height: u32, count: u32) -> f64 {
            self.0 * count as f64
        }
    }

    fn descriptor(id: &str, weight: u32, models: &[&str]) -> ProviderDescriptor {
        ProviderDescriptor::new(ProviderId::new(id).unwrap(), weight, models.iter().copied()).unwrap()
    }

    fn selector(entries: &[(&str, u32, f64)]) -> ProviderSelector {
        let mut selector = ProviderSelector::new();
        for (id, weight, price) in entries {
            selector
                .register(descriptor(id, *weight, &["*"]), Arc::new(PricedProvider(*price)))
                .unwrap();
        }
        selector
    }

    fn ids(providers: &[&RegisteredProvider]) -> Vec<String> {
        providers.iter().map(|p| p.id().to_string()).collect()
    }

    #[test]
    fn test_highest_weight_wins() {
        let s = selector(&[("a", 1, 0.0), ("b", 2, 0.0), ("c", 3, 0.0)]);
        let chosen = s.select_provider(&SelectionOptions::new()).unwrap();
        assert_eq!(chosen.id().as_str(), "c");
    }

    #[test]
    fn test_weight_ties_keep_registration_order() {
        let s = selector(&[("a", 2, 0.0), ("b", 2, 0.0), ("c", 1, 0.0)]);
        let chosen = s.select_provider(&SelectionOptions::new()).unwrap();
        assert_eq!(chosen.id().as_str(), "a");
        assert_eq!(ids(&s.get_failover_order(&SelectionOptions::new())), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_failover_order_descending_weight() {
        let s = selector(&[("a", 1, 0.0), ("b", 2, 0.0), ("c", 3, 0.0)]);
        assert_eq!(ids(&s.get_failover_order(&SelectionOptions::new())), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_disabled_and_excluded_are_skipped() {
        let mut s = selector(&[("a", 1, 0.0), ("b", 2, 0.0)]);
        s.register(descriptor("c", 5, &["*"]).disabled(), Arc::new(PricedProvider(0.0)))
            .unwrap();

        let options = SelectionOptions::new().exclude(ProviderId::new("b").unwrap());
        assert_eq!(ids(&s.get_failover_order(&options)), vec!["a"]);
    }

    #[test]
    fn test_model_filter() {
        let mut s = ProviderSelector::new();
        s.register(descriptor("sdxl-only", 9, &["sdxl"]), Arc::new(PricedProvider(0.0)))
            .unwrap();
        s.register(descriptor("any", 1, &["*"]), Arc::new(PricedProvider(0.0)))
            .unwrap();

        let chosen = s.select_provider(&SelectionOptions::new().model("flux")).unwrap();
        assert_eq!(chosen.id().as_str(), "any");
        assert_eq!(s.get_providers_for_model("sdxl").len(), 2);
        assert_eq!(s.get_providers_for_model("flux").len(), 1);
        assert!(s.is_model_supported(&ProviderId::new("any").unwrap(), "whatever"));
        assert!(!s.is_model_supported(&ProviderId::new("missing").unwrap(), "sdxl"));
    }

    #[test]
    fn test_lowest_cost() {
        let s = selector(&[("a", 3, 0.05), ("b", 1, 0.01), ("c", 2, 0.01)]);
        let options = SelectionOptions::new().strategy(SelectionStrategy::LowestCost).model("sdxl");
        assert_eq!(s.select_provider(&options).unwrap().id().as_str(), "b");
    }

    #[test]
    fn test_lowest_cost_needs_a_model() {
        let s = selector(&[("a", 1, 0.05)]);
        let options = SelectionOptions::new().strategy(SelectionStrategy::LowestCost);
        assert!(matches!(s.select_provider(&options), Err(GenerationError::Validation(_))));

        let s = s.with_default_model("sdxl");
        assert_eq!(s.select_provider(&options).unwrap().id().as_str(), "a");
    }

    #[test]
    fn test_round_robin_visits_each_provider_once() {
        let s = selector(&[("a", 1, 0.0), ("b", 2, 0.0), ("c", 3, 0.0)]);
        let options = SelectionOptions::new().strategy(SelectionStrategy::RoundRobin);

        let mut seen: Vec<String> = (0..3)
            .map(|_| s.select_provider(&options).unwrap().id().to_string())
            .collect();
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_dispatch_order_starts_with_strategy_pick() {
        let s = selector(&[("premium", 9, 5.0), ("budget", 1, 0.01), ("mid", 5, 0.5)]);

        let options = SelectionOptions::new().strategy(SelectionStrategy::LowestCost).model("sdxl");
        assert_eq!(ids(&s.get_dispatch_order(&options).unwrap()), vec!["budget", "premium", "mid"]);

        let s = s.with_default_strategy(SelectionStrategy::LowestCost);
        let options = SelectionOptions::new().model("sdxl");
        assert_eq!(ids(&s.get_dispatch_order(&options).unwrap()), vec!["budget", "premium", "mid"]);

        let options = SelectionOptions::new().strategy(SelectionStrategy::HighestPriority);
        assert_eq!(
            ids(&s.get_dispatch_order(&options).unwrap()),
            ids(&s.get_failover_order(&options))
        );
    }

    #[test]
    fn test_dispatch_order_rotates_with_round_robin() {
        let s = selector(&[("a", 1, 0.0), ("b", 2, 0.0), ("c", 3, 0.0)]);
        let options = SelectionOptions::new().strategy(SelectionStrategy::RoundRobin);

        let mut firsts = Vec::new();
        for _ in 0..3 {
            let order = s.get_dispatch_order(&options).unwrap();
            assert_eq!(order.len(), 3);
            firsts.push(order[0].id().to_string());
        }
        firsts.sort();
        assert_eq!(firsts, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_dispatch_order_empty_and_invalid() {
        let s = ProviderSelector::new();
        assert!(s.get_dispatch_order(&SelectionOptions::new()).unwrap().is_empty());

        let s = selector(&[("a", 1, 0.05)]);
        let options = SelectionOptions::new().strategy(SelectionStrategy::LowestCost);
        assert!(matches!(s.get_dispatch_order(&options), Err(GenerationError::Validation(_))));
    }

    #[test]
    fn test_empty_registry() {
        let s = ProviderSelector::new();
        assert!(matches!(
            s.select_provider(&SelectionOptions::new()),
            Err(GenerationError::NoProvidersAvailable)
        ));
        assert!(s.get_failover_order(&SelectionOptions::new()).is_empty());
    }

    #[test]
    fn test_unknown_provider_is_an_error() {
        let s = selector(&[("a", 1, 0.0)]);
        let missing = ProviderId::new("nope").unwrap();
        assert!(matches!(s.get(&missing), Err(GenerationError::ProviderNotFound(id)) if id == "nope"));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut s = selector(&[("a", 1, 0.0)]);
        let err = s.register(descriptor("a", 2, &["*"]), Arc::new(PricedProvider(0.0)));
        assert!(err.is_err());
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("round_robin".parse::<SelectionStrategy>().unwrap(), SelectionStrategy::RoundRobin);
        assert_eq!("Lowest-Cost".parse::<SelectionStrategy>().unwrap(), SelectionStrategy::LowestCost);
        assert!("random".parse::<SelectionStrategy>().is_err());
    }
}
