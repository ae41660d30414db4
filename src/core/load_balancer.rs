//! Upstream selection strategies.
//!
//! Every runtime virtual host owns exactly one strategy instance, built by
//! [`LoadBalancerFactory`] when the configuration is loaded. Strategies are
//! shared by all request tasks of that virtual host, so any state they keep
//! lives behind atomics or a mutex.
use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use sha1::{Digest, Sha1};

use crate::config::{LoadBalanceStrategy, UpstreamConfig};

/// Trait defining the interface for load balancing strategies
pub trait LoadBalancingStrategy: Send + Sync + 'static {
    /// Select one upstream from the ordered candidate list.
    ///
    /// `key` is only consulted by key based strategies. Returns `None` only
    /// when `upstreams` is empty.
    fn select<'a>(
        &self,
        upstreams: &'a [UpstreamConfig],
        key: Option<&str>,
    ) -> Option<&'a UpstreamConfig>;

    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Create a new instance of this strategy as a boxed trait object
    fn boxed(self) -> Box<dyn LoadBalancingStrategy>
    where
        Self: Sized,
    {
        Box::new(self)
    }
}

/// Round-robin load balancing strategy
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinStrategy {
    /// Create a new round-robin strategy
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select<'a>(
        &self,
        upstreams: &'a [UpstreamConfig],
        _key: Option<&str>,
    ) -> Option<&'a UpstreamConfig> {
        if upstreams.is_empty() {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        upstreams.get(count % upstreams.len())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Smooth weighted round robin.
///
/// On each call every upstream's current weight grows by its configured
/// weight, the largest current weight wins (lowest index on ties) and the
/// winner is pushed back by the total weight. Over any window of
/// `sum(weights)` calls each upstream is picked exactly `weight` times.
pub struct WeightedRoundRobinStrategy {
    current: Mutex<Vec<i64>>,
}

impl Default for WeightedRoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WeightedRoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of the current-weight counters (diagnostics and tests).
    pub fn current_weights(&self) -> Vec<i64> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LoadBalancingStrategy for WeightedRoundRobinStrategy {
    fn select<'a>(
        &self,
        upstreams: &'a [UpstreamConfig],
        _key: Option<&str>,
    ) -> Option<&'a UpstreamConfig> {
        if upstreams.is_empty() {
            return None;
        }

        let mut current = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if current.len() != upstreams.len() {
            current.clear();
            current.resize(upstreams.len(), 0);
        }

        let mut total: i64 = 0;
        let mut best = 0usize;
        for (index, upstream) in upstreams.iter().enumerate() {
            let weight = i64::from(upstream.weight);
            current[index] += weight;
            total += weight;
            if current[index] > current[best] {
                best = index;
            }
        }

        // All-zero weights are rejected at load time; if they slip through the
        // counters stay at zero and the first upstream wins every time.
        current[best] -= total;
        upstreams.get(best)
    }

    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }
}

/// Digest based selection: stable for a fixed key and candidate list.
pub struct HashStrategy;

impl Default for HashStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl HashStrategy {
    pub fn new() -> Self {
        Self
    }

    /// Index picked for `key` among `len` candidates.
    ///
    /// The first four digest bytes are read as a big-endian `u32` and reduced
    /// modulo `len`.
    pub fn index_for(key: &str, len: usize) -> usize {
        let digest = Sha1::digest(key.as_bytes());
        let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        prefix as usize % len
    }
}

impl LoadBalancingStrategy for HashStrategy {
    fn select<'a>(
        &self,
        upstreams: &'a [UpstreamConfig],
        key: Option<&str>,
    ) -> Option<&'a UpstreamConfig> {
        if upstreams.is_empty() {
            return None;
        }
        let index = Self::index_for(key.unwrap_or_default(), upstreams.len());
        upstreams.get(index)
    }

    fn name(&self) -> &'static str {
        "hash"
    }
}

/// Factory for creating load balancing strategies from configuration
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    /// Create a new load balancing strategy based on configuration
    pub fn create_strategy(strategy: &LoadBalanceStrategy) -> Box<dyn LoadBalancingStrategy> {
        match strategy {
            LoadBalanceStrategy::RoundRobin => RoundRobinStrategy::new().boxed(),
            LoadBalanceStrategy::WeightedRoundRobin => WeightedRoundRobinStrategy::new().boxed(),
            LoadBalanceStrategy::Hash => HashStrategy::new().boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc, thread};

    use super::*;

    fn upstreams(weights: &[u32]) -> Vec<UpstreamConfig> {
        weights
            .iter()
            .enumerate()
            .map(|(i, w)| UpstreamConfig::new(format!("test{}", i + 1), 8080).with_weight(*w))
            .collect()
    }

    fn tally(
        strategy: &dyn LoadBalancingStrategy,
        targets: &[UpstreamConfig],
        calls: usize,
    ) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for _ in 0..calls {
            let picked = strategy.select(targets, None).unwrap();
            *counts.entry(picked.host.clone()).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_round_robin_strategy() {
        let strategy = RoundRobinStrategy::new();
        let targets = upstreams(&[1, 1, 1]);

        assert_eq!(strategy.select(&targets, None).unwrap().host, "test1");
        assert_eq!(strategy.select(&targets, None).unwrap().host, "test2");
        assert_eq!(strategy.select(&targets, None).unwrap().host, "test3");
        // Wraps around
        assert_eq!(strategy.select(&targets, None).unwrap().host, "test1");
    }

    #[test]
    fn test_round_robin_visits_every_candidate_before_repeating() {
        for n in 1..=7 {
            let strategy = RoundRobinStrategy::new();
            let targets = upstreams(&vec![1; n]);
            let mut seen: Vec<String> = (0..n)
                .map(|_| strategy.select(&targets, None).unwrap().host.clone())
                .collect();
            seen.sort();
            seen.dedup();
            assert_eq!(seen.len(), n);
        }
    }

    #[test]
    fn test_round_robin_empty_targets() {
        let strategy = RoundRobinStrategy::new();
        assert!(strategy.select(&[], None).is_none());
    }

    #[test]
    fn test_weighted_round_robin_distribution() {
        let strategy = WeightedRoundRobinStrategy::new();
        let targets = upstreams(&[4, 3, 1]);

        let counts = tally(&strategy, &targets, 800);
        assert_eq!(counts["test1"], 400);
        assert_eq!(counts["test2"], 300);
        assert_eq!(counts["test3"], 100);
    }

    #[test]
    fn test_weighted_round_robin_every_window_is_exact() {
        let weights = [5u32, 1, 2, 3];
        let strategy = WeightedRoundRobinStrategy::new();
        let targets = upstreams(&weights);
        let window: u32 = weights.iter().sum();

        for _ in 0..10 {
            let counts = tally(&strategy, &targets, window as usize);
            for (i, w) in weights.iter().enumerate() {
                assert_eq!(counts.get(&format!("test{}", i + 1)).copied().unwrap_or(0), *w as usize);
            }
        }
        // A full window brings every counter back to zero
        assert!(strategy.current_weights().iter().all(|w| *w == 0));
    }

    #[test]
    fn test_weighted_round_robin_is_smooth() {
        let strategy = WeightedRoundRobinStrategy::new();
        let targets = upstreams(&[5, 1, 1]);

        let order: Vec<String> = (0..7)
            .map(|_| strategy.select(&targets, None).unwrap().host.clone())
            .collect();
        assert_eq!(
            order,
            vec!["test1", "test1", "test2", "test1", "test3", "test1", "test1"]
        );
    }

    #[test]
    fn test_weighted_round_robin_skips_zero_weight() {
        let strategy = WeightedRoundRobinStrategy::new();
        let targets = upstreams(&[2, 0, 1]);

        let counts = tally(&strategy, &targets, 30);
        assert_eq!(counts["test1"], 20);
        assert_eq!(counts.get("test2"), None);
        assert_eq!(counts["test3"], 10);
    }

    #[test]
    fn test_weighted_round_robin_concurrent_callers() {
        let strategy = Arc::new(WeightedRoundRobinStrategy::new());
        let targets = Arc::new(upstreams(&[4, 3, 1]));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let strategy = strategy.clone();
                let targets = targets.clone();
                thread::spawn(move || {
                    let mut local = HashMap::new();
                    for _ in 0..1000 {
                        let picked = strategy.select(&targets, None).unwrap();
                        *local.entry(picked.host.clone()).or_insert(0usize) += 1;
                    }
                    local
                })
            })
            .collect();

        let mut totals: HashMap<String, usize> = HashMap::new();
        for handle in handles {
            for (host, count) in handle.join().unwrap() {
                *totals.entry(host).or_insert(0) += count;
            }
        }

        // 8000 calls = 1000 full windows of 8
        assert_eq!(totals["test1"], 4000);
        assert_eq!(totals["test2"], 3000);
        assert_eq!(totals["test3"], 1000);
    }

    #[test]
    fn test_hash_strategy_is_deterministic() {
        let strategy = HashStrategy::new();
        let targets = upstreams(&[1, 1, 1, 1]);

        let first = strategy.select(&targets, Some("203.0.113.9")).unwrap();
        for _ in 0..10 {
            assert_eq!(strategy.select(&targets, Some("203.0.113.9")).unwrap(), first);
        }
    }

    #[test]
    fn test_hash_strategy_follows_modulo_reduction() {
        let strategy = HashStrategy::new();
        for key in ["10.0.0.1", "/api/users", "client-42", ""] {
            let digest = Sha1::digest(key.as_bytes());
            let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize;
            for n in 1..=6 {
                let targets = upstreams(&vec![1; n]);
                let picked = strategy.select(&targets, Some(key)).unwrap();
                assert_eq!(picked.host, format!("test{}", prefix % n + 1));
            }
        }
    }

    #[test]
    fn test_hash_strategy_spreads_keys() {
        let strategy = HashStrategy::new();
        let targets = upstreams(&[1, 1, 1]);
        let mut seen = std::collections::HashSet::new();
        for i in 0..100 {
            let key = format!("192.168.0.{i}");
            seen.insert(strategy.select(&targets, Some(&key)).unwrap().host.clone());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_load_balancer_factory() {
        let targets = upstreams(&[1, 1]);

        for kind in [
            LoadBalanceStrategy::RoundRobin,
            LoadBalanceStrategy::WeightedRoundRobin,
            LoadBalanceStrategy::Hash,
        ] {
            let strategy = LoadBalancerFactory::create_strategy(&kind);
            assert!(strategy.select(&targets, Some("key")).is_some());
            assert!(strategy.select(&[], Some("key")).is_none());
        }

        assert_eq!(
            LoadBalancerFactory::create_strategy(&LoadBalanceStrategy::Hash).name(),
            "hash"
        );
    }
}
