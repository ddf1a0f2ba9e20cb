//! Runtime registry - maps environment names to interchangeable backends
//! and picks one under a `RuntimePreference`.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{Backend, RuntimeCapabilities, RuntimePreference};

/// Registry of backends in registration order
pub struct RuntimeRegistry<T: ?Sized + Backend> {
    backends: Vec<Arc<T>>,
    by_environment: HashMap<String, Vec<usize>>,
}

impl<T: ?Sized + Backend> Default for RuntimeRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized + Backend> RuntimeRegistry<T> {
    /// Create a new empty registry
    pub fn new() -> Self {
        RuntimeRegistry {
            backends: Vec::new(),
            by_environment: HashMap::new(),
        }
    }

    /// Register a backend under every environment it supports
    pub fn register(&mut self, backend: Arc<T>) {
        let index = self.backends.len();
        for env in backend.supported_environments() {
            self.by_environment
                .entry(env.to_lowercase())
                .or_default()
                .push(index);
        }
        debug!("Registered backend '{}'", backend.name());
        self.backends.push(backend);
    }

    /// Get a backend by name
    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.backends.iter().find(|b| b.name() == name).cloned()
    }

    /// Whether any backend is registered for the environment
    pub fn supports(&self, environment: &str) -> bool {
        self.by_environment.contains_key(&environment.to_lowercase())
    }

    /// All known environment names, sorted
    pub fn environments(&self) -> Vec<String> {
        let mut envs: Vec<String> = self.by_environment.keys().cloned().collect();
        envs.sort();
        envs
    }

    /// All backends in registration order
    pub fn backends(&self) -> &[Arc<T>] {
        &self.backends
    }

    /// Backends registered for an environment, in registration order
    pub fn candidates(&self, environment: &str) -> Vec<Arc<T>> {
        self.by_environment
            .get(&environment.to_lowercase())
            .map(|indices| indices.iter().map(|i| self.backends[*i].clone()).collect())
            .unwrap_or_default()
    }

    /// Get backend count
    pub fn count(&self) -> usize {
        self.backends.len()
    }

    /// Select the best available backend for an environment.
    ///
    /// Returns `None` when the environment is unknown or when no candidate
    /// currently reports available; callers treat that as retryable.
    pub async fn select_best(&self, environment: &str, preference: RuntimePreference) -> Option<Arc<T>> {
        let mut available = Vec::new();
        for backend in self.candidates(environment) {
            if backend.is_available().await {
                available.push(backend);
            }
        }

        let capabilities: Vec<RuntimeCapabilities> =
            available.iter().map(|b| b.capabilities()).collect();
        let chosen = rank(&capabilities, preference)?;
        let backend = available.swap_remove(chosen);
        debug!(
            "Selected backend '{}' for {} ({})",
            backend.name(),
            environment,
            preference
        );
        Some(backend)
    }
}

/// Index of the best candidate; earlier candidates win ties.
pub fn rank(candidates: &[RuntimeCapabilities], preference: RuntimePreference) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }

    let scores: Vec<f64> = match preference {
        RuntimePreference::Speed => candidates
            .iter()
            .map(|c| -(c.startup_time_ms as f64))
            .collect(),
        RuntimePreference::Security => candidates
            .iter()
            .map(|c| c.isolation_level as f64)
            .collect(),
        RuntimePreference::Memory => candidates
            .iter()
            .map(|c| -(c.memory_overhead_mb as f64))
            .collect(),
        RuntimePreference::Balanced => balanced_scores(candidates),
    };

    let mut best = 0;
    for (i, score) in scores.iter().enumerate().skip(1) {
        if *score > scores[best] {
            best = i;
        }
    }
    Some(best)
}

/// `1000/(startup+1) + 1000/(memory+1) + isolation/2`, with each term
/// divided by its maximum across the candidates.
fn balanced_scores(candidates: &[RuntimeCapabilities]) -> Vec<f64> {
    let startup: Vec<f64> = candidates
        .iter()
        .map(|c| 1000.0 / (c.startup_time_ms as f64 + 1.0))
        .collect();
    let memory: Vec<f64> = candidates
        .iter()
        .map(|c| 1000.0 / (c.memory_overhead_mb as f64 + 1.0))
        .collect();
    let isolation: Vec<f64> = candidates
        .iter()
        .map(|c| c.isolation_level as f64 / 2.0)
        .collect();

    let normalize = |values: &[f64], i: usize| {
        let max = values.iter().cloned().fold(0.0_f64, f64::max);
        if max > 0.0 {
            values[i] / max
        } else {
            0.0
        }
    };

    (0..candidates.len())
        .map(|i| normalize(&startup, i) + normalize(&memory, i) + normalize(&isolation, i))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn caps(startup: u64, memory: u64, isolation: u32) -> RuntimeCapabilities {
        RuntimeCapabilities {
            startup_time_ms: startup,
            memory_overhead_mb: memory,
            isolation_level: isolation,
            supports_filesystem_persistence: false,
            supports_network_access: false,
            max_concurrent_executions: 4,
        }
    }

    struct FakeBackend {
        name: String,
        envs: Vec<String>,
        available: bool,
        caps: RuntimeCapabilities,
    }

    impl FakeBackend {
        fn new(name: &str, envs: &[&str], available: bool, caps: RuntimeCapabilities) -> Arc<dyn Backend> {
            Arc::new(FakeBackend {
                name: name.to_string(),
                envs: envs.iter().map(|s| s.to_string()).collect(),
                available,
                caps,
            })
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        fn name(&self) -> &str {
            &self.name
        }

        fn supported_environments(&self) -> Vec<String> {
            self.envs.clone()
        }

        async fn is_available(&self) -> bool {
            self.available
        }

        fn capabilities(&self) -> RuntimeCapabilities {
            self.caps.clone()
        }
    }

    #[test]
    fn test_speed_picks_lowest_startup_regardless_of_order() {
        let fast = caps(50, 100, 5);
        let slow = caps(900, 100, 5);

        assert_eq!(rank(&[fast.clone(), slow.clone()], RuntimePreference::Speed), Some(0));
        assert_eq!(rank(&[slow, fast], RuntimePreference::Speed), Some(1));
    }

    #[test]
    fn test_security_and_memory_preferences() {
        let candidates = [caps(10, 30, 2), caps(1500, 200, 8), caps(100, 10, 4)];
        assert_eq!(rank(&candidates, RuntimePreference::Security), Some(1));
        assert_eq!(rank(&candidates, RuntimePreference::Memory), Some(2));
    }

    #[test]
    fn test_ties_go_to_first_registered() {
        let same = caps(100, 100, 5);
        let candidates = [same.clone(), same.clone(), same];
        for pref in [
            RuntimePreference::Speed,
            RuntimePreference::Security,
            RuntimePreference::Memory,
            RuntimePreference::Balanced,
        ] {
            assert_eq!(rank(&candidates, pref), Some(0));
        }
    }

    #[test]
    fn test_balanced_is_not_dominated_by_one_dimension() {
        // Raw startup term alone would make the first candidate win by a mile.
        let tiny_but_weak = caps(0, 500, 0);
        let all_rounder = caps(20, 20, 10);
        assert_eq!(
            rank(&[tiny_but_weak, all_rounder], RuntimePreference::Balanced),
            Some(1)
        );
    }

    #[test]
    fn test_rank_empty() {
        assert_eq!(rank(&[], RuntimePreference::Balanced), None);
    }

    #[tokio::test]
    async fn test_select_best_skips_unavailable() {
        let mut registry: RuntimeRegistry<dyn Backend> = RuntimeRegistry::new();
        registry.register(FakeBackend::new("docker", &["python"], false, caps(10, 10, 9)));
        registry.register(FakeBackend::new("native", &["python", "bash"], true, caps(500, 500, 1)));

        let chosen = registry
            .select_best("Python", RuntimePreference::Security)
            .await
            .unwrap();
        assert_eq!(chosen.name(), "native");
    }

    #[tokio::test]
    async fn test_select_best_unknown_or_unavailable() {
        let mut registry: RuntimeRegistry<dyn Backend> = RuntimeRegistry::new();
        registry.register(FakeBackend::new("docker", &["python"], false, caps(10, 10, 9)));

        assert!(registry.select_best("cobol", RuntimePreference::Speed).await.is_none());
        assert!(registry.select_best("python", RuntimePreference::Speed).await.is_none());
        assert!(registry.supports("python"));
        assert!(!registry.supports("cobol"));
        assert_eq!(registry.environments(), vec!["python".to_string()]);
        assert!(registry.get("docker").is_some());
    }
}
