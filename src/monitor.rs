//! Resource monitoring for live sandboxes
//!
//! Samples usage through the owning `SandboxProvider`, keeps a bounded ring
//! of recent samples per sandbox, and classifies threshold breaches.
//!
//! Checks run in a fixed priority order and only the first triggered
//! violation is reported:
//! 1. memory hard limit
//! 2. memory warning
//! 3. CPU quota
//! 4. disk quota
//! 5. process count

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::MonitorConfig;
use crate::error::{Error, Result};
use crate::runtime::RuntimeRegistry;
use crate::session::{SandboxHandle, SandboxProvider};

/// Point-in-time resource sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub memory_usage_bytes: u64,
    pub cpu_usage_percent: f64,
    pub disk_usage_bytes: u64,
    pub process_count: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub timestamp: DateTime<Utc>,
}

impl Default for ResourceUsage {
    fn default() -> Self {
        ResourceUsage {
            memory_usage_bytes: 0,
            cpu_usage_percent: 0.0,
            disk_usage_bytes: 0,
            process_count: 0,
            network_rx_bytes: 0,
            network_tx_bytes: 0,
            timestamp: Utc::now(),
        }
    }
}

/// Thresholds a sandbox is checked against. A zero limit disables its check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub memory_limit_bytes: u64,
    pub memory_warning_bytes: u64,
    pub cpu_quota_percent: f64,
    pub disk_limit_bytes: u64,
    pub max_processes: u64,
}

impl ResourceLimits {
    /// Limits for a sandbox with the given memory ceiling
    pub fn from_config(config: &MonitorConfig, memory_limit_mb: u64) -> Self {
        let memory_limit_bytes = memory_limit_mb * 1024 * 1024;
        ResourceLimits {
            memory_limit_bytes,
            memory_warning_bytes: (memory_limit_bytes as f64 * config.memory_warning_ratio) as u64,
            cpu_quota_percent: config.cpu_quota_percent,
            disk_limit_bytes: config.disk_limit_mb * 1024 * 1024,
            max_processes: config.max_processes,
        }
    }
}

/// Kind of breached threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    MemoryLimit,
    MemoryWarning,
    CpuQuota,
    DiskQuota,
    ProcessCount,
}

impl ViolationType {
    /// Whether the breach risks host stability and the sandbox should go
    pub fn terminates(&self) -> bool {
        matches!(
            self,
            ViolationType::MemoryLimit | ViolationType::DiskQuota | ViolationType::ProcessCount
        )
    }
}

impl std::fmt::Display for ViolationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ViolationType::MemoryLimit => "memory_limit",
            ViolationType::MemoryWarning => "memory_warning",
            ViolationType::CpuQuota => "cpu_quota",
            ViolationType::DiskQuota => "disk_quota",
            ViolationType::ProcessCount => "process_count",
        };
        write!(f, "{}", s)
    }
}

/// A detected breach, derived from a sample and never stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceViolation {
    #[serde(rename = "type")]
    pub violation_type: ViolationType,
    pub current_value: f64,
    pub limit_value: f64,
    /// Normalized overage in [0, 1]
    pub severity: f64,
    pub should_terminate: bool,
}

impl ResourceViolation {
    fn new(violation_type: ViolationType, current: f64, limit: f64) -> Self {
        ResourceViolation {
            violation_type,
            current_value: current,
            limit_value: limit,
            severity: severity(current, limit),
            should_terminate: violation_type.terminates(),
        }
    }
}

/// `min(current/limit - 1, 1)`, never negative
pub fn severity(current: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        return 1.0;
    }
    (current / limit - 1.0).clamp(0.0, 1.0)
}

/// First violation in priority order, if any.
///
/// Hard limits trigger strictly above the limit; the memory warning triggers
/// at the threshold itself.
pub fn check_violations(usage: &ResourceUsage, limits: &ResourceLimits) -> Option<ResourceViolation> {
    let memory = usage.memory_usage_bytes as f64;

    if limits.memory_limit_bytes > 0 && usage.memory_usage_bytes > limits.memory_limit_bytes {
        return Some(ResourceViolation::new(
            ViolationType::MemoryLimit,
            memory,
            limits.memory_limit_bytes as f64,
        ));
    }

    if limits.memory_warning_bytes > 0 && usage.memory_usage_bytes >= limits.memory_warning_bytes {
        return Some(ResourceViolation::new(
            ViolationType::MemoryWarning,
            memory,
            limits.memory_warning_bytes as f64,
        ));
    }

    if limits.cpu_quota_percent > 0.0 && usage.cpu_usage_percent > limits.cpu_quota_percent {
        return Some(ResourceViolation::new(
            ViolationType::CpuQuota,
            usage.cpu_usage_percent,
            limits.cpu_quota_percent,
        ));
    }

    if limits.disk_limit_bytes > 0 && usage.disk_usage_bytes > limits.disk_limit_bytes {
        return Some(ResourceViolation::new(
            ViolationType::DiskQuota,
            usage.disk_usage_bytes as f64,
            limits.disk_limit_bytes as f64,
        ));
    }

    if limits.max_processes > 0 && usage.process_count > limits.max_processes {
        return Some(ResourceViolation::new(
            ViolationType::ProcessCount,
            usage.process_count as f64,
            limits.max_processes as f64,
        ));
    }

    None
}

/// Samples sandboxes and keeps recent history
pub struct ResourceMonitor {
    providers: Arc<RuntimeRegistry<dyn SandboxProvider>>,
    history: DashMap<SandboxHandle, VecDeque<ResourceUsage>>,
    config: MonitorConfig,
}

impl ResourceMonitor {
    pub fn new(providers: Arc<RuntimeRegistry<dyn SandboxProvider>>, config: MonitorConfig) -> Self {
        ResourceMonitor {
            providers,
            history: DashMap::new(),
            config,
        }
    }

    /// Limits for a sandbox with the given memory ceiling
    pub fn limits_for(&self, memory_limit_mb: u64) -> ResourceLimits {
        ResourceLimits::from_config(&self.config, memory_limit_mb)
    }

    /// Take one sample and append it to the sandbox's history
    pub async fn sample(&self, handle: &SandboxHandle) -> Result<ResourceUsage> {
        let provider = self
            .providers
            .get(&handle.provider)
            .ok_or_else(|| Error::Sandbox(format!("Unknown sandbox provider: {}", handle.provider)))?;

        let usage = provider.stats(handle).await?;
        self.record(handle, usage.clone());
        Ok(usage)
    }

    /// Append a sample, evicting the oldest past `history_size`
    pub fn record(&self, handle: &SandboxHandle, usage: ResourceUsage) {
        let capacity = self.config.history_size.max(1);
        let mut ring = self
            .history
            .entry(handle.clone())
            .or_insert_with(|| VecDeque::with_capacity(capacity));
        while ring.len() >= capacity {
            ring.pop_front();
        }
        ring.push_back(usage);
    }

    /// Recent samples, oldest first
    pub fn history(&self, handle: &SandboxHandle) -> Vec<ResourceUsage> {
        self.history
            .get(handle)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop the history of a destroyed sandbox
    pub fn forget(&self, handle: &SandboxHandle) {
        self.history.remove(handle);
    }

    pub fn check(&self, usage: &ResourceUsage, limits: &ResourceLimits) -> Option<ResourceViolation> {
        check_violations(usage, limits)
    }

    /// Sample every target and return the violations found.
    ///
    /// A failed sample is logged and skipped; it never stops the sweep.
    pub async fn sweep<K>(&self, targets: Vec<(K, SandboxHandle, ResourceLimits)>) -> Vec<(K, ResourceViolation)> {
        let mut violations = Vec::new();

        for (key, handle, limits) in targets {
            let usage = match self.sample(&handle).await {
                Ok(usage) => usage,
                Err(e) => {
                    warn!("Sampling {} failed: {}", handle, e);
                    continue;
                }
            };

            if let Some(violation) = check_violations(&usage, &limits) {
                debug!(
                    "{} on {}: {} / {} (severity {:.2})",
                    violation.violation_type,
                    handle,
                    violation.current_value,
                    violation.limit_value,
                    violation.severity
                );
                violations.push((key, violation));
            }
        }

        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RunOutput;
    use crate::runtime::{Backend, RuntimeCapabilities};
    use crate::session::SandboxSpec;
    use async_trait::async_trait;
    use std::time::Duration;
    use uuid::Uuid;

    fn limits(memory: u64) -> ResourceLimits {
        ResourceLimits {
            memory_limit_bytes: memory,
            memory_warning_bytes: memory * 8 / 10,
            cpu_quota_percent: 100.0,
            disk_limit_bytes: 1000,
            max_processes: 10,
        }
    }

    fn usage() -> ResourceUsage {
        ResourceUsage::default()
    }

    #[test]
    fn test_hard_memory_severity() {
        let sample = ResourceUsage {
            memory_usage_bytes: 150,
            ..usage()
        };
        let v = check_violations(&sample, &limits(100)).unwrap();

        assert_eq!(v.violation_type, ViolationType::MemoryLimit);
        assert!((v.severity - 0.5).abs() < 1e-9);
        assert!(v.should_terminate);
    }

    #[test]
    fn test_warning_does_not_terminate() {
        let sample = ResourceUsage {
            memory_usage_bytes: 80,
            ..usage()
        };
        let v = check_violations(&sample, &limits(100)).unwrap();

        assert_eq!(v.violation_type, ViolationType::MemoryWarning);
        assert!(!v.should_terminate);
        assert_eq!(v.severity, 0.0);
    }

    #[test]
    fn test_severity_is_capped() {
        let sample = ResourceUsage {
            memory_usage_bytes: 500,
            ..usage()
        };
        let v = check_violations(&sample, &limits(100)).unwrap();
        assert_eq!(v.severity, 1.0);
    }

    #[test]
    fn test_priority_order() {
        let everything = ResourceUsage {
            memory_usage_bytes: 90,
            cpu_usage_percent: 250.0,
            disk_usage_bytes: 5000,
            process_count: 50,
            ..usage()
        };
        let v = check_violations(&everything, &limits(100)).unwrap();
        assert_eq!(v.violation_type, ViolationType::MemoryWarning);

        let no_memory = ResourceUsage {
            memory_usage_bytes: 0,
            ..everything.clone()
        };
        let v = check_violations(&no_memory, &limits(100)).unwrap();
        assert_eq!(v.violation_type, ViolationType::CpuQuota);
        assert!(!v.should_terminate);

        let disk_and_procs = ResourceUsage {
            cpu_usage_percent: 10.0,
            ..no_memory
        };
        let v = check_violations(&disk_and_procs, &limits(100)).unwrap();
        assert_eq!(v.violation_type, ViolationType::DiskQuota);
        assert!(v.should_terminate);

        let procs_only = ResourceUsage {
            process_count: 11,
            ..usage()
        };
        let v = check_violations(&procs_only, &limits(100)).unwrap();
        assert_eq!(v.violation_type, ViolationType::ProcessCount);
    }

    #[test]
    fn test_within_limits() {
        assert!(check_violations(&usage(), &limits(100)).is_none());
    }

    #[test]
    fn test_limits_from_config() {
        let limits = ResourceLimits::from_config(&MonitorConfig::default(), 100);
        assert_eq!(limits.memory_limit_bytes, 100 * 1024 * 1024);
        assert_eq!(limits.memory_warning_bytes, 80 * 1024 * 1024);
    }

    /// Provider whose stats fail for ids starting with "broken"
    struct StatsProvider;

    #[async_trait]
    impl Backend for StatsProvider {
        fn name(&self) -> &str {
            "stats"
        }

        fn supported_environments(&self) -> Vec<String> {
            vec!["bash".to_string()]
        }

        async fn is_available(&self) -> bool {
            true
        }

        fn capabilities(&self) -> RuntimeCapabilities {
            RuntimeCapabilities {
                startup_time_ms: 1,
                memory_overhead_mb: 1,
                isolation_level: 1,
                supports_filesystem_persistence: true,
                supports_network_access: false,
                max_concurrent_executions: 1,
            }
        }
    }

    #[async_trait]
    impl SandboxProvider for StatsProvider {
        async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
            Ok(SandboxHandle::new(spec.session_id.to_string(), "stats"))
        }

        async fn exec(&self, _: &SandboxHandle, _: &str, _: Duration) -> Result<RunOutput> {
            Ok(RunOutput::finished(0, String::new(), String::new(), Duration::ZERO))
        }

        async fn destroy(&self, _: &SandboxHandle) -> Result<()> {
            Ok(())
        }

        async fn stats(&self, handle: &SandboxHandle) -> Result<ResourceUsage> {
            if handle.id.starts_with("broken") {
                return Err(Error::Sandbox("gone".into()));
            }
            Ok(ResourceUsage {
                memory_usage_bytes: 200,
                ..ResourceUsage::default()
            })
        }

        async fn resolve(&self, _: Uuid) -> Result<Option<SandboxHandle>> {
            Ok(None)
        }
    }

    fn monitor(history_size: usize) -> ResourceMonitor {
        let mut providers: RuntimeRegistry<dyn SandboxProvider> = RuntimeRegistry::new();
        providers.register(Arc::new(StatsProvider));
        let config = MonitorConfig {
            history_size,
            ..MonitorConfig::default()
        };
        ResourceMonitor::new(Arc::new(providers), config)
    }

    #[test]
    fn test_history_ring_evicts_oldest() {
        let monitor = monitor(3);
        let handle = SandboxHandle::new("a", "stats");
        for i in 0..5u64 {
            monitor.record(
                &handle,
                ResourceUsage {
                    process_count: i,
                    ..ResourceUsage::default()
                },
            );
        }

        let counts: Vec<u64> = monitor.history(&handle).iter().map(|u| u.process_count).collect();
        assert_eq!(counts, vec![2, 3, 4]);

        monitor.forget(&handle);
        assert!(monitor.history(&handle).is_empty());
    }

    #[tokio::test]
    async fn test_sample_unknown_provider() {
        let monitor = monitor(3);
        let handle = SandboxHandle::new("a", "firecracker");
        assert!(monitor.sample(&handle).await.is_err());
    }

    #[tokio::test]
    async fn test_sweep_isolates_failures() {
        let monitor = monitor(3);
        let targets = vec![
            (1, SandboxHandle::new("broken-1", "stats"), limits(100)),
            (2, SandboxHandle::new("ok-2", "stats"), limits(100)),
            (3, SandboxHandle::new("ok-3", "stats"), limits(1000)),
        ];

        let violations = monitor.sweep(targets).await;

        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].0, 2);
        assert_eq!(violations[0].1.violation_type, ViolationType::MemoryLimit);
        assert_eq!(monitor.history(&SandboxHandle::new("ok-3", "stats")).len(), 1);
    }
}
