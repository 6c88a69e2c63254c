//! Health check aggregation.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Health status for a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn is_serving(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

/// Component health state.
#[derive(Debug)]
pub struct ComponentHealth {
    name: &'static str,
    healthy: AtomicBool,
    message: parking_lot::RwLock<Option<String>>,
}

impl ComponentHealth {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            healthy: AtomicBool::new(false),
            message: parking_lot::RwLock::new(None),
        }
    }

    pub fn set_healthy(&self) {
        self.healthy.store(true, Ordering::Relaxed);
        *self.message.write() = None;
    }

    pub fn set_unhealthy(&self, msg: impl Into<String>) {
        self.healthy.store(false, Ordering::Relaxed);
        *self.message.write() = Some(msg.into());
    }

    /// Mark a component that is switched off by configuration. It does not
    /// degrade the report.
    pub fn set_disabled(&self) {
        self.healthy.store(true, Ordering::Relaxed);
        *self.message.write() = Some("disabled".to_string());
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn message(&self) -> Option<String> {
        self.message.read().clone()
    }
}

/// Aggregated health status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealthReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealthReport {
    pub name: String,
    pub healthy: bool,
    pub message: Option<String>,
}

/// Global health registry.
pub struct HealthRegistry {
    pub store: ComponentHealth,
    pub clickhouse: ComponentHealth,
    pub providers: ComponentHealth,
}

impl HealthRegistry {
    pub const fn new() -> Self {
        Self {
            store: ComponentHealth::new("store"),
            clickhouse: ComponentHealth::new("clickhouse"),
            providers: ComponentHealth::new("providers"),
        }
    }

    fn components(&self) -> [&ComponentHealth; 3] {
        [&self.store, &self.clickhouse, &self.providers]
    }

    /// Generate a health report.
    ///
    /// The store is the only hard dependency: without it the pipeline is
    /// unhealthy, with it but any other component down it is degraded.
    pub fn report(&self) -> HealthReport {
        let components: Vec<ComponentHealthReport> = self
            .components()
            .iter()
            .map(|c| ComponentHealthReport {
                name: c.name().to_string(),
                healthy: c.is_healthy(),
                message: c.message(),
            })
            .collect();

        let status = if !self.store.is_healthy() {
            HealthStatus::Unhealthy
        } else if components.iter().all(|c| c.healthy) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport { status, components }
    }

    /// Check if the service can accept traffic.
    pub fn is_ready(&self) -> bool {
        self.store.is_healthy()
    }

    /// Check if the service is alive.
    pub fn is_alive(&self) -> bool {
        true
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global health registry.
pub static HEALTH: std::sync::LazyLock<HealthRegistry> =
    std::sync::LazyLock::new(HealthRegistry::new);

/// Get the global health registry.
pub fn health() -> &'static HealthRegistry {
    &HEALTH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_outage_is_unhealthy() {
        let registry = HealthRegistry::new();
        registry.clickhouse.set_healthy();
        registry.providers.set_healthy();
        registry.store.set_unhealthy("database is locked");

        let report = registry.report();
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(!registry.is_ready());
    }

    #[test]
    fn test_optional_component_down_is_degraded() {
        let registry = HealthRegistry::new();
        registry.store.set_healthy();
        registry.providers.set_healthy();
        registry.clickhouse.set_unhealthy("mirror disabled");

        let report = registry.report();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.status.is_serving());
        assert!(registry.is_ready());
    }

    #[test]
    fn test_disabled_component_does_not_degrade() {
        let registry = HealthRegistry::new();
        registry.store.set_healthy();
        registry.providers.set_healthy();
        registry.clickhouse.set_disabled();

        let report = registry.report();
        assert_eq!(report.status, HealthStatus::Healthy);
        let clickhouse = report
            .components
            .iter()
            .find(|c| c.name == "clickhouse")
            .unwrap();
        assert!(clickhouse.healthy);
        assert_eq!(clickhouse.message.as_deref(), Some("disabled"));
    }
}
