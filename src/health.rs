use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Per-unit health, overwritten as cycles complete. In-memory only.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UnitHealth {
    pub running: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub restart_count: u32,
    pub rows_ingested: u64,
}

/// Point-in-time view of one stream connection, published by the listener.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub connected: bool,
    pub last_message: Option<DateTime<Utc>>,
    pub reconnects: u64,
    pub subscribed_tokens: usize,
}

/// Deep-copied health view handed to external readers. Mutating it cannot
/// perturb the registry.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub units: BTreeMap<String, UnitHealth>,
    pub stream_connections: Vec<ConnectionSnapshot>,
}

/// Owned by the daemon; units report through the setter operations below and
/// external readers only ever see `snapshot()` copies.
pub struct HealthRegistry {
    units: DashMap<String, UnitHealth>,
    stream_connections: RwLock<Vec<ConnectionSnapshot>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            units: DashMap::new(),
            stream_connections: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, unit: &str) {
        self.units.entry(unit.to_string()).or_default();
    }

    pub fn set_running(&self, unit: &str, running: bool) {
        self.units.entry(unit.to_string()).or_default().running = running;
    }

    pub fn record_success(&self, unit: &str, rows: u64) {
        let mut entry = self.units.entry(unit.to_string()).or_default();
        entry.last_success = Some(Utc::now());
        entry.consecutive_failures = 0;
        entry.rows_ingested += rows;
    }

    pub fn record_failure(&self, unit: &str, error: &str) {
        let mut entry = self.units.entry(unit.to_string()).or_default();
        entry.last_error = Some(error.to_string());
        entry.consecutive_failures += 1;
    }

    pub fn record_restart(&self, unit: &str) {
        self.units.entry(unit.to_string()).or_default().restart_count += 1;
    }

    pub fn set_stream_connections(&self, connections: Vec<ConnectionSnapshot>) {
        if let Ok(mut guard) = self.stream_connections.write() {
            *guard = connections;
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let units = self
            .units
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let stream_connections = self
            .stream_connections
            .read()
            .map(|g| g.clone())
            .unwrap_or_default();
        HealthSnapshot { units, stream_connections }
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_resets_consecutive_failures() {
        let registry = HealthRegistry::new();
        registry.record_failure("prices", "boom");
        registry.record_failure("prices", "boom again");
        assert_eq!(
            registry.snapshot().units["prices"].consecutive_failures,
            2
        );

        registry.record_success("prices", 10);
        let snap = registry.snapshot();
        assert_eq!(snap.units["prices"].consecutive_failures, 0);
        assert_eq!(snap.units["prices"].rows_ingested, 10);
        assert!(snap.units["prices"].last_success.is_some());
        // The last error is retained for observability.
        assert_eq!(snap.units["prices"].last_error.as_deref(), Some("boom again"));
    }

    #[test]
    fn snapshot_is_a_deep_copy() {
        let registry = HealthRegistry::new();
        registry.record_success("metadata", 5);

        let mut snap = registry.snapshot();
        snap.units.get_mut("metadata").unwrap().rows_ingested = 999;

        assert_eq!(registry.snapshot().units["metadata"].rows_ingested, 5);
    }

    #[test]
    fn restart_count_accumulates() {
        let registry = HealthRegistry::new();
        registry.register("trade_listener");
        registry.record_restart("trade_listener");
        registry.record_restart("trade_listener");
        assert_eq!(registry.snapshot().units["trade_listener"].restart_count, 2);
    }
}
