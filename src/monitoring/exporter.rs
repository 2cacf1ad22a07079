//! Prometheus Exporter
//!
//! Gauges refreshed by the periodic health task and rendered in the text
//! exposition format for `/metrics`.

use prometheus::{Encoder, Gauge, IntGauge, Registry, TextEncoder};

use super::health::HealthStatus;
use crate::error::{Error, Result};

/// Values published on each refresh
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExporterSample {
    pub hit_rate: f64,
    pub memory_used_bytes: u64,
    pub memory_limit_bytes: u64,
    pub entries: u64,
    pub warming_completed: u64,
    pub warming_failed: u64,
    pub backend_available: bool,
}

/// Cache gauges in a dedicated registry
pub struct CacheExporter {
    registry: Registry,
    hit_rate: Gauge,
    memory_used: IntGauge,
    memory_limit: IntGauge,
    entries: IntGauge,
    health: IntGauge,
    warming_completed: IntGauge,
    warming_failed: IntGauge,
    backend_available: IntGauge,
}

impl CacheExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let hit_rate = Gauge::new("adaptive_cache_hit_rate", "Cache hit rate since start")?;
        let memory_used = IntGauge::new(
            "adaptive_cache_memory_used_bytes",
            "Bytes held by the local tier",
        )?;
        let memory_limit = IntGauge::new(
            "adaptive_cache_memory_limit_bytes",
            "Local tier byte capacity",
        )?;
        let entries = IntGauge::new("adaptive_cache_entries", "Entries in the local tier")?;
        let health = IntGauge::new(
            "adaptive_cache_health_status",
            "0 healthy, 1 degraded, 2 unhealthy",
        )?;
        let warming_completed = IntGauge::new(
            "adaptive_cache_warming_completed_total",
            "Warming tasks completed",
        )?;
        let warming_failed = IntGauge::new(
            "adaptive_cache_warming_failed_total",
            "Warming tasks failed",
        )?;
        let backend_available = IntGauge::new(
            "adaptive_cache_backend_available",
            "1 when the distributed tier is reachable",
        )?;

        registry.register(Box::new(hit_rate.clone()))?;
        registry.register(Box::new(memory_used.clone()))?;
        registry.register(Box::new(memory_limit.clone()))?;
        registry.register(Box::new(entries.clone()))?;
        registry.register(Box::new(health.clone()))?;
        registry.register(Box::new(warming_completed.clone()))?;
        registry.register(Box::new(warming_failed.clone()))?;
        registry.register(Box::new(backend_available.clone()))?;

        Ok(Self {
            registry,
            hit_rate,
            memory_used,
            memory_limit,
            entries,
            health,
            warming_completed,
            warming_failed,
            backend_available,
        })
    }

    pub fn update(&self, sample: &ExporterSample, status: HealthStatus) {
        self.hit_rate.set(sample.hit_rate);
        self.memory_used.set(sample.memory_used_bytes as i64);
        self.memory_limit.set(sample.memory_limit_bytes as i64);
        self.entries.set(sample.entries as i64);
        self.health.set(status.code());
        self.warming_completed.set(sample.warming_completed as i64);
        self.warming_failed.set(sample.warming_failed as i64);
        self.backend_available
            .set(i64::from(sample.backend_available));
    }

    /// Text exposition of every gauge
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("Metrics not UTF-8: {}", e)))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
