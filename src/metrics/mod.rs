//! Metrics module
//!
//! Prometheus counters for replication cycles, registered once in the
//! default registry and served by [`server`].

pub mod server;

use once_cell::sync::OnceCell;
use prometheus::{Gauge, IntCounter, IntCounterVec, Opts, Registry};
use tracing::warn;

use crate::error::{Error, Result};
use crate::replicator::{CycleStats, PassStats};

/// All replicator metrics.
#[derive(Debug, Clone)]
pub struct ReplicatorMetrics {
    pub cycles: IntCounter,
    pub cycle_duration_seconds: Gauge,
    pub last_cycle_timestamp: Gauge,
    pub objects_seen: IntCounterVec,
    pub transfers: IntCounterVec,
    pub handoffs_removed: IntCounterVec,
    pub versions_reclaimed: IntCounterVec,
    pub device_failures: IntCounterVec,
}

impl ReplicatorMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::new(name, help).map_err(metric_err)?;
            registry.register(Box::new(c.clone())).map_err(metric_err)?;
            Ok(c)
        };
        let gauge = |name: &str, help: &str| -> Result<Gauge> {
            let g = Gauge::new(name, help).map_err(metric_err)?;
            registry.register(Box::new(g.clone())).map_err(metric_err)?;
            Ok(g)
        };
        let counter_vec = |name: &str, help: &str, labels: &[&str]| -> Result<IntCounterVec> {
            let c = IntCounterVec::new(Opts::new(name, help), labels).map_err(metric_err)?;
            registry.register(Box::new(c.clone())).map_err(metric_err)?;
            Ok(c)
        };

        Ok(Self {
            cycles: counter(
                "kinetic_replicator_cycles_total",
                "Completed replication cycles",
            )?,
            cycle_duration_seconds: gauge(
                "kinetic_replicator_cycle_duration_seconds",
                "Duration of the last replication cycle",
            )?,
            last_cycle_timestamp: gauge(
                "kinetic_replicator_last_cycle_timestamp_seconds",
                "Unix time the last replication cycle started",
            )?,
            objects_seen: counter_vec(
                "kinetic_replicator_objects_seen_total",
                "Head keys examined",
                &["policy"],
            )?,
            transfers: counter_vec(
                "kinetic_replicator_transfers_total",
                "Object transfers to peer devices",
                &["policy", "result"],
            )?,
            handoffs_removed: counter_vec(
                "kinetic_replicator_handoffs_removed_total",
                "Handoff copies deleted after full replication",
                &["policy"],
            )?,
            versions_reclaimed: counter_vec(
                "kinetic_replicator_versions_reclaimed_total",
                "Superseded versions and expired tombstones deleted",
                &["policy"],
            )?,
            device_failures: counter_vec(
                "kinetic_replicator_device_failures_total",
                "Device passes that could not complete",
                &["policy"],
            )?,
        })
    }

    pub fn record_pass(&self, policy: &str, pass: &PassStats) {
        self.objects_seen
            .with_label_values(&[policy])
            .inc_by(pass.objects_seen);
        self.transfers
            .with_label_values(&[policy, "ok"])
            .inc_by(pass.transfers);
        self.transfers
            .with_label_values(&[policy, "failed"])
            .inc_by(pass.transfer_failures);
        self.handoffs_removed
            .with_label_values(&[policy])
            .inc_by(pass.handoffs_removed);
        self.versions_reclaimed
            .with_label_values(&[policy])
            .inc_by(pass.stale_reclaimed);
    }

    pub fn record_device_failure(&self, policy: &str) {
        self.device_failures.with_label_values(&[policy]).inc();
    }

    pub fn record_cycle(&self, stats: &CycleStats) {
        self.cycles.inc();
        self.cycle_duration_seconds
            .set(stats.duration.map(|d| d.as_secs_f64()).unwrap_or_default());
        if let Some(started) = stats.started_at {
            self.last_cycle_timestamp
                .set(started.timestamp_millis() as f64 / 1000.0);
        }
    }
}

fn metric_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metric registration failed: {}", e))
}

static METRICS: OnceCell<ReplicatorMetrics> = OnceCell::new();

/// Register the metrics in the default registry. Idempotent.
pub fn init() -> Result<&'static ReplicatorMetrics> {
    METRICS.get_or_try_init(|| ReplicatorMetrics::new(prometheus::default_registry()))
}

/// The registered metrics, registering them on first use.
pub fn global() -> Option<&'static ReplicatorMetrics> {
    match init() {
        Ok(m) => Some(m),
        Err(e) => {
            warn!(error = %e, "Metrics unavailable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_pass_and_cycle() {
        let registry = Registry::new();
        let metrics = ReplicatorMetrics::new(&registry).unwrap();
        let pass = PassStats {
            objects_seen: 5,
            transfers: 3,
            transfer_failures: 1,
            handoffs_removed: 2,
            stale_reclaimed: 1,
            malformed_keys: 0,
        };
        metrics.record_pass("gold", &pass);
        metrics.record_pass("gold", &pass);
        metrics.record_device_failure("gold");

        assert_eq!(metrics.objects_seen.with_label_values(&["gold"]).get(), 10);
        assert_eq!(metrics.transfers.with_label_values(&["gold", "ok"]).get(), 6);
        assert_eq!(metrics.transfers.with_label_values(&["gold", "failed"]).get(), 2);
        assert_eq!(metrics.device_failures.with_label_values(&["gold"]).get(), 1);

        metrics.record_cycle(&CycleStats::default());
        assert_eq!(metrics.cycles.get(), 1);
        assert!(registry.gather().len() >= 6);
    }

    #[test]
    fn test_double_registration_rejected() {
        let registry = Registry::new();
        ReplicatorMetrics::new(&registry).unwrap();
        assert!(ReplicatorMetrics::new(&registry).is_err());
        // the global handle registers only once
        assert!(init().is_ok());
        assert!(init().is_ok());
    }
}
