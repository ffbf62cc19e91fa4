//! Prometheus counters for pool claims.

use netpool::{Pool, PoolError};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Claim counters, labelled by pool
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    claims_total: IntCounterVec,
    exhausted_total: IntCounterVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let claims_total = IntCounterVec::new(
            Opts::new("netpool_claims_total", "Total number of rows claimed from a pool."),
            &["pool"],
        )?;
        let exhausted_total = IntCounterVec::new(
            Opts::new(
                "netpool_exhausted_total",
                "Total number of claims rejected because the pool had no free row.",
            ),
            &["pool"],
        )?;
        registry.register(Box::new(claims_total.clone()))?;
        registry.register(Box::new(exhausted_total.clone()))?;

        Ok(Self {
            registry,
            claims_total,
            exhausted_total,
        })
    }

    /// Count the outcome of one claim against `pool`
    pub fn observe<T>(&self, pool: Pool, result: &Result<T, PoolError>) {
        match result {
            Ok(_) => self.claims_total.with_label_values(&[pool.as_str()]).inc(),
            Err(e) if e.is_exhausted() => {
                self.exhausted_total.with_label_values(&[pool.as_str()]).inc();
            }
            Err(_) => {}
        }
    }

    /// Text exposition of every registered metric
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let families = self.registry.gather();
        let mut buffer = Vec::with_capacity(families.len() * 64);
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(buffer)
    }
}
