//! Prometheus Export
//!
//! Renders component snapshots in the Prometheus text exposition format.
//! Counters live in the components as atomics; a fresh registry is filled
//! from their snapshots on every render.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::cache::CacheStatsSnapshot;
use crate::error::{Error, Result};
use crate::seckill::{Rejection, ReservationStatsSnapshot};

const NAMESPACE: &str = "flashsale";

fn prom_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("prometheus: {}", e))
}

fn counter(registry: &Registry, name: &str, help: &str, value: u64) -> Result<()> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))
        .map_err(prom_err)?;
    counter.inc_by(value);
    registry.register(Box::new(counter)).map_err(prom_err)
}

fn register_cache(registry: &Registry, s: &CacheStatsSnapshot) -> Result<()> {
    let counters = [
        ("cache_hits_total", "Cache lookups answered by a cached record", s.hits),
        ("cache_null_hits_total", "Cache lookups answered by the null marker", s.null_hits),
        ("cache_misses_total", "Cache lookups that reached the loader", s.misses),
        ("cache_coalesced_total", "Misses answered by a concurrent load", s.coalesced),
        ("cache_loader_calls_total", "Loader invocations", s.loader_calls),
        ("cache_null_writes_total", "Null markers written", s.null_writes),
        ("cache_stale_served_total", "Logically expired values served", s.stale_served),
        ("cache_lock_waits_total", "Backoff sleeps waiting for a rebuild lock", s.lock_waits),
        ("cache_rebuilds_scheduled_total", "Background rebuilds scheduled", s.rebuilds_scheduled),
        ("cache_rebuilds_completed_total", "Background rebuilds completed", s.rebuilds_completed),
        ("cache_rebuild_failures_total", "Background rebuilds failed", s.rebuild_failures),
        ("cache_caller_runs_total", "Rebuilds run by the caller under backpressure", s.caller_runs),
    ];
    for (name, help, value) in counters {
        counter(registry, name, help, value)?;
    }
    Ok(())
}

fn register_seckill(registry: &Registry, s: &ReservationStatsSnapshot) -> Result<()> {
    counter(registry, "seckill_attempts_total", "Reservation attempts", s.attempts)?;
    counter(registry, "seckill_committed_total", "Orders committed", s.committed)?;
    counter(registry, "seckill_failures_total", "Attempts aborted by errors", s.failures)?;

    let rejected = IntCounterVec::new(
        Opts::new("seckill_rejected_total", "Reservations rejected").namespace(NAMESPACE),
        &["reason"],
    )
    .map_err(prom_err)?;
    for reason in Rejection::ALL {
        rejected
            .with_label_values(&[reason.as_str()])
            .inc_by(s.rejected(reason));
    }
    registry.register(Box::new(rejected)).map_err(prom_err)
}

/// Render whichever snapshots are given as Prometheus text.
pub fn render(
    cache: Option<&CacheStatsSnapshot>,
    seckill: Option<&ReservationStatsSnapshot>,
) -> Result<String> {
    let registry = Registry::new();
    if let Some(s) = cache {
        register_cache(&registry, s)?;
    }
    if let Some(s) = seckill {
        register_seckill(&registry, s)?;
    }

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(prom_err)?;
    String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics encoding: {}", e)))
}
