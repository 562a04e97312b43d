use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

// ── Scheduling (request-driven) ─────────────────────────────────

/// Counter: slot searches. Labels: outcome (`scheduled`, `window_too_narrow`, `no_capacity`, `error`).
pub const SLOT_SEARCHES_TOTAL: &str = "medsched_slot_searches_total";

/// Histogram: slot search latency in seconds, including busy-map reads.
pub const SLOT_SEARCH_DURATION_SECONDS: &str = "medsched_slot_search_duration_seconds";

/// Counter: store writes rejected because the room was already taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "medsched_booking_conflicts_total";

// ── Offers ──────────────────────────────────────────────────────

/// Counter: tentative offers created (one per filled horizon).
pub const OFFERS_CREATED_TOTAL: &str = "medsched_offers_created_total";

/// Counter: offer families confirmed by the patient.
pub const OFFERS_ACCEPTED_TOTAL: &str = "medsched_offers_accepted_total";

/// Counter: offer families released because the hold ran out.
pub const OFFERS_EXPIRED_TOTAL: &str = "medsched_offers_expired_total";

/// Counter: appointments written by the random generator.
pub const APPOINTMENTS_GENERATED_TOTAL: &str = "medsched_appointments_generated_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "medsched_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "medsched_wal_flush_batch_size";

/// Install the fmt subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
