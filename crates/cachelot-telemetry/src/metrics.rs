//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Exposes a minimal set of counters/gauges relevant to the cache engine.

use std::sync::Arc;
use std::time::Duration;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::{TelemetryError, TelemetryResult};

/// Prometheus-backed metrics registry shared across services.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    relocations_total: IntCounterVec,
    relocation_bytes_total: IntCounterVec,
    upstream_requests_total: IntCounterVec,
    upstream_retries_total: IntCounter,
    upstream_throttle_wait_ms: IntGauge,
    cycles_total: IntCounterVec,
    events_emitted_total: IntCounterVec,
    provider_failures_total: IntCounterVec,
    fast_tier_used_bytes: IntGauge,
    tracked_entries: IntGauge,
    relocations_in_flight: IntGauge,
}

/// Snapshot of selected gauges and counters for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Bytes currently tracked on the fast tier.
    pub fast_tier_used_bytes: i64,
    /// Number of tracked cache entries.
    pub tracked_entries: i64,
    /// Relocations currently executing.
    pub relocations_in_flight: i64,
    /// Total upstream retries performed.
    pub upstream_retries_total: u64,
    /// Last observed wait imposed by the upstream rate gate, in ms.
    pub upstream_throttle_wait_ms: i64,
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors
    /// registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be
    /// registered.
    pub fn new() -> TelemetryResult<Self> {
        let registry = Registry::new();

        let relocations_total = IntCounterVec::new(
            Opts::new("relocations_total", "Relocations executed by outcome"),
            &["operation", "status"],
        )?;
        let relocation_bytes_total = IntCounterVec::new(
            Opts::new("relocation_bytes_total", "Bytes moved between tiers"),
            &["operation"],
        )?;
        let upstream_requests_total = IntCounterVec::new(
            Opts::new("upstream_requests_total", "Upstream requests by outcome"),
            &["operation", "outcome"],
        )?;
        let upstream_retries_total = IntCounter::with_opts(Opts::new(
            "upstream_retries_total",
            "Upstream retries performed",
        ))?;
        let upstream_throttle_wait_ms = IntGauge::with_opts(Opts::new(
            "upstream_throttle_wait_ms",
            "Last wait imposed by the upstream rate gate (ms)",
        ))?;
        let cycles_total = IntCounterVec::new(
            Opts::new("cycles_total", "Cache cycles run by outcome"),
            &["outcome"],
        )?;
        let events_emitted_total = IntCounterVec::new(
            Opts::new("events_emitted_total", "Domain events emitted by type"),
            &["type"],
        )?;
        let provider_failures_total = IntCounterVec::new(
            Opts::new("provider_failures_total", "Import list refresh failures"),
            &["provider"],
        )?;
        let fast_tier_used_bytes = IntGauge::with_opts(Opts::new(
            "fast_tier_used_bytes",
            "Bytes tracked on the fast tier",
        ))?;
        let tracked_entries =
            IntGauge::with_opts(Opts::new("tracked_entries", "Tracked cache entries"))?;
        let relocations_in_flight = IntGauge::with_opts(Opts::new(
            "relocations_in_flight",
            "Relocations currently executing",
        ))?;

        registry.register(Box::new(relocations_total.clone()))?;
        registry.register(Box::new(relocation_bytes_total.clone()))?;
        registry.register(Box::new(upstream_requests_total.clone()))?;
        registry.register(Box::new(upstream_retries_total.clone()))?;
        registry.register(Box::new(upstream_throttle_wait_ms.clone()))?;
        registry.register(Box::new(cycles_total.clone()))?;
        registry.register(Box::new(events_emitted_total.clone()))?;
        registry.register(Box::new(provider_failures_total.clone()))?;
        registry.register(Box::new(fast_tier_used_bytes.clone()))?;
        registry.register(Box::new(tracked_entries.clone()))?;
        registry.register(Box::new(relocations_in_flight.clone()))?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                relocations_total,
                relocation_bytes_total,
                upstream_requests_total,
                upstream_retries_total,
                upstream_throttle_wait_ms,
                cycles_total,
                events_emitted_total,
                provider_failures_total,
                fast_tier_used_bytes,
                tracked_entries,
                relocations_in_flight,
            }),
        })
    }

    /// Count one finished relocation.
    pub fn inc_relocation(&self, operation: &str, status: &str) {
        self.inner
            .relocations_total
            .with_label_values(&[operation, status])
            .inc();
    }

    /// Add bytes moved by a relocation.
    pub fn add_relocation_bytes(&self, operation: &str, bytes: u64) {
        self.inner
            .relocation_bytes_total
            .with_label_values(&[operation])
            .inc_by(bytes);
    }

    /// Count one upstream request by outcome (`ok`, `retry`, `error`).
    pub fn inc_upstream_request(&self, operation: &str, outcome: &str) {
        self.inner
            .upstream_requests_total
            .with_label_values(&[operation, outcome])
            .inc();
    }

    /// Count one upstream retry.
    pub fn inc_upstream_retry(&self) {
        self.inner.upstream_retries_total.inc();
    }

    /// Record the last wait imposed by the upstream rate gate.
    pub fn observe_throttle_wait(&self, wait: Duration) {
        self.inner
            .upstream_throttle_wait_ms
            .set(duration_to_ms(wait));
    }

    /// Count one finished cycle by outcome (`completed`, `aborted`).
    pub fn inc_cycle(&self, outcome: &str) {
        self.inner
            .cycles_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Count one emitted event by type.
    pub fn inc_event(&self, event_type: &str) {
        self.inner
            .events_emitted_total
            .with_label_values(&[event_type])
            .inc();
    }

    /// Count one provider refresh failure.
    pub fn inc_provider_failure(&self, provider: &str) {
        self.inner
            .provider_failures_total
            .with_label_values(&[provider])
            .inc();
    }

    /// Set the fast-tier usage gauge.
    pub fn set_fast_tier_used(&self, bytes: u64) {
        self.inner
            .fast_tier_used_bytes
            .set(i64::try_from(bytes).unwrap_or(i64::MAX));
    }

    /// Set the tracked entry gauge.
    pub fn set_tracked_entries(&self, count: u64) {
        self.inner
            .tracked_entries
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Adjust the in-flight relocation gauge.
    pub fn relocation_started(&self) {
        self.inner.relocations_in_flight.inc();
    }

    /// Adjust the in-flight relocation gauge back down.
    pub fn relocation_finished(&self) {
        self.inner.relocations_in_flight.dec();
    }

    /// Render the metrics registry using the Prometheus text exposition
    /// format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> TelemetryResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(TelemetryError::from)?;
        String::from_utf8(buffer).map_err(|_| TelemetryError::Encoding)
    }

    /// Take a point-in-time snapshot of the most relevant gauges and
    /// counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            fast_tier_used_bytes: self.inner.fast_tier_used_bytes.get(),
            tracked_entries: self.inner.tracked_entries.get(),
            relocations_in_flight: self.inner.relocations_in_flight.get(),
            upstream_retries_total: self.inner.upstream_retries_total.get(),
            upstream_throttle_wait_ms: self.inner.upstream_throttle_wait_ms.get(),
        }
    }
}

fn duration_to_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
