//! Lightweight metrics helpers for Trellis.
//!
//! Thin wrappers over the `metrics` crate macros; the application can
//! install any compatible recorder externally. Registered families:
//!
//! * `trellis_requests_total` (counter, labels: status class)
//! * `trellis_request_duration_seconds` (histogram)
//! * `trellis_bad_requests_total` / `trellis_bad_gateways_total` (counters)
//! * `trellis_routes` / `trellis_endpoints` (gauges)
//! * `trellis_pruned_endpoints_total` (counter)
//! * `trellis_registry_message_age_ms` (gauge)
use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use once_cell::sync::Lazy;

pub const REQUESTS_TOTAL: &str = "trellis_requests_total";
pub const REQUEST_DURATION_SECONDS: &str = "trellis_request_duration_seconds";
pub const BAD_REQUESTS_TOTAL: &str = "trellis_bad_requests_total";
pub const BAD_GATEWAYS_TOTAL: &str = "trellis_bad_gateways_total";
pub const ROUTES: &str = "trellis_routes";
pub const ENDPOINTS: &str = "trellis_endpoints";
pub const PRUNED_ENDPOINTS_TOTAL: &str = "trellis_pruned_endpoints_total";

static DESCRIBED: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        REQUESTS_TOTAL,
        Unit::Count,
        "Total HTTP requests handled by the proxy."
    );
    describe_histogram!(
        REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of proxied HTTP requests."
    );
    describe_counter!(
        BAD_REQUESTS_TOTAL,
        Unit::Count,
        "Requests rejected before routing."
    );
    describe_counter!(
        BAD_GATEWAYS_TOTAL,
        Unit::Count,
        "Requests that exhausted every backend attempt."
    );
    describe_gauge!(ROUTES, "Registered route keys.");
    describe_gauge!(ENDPOINTS, "Distinct registered endpoints.");
    describe_counter!(
        PRUNED_ENDPOINTS_TOTAL,
        Unit::Count,
        "Endpoints removed by the staleness pruner."
    );
});

/// Register metric descriptions (idempotent).
pub fn init_metrics() {
    Lazy::force(&DESCRIBED);
}

pub fn record_request(status: u16, duration: std::time::Duration) {
    let class = match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    };
    counter!(REQUESTS_TOTAL, "class" => class).increment(1);
    histogram!(REQUEST_DURATION_SECONDS).record(duration.as_secs_f64());
}

pub fn record_bad_request() {
    counter!(BAD_REQUESTS_TOTAL).increment(1);
}

pub fn record_bad_gateway() {
    counter!(BAD_GATEWAYS_TOTAL).increment(1);
}

pub fn record_registry_size(routes: usize, endpoints: usize) {
    gauge!(ROUTES).set(routes as f64);
    gauge!(ENDPOINTS).set(endpoints as f64);
}

pub fn record_prune(pruned: usize, remaining_routes: usize) {
    counter!(PRUNED_ENDPOINTS_TOTAL).increment(pruned as u64);
    gauge!(ROUTES).set(remaining_routes as f64);
}

/// RAII timer recording a request's duration and status class on drop.
pub struct RequestTimer {
    start: Instant,
    status: u16,
}

impl RequestTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            status: 0,
        }
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Default for RequestTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        if self.status != 0 {
            record_request(self.status, self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_metrics();
        init_metrics();
    }

    #[test]
    fn request_timer_records_on_drop() {
        let mut timer = RequestTimer::new();
        timer.set_status(200);
        drop(timer);
    }

    #[test]
    fn unset_timer_records_nothing() {
        let timer = RequestTimer::new();
        drop(timer);
    }
}
