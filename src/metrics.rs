//! Counters and gauges maintained by the request handlers.
//!
//! Everything is a plain atomic so handlers pay one relaxed add per update.
//! The object/bucket gauges are primed from metadata counts at startup and
//! adjusted immediately after each authoritative metadata change. An
//! external metrics surface reads these; none are rendered here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct Metrics {
    enabled: bool,
    pub http_requests_total: AtomicU64,
    pub bytes_in_total: AtomicU64,
    pub bytes_out_total: AtomicU64,
    pub objects_total: AtomicU64,
    pub buckets_total: AtomicU64,
    operations: Mutex<HashMap<&'static str, u64>>,
}

impl Metrics {
    pub fn new(enabled: bool) -> Self {
        Metrics {
            enabled,
            ..Metrics::default()
        }
    }

    pub fn record_request(&self, operation: &'static str, bytes_in: u64) {
        if !self.enabled {
            return;
        }
        self.http_requests_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_in_total.fetch_add(bytes_in, Ordering::Relaxed);
        *self
            .operations
            .lock()
            .unwrap()
            .entry(operation)
            .or_insert(0) += 1;
    }

    pub fn record_bytes_out(&self, bytes: u64) {
        if self.enabled {
            self.bytes_out_total.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn prime(&self, buckets: u64, objects: u64) {
        if self.enabled {
            self.buckets_total.store(buckets, Ordering::Relaxed);
            self.objects_total.store(objects, Ordering::Relaxed);
        }
    }

    pub fn add_buckets(&self, delta: i64) {
        if self.enabled {
            adjust(&self.buckets_total, delta);
        }
    }

    pub fn add_objects(&self, delta: i64) {
        if self.enabled {
            adjust(&self.objects_total, delta);
        }
    }

    /// Per-operation request counts, for the external metrics surface.
    pub fn operation_counts(&self) -> HashMap<&'static str, u64> {
        self.operations.lock().unwrap().clone()
    }
}

fn adjust(gauge: &AtomicU64, delta: i64) {
    if delta >= 0 {
        gauge.fetch_add(delta as u64, Ordering::Relaxed);
    } else {
        // Saturate at zero rather than wrap if a prime/update raced.
        let mut current = gauge.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub((-delta) as u64);
            match gauge.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauges_track_and_saturate() {
        let metrics = Metrics::new(true);
        metrics.prime(2, 10);
        metrics.add_objects(3);
        metrics.add_objects(-1);
        assert_eq!(metrics.objects_total.load(Ordering::Relaxed), 12);

        metrics.add_buckets(-5);
        assert_eq!(metrics.buckets_total.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_disabled_metrics_stay_zero() {
        let metrics = Metrics::new(false);
        metrics.record_request("PutObject", 100);
        metrics.prime(1, 1);
        assert_eq!(metrics.http_requests_total.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.objects_total.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_operation_counts() {
        let metrics = Metrics::new(true);
        metrics.record_request("GetObject", 0);
        metrics.record_request("GetObject", 0);
        metrics.record_request("PutObject", 5);
        let counts = metrics.operation_counts();
        assert_eq!(counts["GetObject"], 2);
        assert_eq!(counts["PutObject"], 1);
        assert_eq!(metrics.bytes_in_total.load(Ordering::Relaxed), 5);
    }
}
