use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::models::UpsertOutcome;

// Very lightweight histogram buckets (ms) for remote request latency
static REQUEST_LATENCY_BUCKETS: &[u64] = &[25, 50, 100, 250, 500, 1000, 2500, 5000, 10000, 30000];

#[derive(Default, Debug, Clone)]
pub struct Histogram { pub buckets: Vec<u64>, pub counts: Vec<u64>, pub sum: u128, pub total: u64 }

impl Histogram {
    pub fn new(buckets: &[u64]) -> Self { Self { buckets: buckets.to_vec(), counts: vec![0; buckets.len() + 1], sum: 0, total: 0 } }
    pub fn record(&mut self, v_ms: u64) {
        self.total += 1;
        self.sum += v_ms as u128;
        for (i, b) in self.buckets.iter().enumerate() {
            if v_ms <= *b { self.counts[i] += 1; return; }
        }
        if let Some(last) = self.counts.last_mut() { *last += 1; }
    }
}

/// Counters shared by every worker of one process. Passed around inside the sync
/// context so separate engines (and tests) never share state.
#[derive(Debug)]
pub struct IngestionMetrics {
    request_latency: Mutex<Histogram>,
    pub http_requests: AtomicU64,
    pub http_retries: AtomicU64,
    pub http_not_modified: AtomicU64,
    pub http_failures: AtomicU64,
    pub breaker_opened: AtomicU64,
    pub breaker_short_circuits: AtomicU64,
    pub upsert_created: AtomicU64,
    pub upsert_updated: AtomicU64,
    pub upsert_unchanged: AtomicU64,
    pub malformed_records: AtomicU64,
    pub events_published: AtomicU64,
    pub events_failed: AtomicU64,
    pub links_resolved: AtomicU64,
    pub links_deferred: AtomicU64,
    pub links_rejected: AtomicU64,
    pub extraction_completed: AtomicU64,
    pub extraction_failed: AtomicU64,
    pub extraction_skipped: AtomicU64,
}

impl Default for IngestionMetrics {
    fn default() -> Self {
        Self {
            request_latency: Mutex::new(Histogram::new(REQUEST_LATENCY_BUCKETS)),
            http_requests: AtomicU64::new(0),
            http_retries: AtomicU64::new(0),
            http_not_modified: AtomicU64::new(0),
            http_failures: AtomicU64::new(0),
            breaker_opened: AtomicU64::new(0),
            breaker_short_circuits: AtomicU64::new(0),
            upsert_created: AtomicU64::new(0),
            upsert_updated: AtomicU64::new(0),
            upsert_unchanged: AtomicU64::new(0),
            malformed_records: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            events_failed: AtomicU64::new(0),
            links_resolved: AtomicU64::new(0),
            links_deferred: AtomicU64::new(0),
            links_rejected: AtomicU64::new(0),
            extraction_completed: AtomicU64::new(0),
            extraction_failed: AtomicU64::new(0),
            extraction_skipped: AtomicU64::new(0),
        }
    }
}

impl IngestionMetrics {
    pub fn new() -> Self { Self::default() }

    pub fn incr(counter: &AtomicU64) { counter.fetch_add(1, Ordering::Relaxed); }

    pub fn record_request_latency(&self, ms: u64) { if let Ok(mut h) = self.request_latency.lock() { h.record(ms); } }

    pub fn record_upsert(&self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created => Self::incr(&self.upsert_created),
            UpsertOutcome::Updated => Self::incr(&self.upsert_updated),
            UpsertOutcome::Unchanged => Self::incr(&self.upsert_unchanged),
        }
    }

    pub fn export_json(&self) -> serde_json::Value {
        let h = self.request_latency.lock().ok();
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        serde_json::json!({
            "request_latency_ms": h.map(|hh| serde_json::json!({
                "buckets": hh.buckets,
                "counts": hh.counts,
                "sum_ms": hh.sum as u64,
                "total": hh.total,
            })).unwrap_or(serde_json::Value::Null),
            "http": {
                "requests": load(&self.http_requests),
                "retries": load(&self.http_retries),
                "not_modified": load(&self.http_not_modified),
                "failures": load(&self.http_failures),
                "breaker_opened": load(&self.breaker_opened),
                "breaker_short_circuits": load(&self.breaker_short_circuits),
            },
            "upserts": {
                "created": load(&self.upsert_created),
                "updated": load(&self.upsert_updated),
                "unchanged": load(&self.upsert_unchanged),
                "malformed": load(&self.malformed_records),
            },
            "links": {
                "resolved": load(&self.links_resolved),
                "deferred": load(&self.links_deferred),
                "rejected": load(&self.links_rejected),
            },
            "events": {
                "published": load(&self.events_published),
                "failed": load(&self.events_failed),
            },
            "extraction": {
                "completed": load(&self.extraction_completed),
                "failed": load(&self.extraction_failed),
                "skipped": load(&self.extraction_skipped),
            }
        })
    }
}

/// Counter movement between two [`IngestionMetrics::export_json`] snapshots.
///
/// Numeric leaves are subtracted (floored at zero) and bucket bounds are kept as they
/// are. The counters are process wide, so a window that overlaps another source's
/// cycle also carries that cycle's activity.
pub fn delta_json(before: &serde_json::Value, after: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => Value::Object(
            a.iter()
                .map(|(k, av)| {
                    let v = match b.get(k) {
                        Some(_) if k == "buckets" => av.clone(),
                        Some(bv) => delta_json(bv, av),
                        None => av.clone(),
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        (Value::Array(b), Value::Array(a)) if a.len() == b.len() => {
            Value::Array(b.iter().zip(a).map(|(bv, av)| delta_json(bv, av)).collect())
        }
        (Value::Number(b), Value::Number(a)) => match (b.as_u64(), a.as_u64()) {
            (Some(b), Some(a)) => Value::from(a.saturating_sub(b)),
            _ => after.clone(),
        },
        _ => after.clone(),
    }
}
