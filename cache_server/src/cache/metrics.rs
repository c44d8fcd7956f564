use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

const AVG_RESPONSE_TIME_WEIGHT: f64 = 0.4;
const MISS_RATIO_WEIGHT: f64 = 0.3;
const REQUEST_RATE_WEIGHT: f64 = 0.3;

/// Window after which the request rate term decays to zero
const RATE_WINDOW_MS: i64 = 60_000;

/// Request counters of one cache instance
#[derive(Debug, Default)]
pub struct CacheMetrics {
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    remote_hits: AtomicU64,
    response_micros: AtomicU64,
    last_update_ms: AtomicI64,
}

/// Serializable view of CacheMetrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub request_count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub remote_hit_count: u64,
    pub total_response_time: f64,
    pub load_score: f64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one read request
    pub fn record(&self, hit: bool, remote: bool, elapsed: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        if remote {
            self.remote_hits.fetch_add(1, Ordering::Relaxed);
        }
        self.response_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.last_update_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Load score, lower is better
    pub fn load_score(&self) -> f64 {
        self.score_at(chrono::Utc::now().timestamp_millis())
    }

    fn score_at(&self, now_ms: i64) -> f64 {
        let requests = self.requests.load(Ordering::Relaxed);
        if requests == 0 {
            return 0.0;
        }

        let avg_response_secs =
            self.response_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0 / requests as f64;
        let miss_ratio = self.misses.load(Ordering::Relaxed) as f64 / requests as f64;

        let idle_ms = (now_ms - self.last_update_ms.load(Ordering::Relaxed)).max(0);
        let recency = (idle_ms as f64 / RATE_WINDOW_MS as f64).min(1.0);
        let request_rate = requests as f64 * (1.0 - recency);

        avg_response_secs * AVG_RESPONSE_TIME_WEIGHT
            + miss_ratio * MISS_RATIO_WEIGHT
            + request_rate * REQUEST_RATE_WEIGHT
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            request_count: self.requests.load(Ordering::Relaxed),
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            remote_hit_count: self.remote_hits.load(Ordering::Relaxed),
            total_response_time: self.response_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            load_score: self.load_score(),
        }
    }
}
