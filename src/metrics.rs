//! In-process conversion counters.
//!
//! One instance per [`crate::convert::Dispatcher`]; clones of the dispatcher
//! share it. Counters are lock-free and only ever grow; read them through
//! [`ConversionMetrics::snapshot`].

use crate::error::ErrorCode;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters.
#[derive(Debug, Default)]
pub struct ConversionMetrics {
    requests: AtomicU64,
    successes: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    file_not_found: AtomicU64,
    unsupported_type: AtomicU64,
    convert_failed: AtomicU64,
    ocr_failed: AtomicU64,
    encoding_failed: AtomicU64,
}

/// Point-in-time copy of [`ConversionMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: BTreeMap<String, u64>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// `hits / (hits + misses)`, 0 before the first lookup.
    pub cache_hit_ratio: f64,
}

impl MetricsSnapshot {
    pub fn total_failures(&self) -> u64 {
        self.failures.values().sum()
    }
}

impl ConversionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, code: ErrorCode) {
        self.failure_counter(code).fetch_add(1, Ordering::Relaxed);
    }

    fn failure_counter(&self, code: ErrorCode) -> &AtomicU64 {
        match code {
            ErrorCode::FileNotFound => &self.file_not_found,
            ErrorCode::FileTypeUnsupported => &self.unsupported_type,
            ErrorCode::ConvertFailed => &self.convert_failed,
            ErrorCode::OcrFailed => &self.ocr_failed,
            ErrorCode::EncodingDetectionFailed => &self.encoding_failed,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.cache_misses.load(Ordering::Relaxed);
        let lookups = cache_hits + cache_misses;

        let failures = [
            ErrorCode::FileNotFound,
            ErrorCode::FileTypeUnsupported,
            ErrorCode::ConvertFailed,
            ErrorCode::OcrFailed,
            ErrorCode::EncodingDetectionFailed,
        ]
        .into_iter()
        .filter_map(|code| {
            let n = self.failure_counter(code).load(Ordering::Relaxed);
            (n > 0).then(|| (code.as_str().to_string(), n))
        })
        .collect();

        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures,
            cache_hits,
            cache_misses,
            cache_hit_ratio: if lookups == 0 {
                0.0
            } else {
                cache_hits as f64 / lookups as f64
            },
        }
    }
}
