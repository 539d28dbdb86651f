// Metrics collection and tracking

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tts_core::{PipelineError, StreamSummary};

const LATENCY_WINDOW: usize = 1000;

/// Per-endpoint metrics
#[derive(Debug, Clone)]
pub struct EndpointMetrics {
    pub request_count: Arc<AtomicU64>,
    pub error_count: Arc<AtomicU64>,
    pub total_latency_ms: Arc<AtomicU64>,
    pub min_latency_ms: Arc<AtomicU64>,
    pub max_latency_ms: Arc<AtomicU64>,
    // Last `LATENCY_WINDOW` samples, for percentiles
    pub latency_samples: Arc<std::sync::Mutex<VecDeque<u64>>>,
}

impl EndpointMetrics {
    pub fn new() -> Self {
        Self {
            request_count: Arc::new(AtomicU64::new(0)),
            error_count: Arc::new(AtomicU64::new(0)),
            total_latency_ms: Arc::new(AtomicU64::new(0)),
            min_latency_ms: Arc::new(AtomicU64::new(u64::MAX)),
            max_latency_ms: Arc::new(AtomicU64::new(0)),
            latency_samples: Arc::new(std::sync::Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW))),
        }
    }

    pub fn record_request(&self, latency_ms: u64) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        
        let mut current_min = self.min_latency_ms.load(Ordering::Relaxed);
        while latency_ms < current_min {
            match self.min_latency_ms.compare_exchange_weak(
                current_min,
                latency_ms,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => current_min = x,
            }
        }
        
        let mut current_max = self.max_latency_ms.load(Ordering::Relaxed);
        while latency_ms > current_max {
            match self.max_latency_ms.compare_exchange_weak(
                current_max,
                latency_ms,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => current_max = x,
            }
        }
        
        if let Ok(mut samples) = self.latency_samples.lock() {
            if samples.len() == LATENCY_WINDOW {
                samples.pop_front();
            }
            samples.push_back(latency_ms);
        }
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn avg_latency_ms(&self) -> f64 {
        let count = self.request_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        let total = self.total_latency_ms.load(Ordering::Relaxed);
        total as f64 / count as f64
    }

    pub fn p50_latency_ms(&self) -> u64 {
        self.percentile(50)
    }

    pub fn p95_latency_ms(&self) -> u64 {
        self.percentile(95)
    }

    pub fn p99_latency_ms(&self) -> u64 {
        self.percentile(99)
    }

    fn percentile(&self, p: u8) -> u64 {
        if let Ok(samples) = self.latency_samples.lock() {
            if samples.is_empty() {
                return 0;
            }
            let mut sorted: Vec<u64> = samples.iter().copied().collect();
            sorted.sort_unstable();
            let index = (sorted.len() * p as usize / 100).min(sorted.len() - 1);
            sorted[index]
        } else {
            0
        }
    }
}

impl Default for EndpointMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Delivery counters shared by both audio endpoints
#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub completed: Arc<AtomicU64>,
    pub units: Arc<AtomicU64>,
    pub synthesis_time_us: Arc<AtomicU64>,
    pub chunks_out: Arc<AtomicU64>,
    pub bytes_out: Arc<AtomicU64>,
    pub disconnects: Arc<AtomicU64>,
    pub timeouts: Arc<AtomicU64>,
    pub synthesis_errors: Arc<AtomicU64>,
    pub encoding_errors: Arc<AtomicU64>,
    pub rejected: Arc<AtomicU64>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            completed: Arc::new(AtomicU64::new(0)),
            units: Arc::new(AtomicU64::new(0)),
            synthesis_time_us: Arc::new(AtomicU64::new(0)),
            chunks_out: Arc::new(AtomicU64::new(0)),
            bytes_out: Arc::new(AtomicU64::new(0)),
            disconnects: Arc::new(AtomicU64::new(0)),
            timeouts: Arc::new(AtomicU64::new(0)),
            synthesis_errors: Arc::new(AtomicU64::new(0)),
            encoding_errors: Arc::new(AtomicU64::new(0)),
            rejected: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_completed(&self, summary: &StreamSummary) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.units.fetch_add(summary.units as u64, Ordering::Relaxed);
        let synthesis_us = u64::try_from(summary.synthesis.as_micros()).unwrap_or(u64::MAX);
        self.synthesis_time_us.fetch_add(synthesis_us, Ordering::Relaxed);
        self.chunks_out.fetch_add(summary.chunks as u64, Ordering::Relaxed);
        self.bytes_out.fetch_add(summary.bytes, Ordering::Relaxed);
    }

    pub fn record_failure(&self, err: &PipelineError) {
        let counter = match err {
            PipelineError::EmptyInput => &self.rejected,
            PipelineError::Synthesis { .. } => &self.synthesis_errors,
            PipelineError::Encoding { .. } => &self.encoding_errors,
            PipelineError::Timeout { .. } => &self.timeouts,
            PipelineError::ClientDisconnected => &self.disconnects,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineMetricsResponse {
        let load = |c: &Arc<AtomicU64>| c.load(Ordering::Relaxed);
        let units = load(&self.units);
        let synthesis_ms = load(&self.synthesis_time_us) as f64 / 1000.0;
        PipelineMetricsResponse {
            completed: load(&self.completed),
            units,
            synthesis_time_ms: synthesis_ms,
            avg_synthesis_time_ms: if units == 0 {
                0.0
            } else {
                synthesis_ms / units as f64
            },
            chunks_out: load(&self.chunks_out),
            bytes_out: load(&self.bytes_out),
            disconnects: load(&self.disconnects),
            timeouts: load(&self.timeouts),
            synthesis_errors: load(&self.synthesis_errors),
            encoding_errors: load(&self.encoding_errors),
            rejected: load(&self.rejected),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppMetrics {
    pub speak: EndpointMetrics,
    pub tts: EndpointMetrics,
    pub pipeline: PipelineMetrics,
}

impl AppMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Serialize)]
pub struct DetailedMetricsResponse {
    pub timestamp: DateTime<Utc>,
    pub system: SystemMetrics,
    pub endpoints: EndpointMetricsResponse,
    pub pipeline: PipelineMetricsResponse,
}

#[derive(Serialize)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub memory_usage_percent: f32,
    pub request_count: u64,
    pub uptime_seconds: u64,
    pub system_load: Option<f64>,
}

#[derive(Serialize)]
pub struct EndpointMetricsResponse {
    pub speak: EndpointStats,
    pub tts: EndpointStats,
}

#[derive(Serialize)]
pub struct EndpointStats {
    pub request_count: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
}

impl From<&EndpointMetrics> for EndpointStats {
    fn from(m: &EndpointMetrics) -> Self {
        let min = m.min_latency_ms.load(Ordering::Relaxed);
        Self {
            request_count: m.request_count.load(Ordering::Relaxed),
            error_count: m.error_count.load(Ordering::Relaxed),
            avg_latency_ms: m.avg_latency_ms(),
            min_latency_ms: if min == u64::MAX { 0 } else { min },
            max_latency_ms: m.max_latency_ms.load(Ordering::Relaxed),
            p50_latency_ms: m.p50_latency_ms(),
            p95_latency_ms: m.p95_latency_ms(),
            p99_latency_ms: m.p99_latency_ms(),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct PipelineMetricsResponse {
    pub completed: u64,
    pub units: u64,
    /// Model time summed over completed requests
    pub synthesis_time_ms: f64,
    pub avg_synthesis_time_ms: f64,
    pub chunks_out: u64,
    pub bytes_out: u64,
    pub disconnects: u64,
    pub timeouts: u64,
    pub synthesis_errors: u64,
    pub encoding_errors: u64,
    pub rejected: u64,
}
