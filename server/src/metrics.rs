// Metrics collection and tracking

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Latency samples kept for percentile estimates
const MAX_LATENCY_SAMPLES: usize = 1000;

/// Per-endpoint metrics
#[derive(Debug, Clone)]
pub struct EndpointMetrics {
    request_count: Arc<AtomicU64>,
    error_count: Arc<AtomicU64>,
    total_latency_ms: Arc<AtomicU64>,
    min_latency_ms: Arc<AtomicU64>,
    max_latency_ms: Arc<AtomicU64>,
    latency_samples: Arc<Mutex<VecDeque<u64>>>,
}

impl EndpointMetrics {
    pub fn new() -> Self {
        Self {
            request_count: Arc::new(AtomicU64::new(0)),
            error_count: Arc::new(AtomicU64::new(0)),
            total_latency_ms: Arc::new(AtomicU64::new(0)),
            min_latency_ms: Arc::new(AtomicU64::new(u64::MAX)),
            max_latency_ms: Arc::new(AtomicU64::new(0)),
            latency_samples: Arc::new(Mutex::new(VecDeque::with_capacity(MAX_LATENCY_SAMPLES))),
        }
    }

    pub fn record_request(&self, latency_ms: u64) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.min_latency_ms.fetch_min(latency_ms, Ordering::Relaxed);
        self.max_latency_ms.fetch_max(latency_ms, Ordering::Relaxed);

        if let Ok(mut samples) = self.latency_samples.lock() {
            if samples.len() == MAX_LATENCY_SAMPLES {
                samples.pop_front();
            }
            samples.push_back(latency_ms);
        }
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Start timing a request. The request is recorded when the guard drops,
    /// so one cancelled mid-flight (e.g. by the timeout layer) still counts,
    /// as an error.
    pub fn start_request(&self) -> RequestGuard {
        RequestGuard {
            metrics: self.clone(),
            started: Instant::now(),
            succeeded: false,
        }
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn avg_latency_ms(&self) -> f64 {
        let count = self.request_count();
        if count == 0 {
            return 0.0;
        }
        self.total_latency_ms.load(Ordering::Relaxed) as f64 / count as f64
    }

    fn percentile(&self, p: u8) -> u64 {
        let Ok(samples) = self.latency_samples.lock() else {
            return 0;
        };
        if samples.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let index = (sorted.len() * p as usize / 100).min(sorted.len() - 1);
        sorted[index]
    }

    pub fn stats(&self) -> EndpointStats {
        let min = self.min_latency_ms.load(Ordering::Relaxed);
        EndpointStats {
            request_count: self.request_count(),
            error_count: self.error_count(),
            avg_latency_ms: self.avg_latency_ms(),
            min_latency_ms: if min == u64::MAX { 0 } else { min },
            max_latency_ms: self.max_latency_ms.load(Ordering::Relaxed),
            p50_latency_ms: self.percentile(50),
            p95_latency_ms: self.percentile(95),
            p99_latency_ms: self.percentile(99),
        }
    }
}

impl Default for EndpointMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RequestGuard {
    metrics: EndpointMetrics,
    started: Instant,
    succeeded: bool,
}

impl RequestGuard {
    pub fn succeed(mut self) {
        self.succeeded = true;
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.metrics
            .record_request(self.started.elapsed().as_millis() as u64);
        if !self.succeeded {
            self.metrics.record_error();
        }
    }
}

/// Model-side counters: how long synthesis takes relative to the audio produced
#[derive(Debug, Clone, Default)]
pub struct SynthesisMetrics {
    synthesis_count: Arc<AtomicU64>,
    total_synthesis_time_ms: Arc<AtomicU64>,
    total_audio_ms: Arc<AtomicU64>,
    total_bytes_stored: Arc<AtomicU64>,
}

impl SynthesisMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_synthesis(&self, time_ms: u64, audio_ms: u64) {
        self.synthesis_count.fetch_add(1, Ordering::Relaxed);
        self.total_synthesis_time_ms.fetch_add(time_ms, Ordering::Relaxed);
        self.total_audio_ms.fetch_add(audio_ms, Ordering::Relaxed);
    }

    pub fn record_stored(&self, bytes: usize) {
        self.total_bytes_stored.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> SynthesisStats {
        let count = self.synthesis_count.load(Ordering::Relaxed);
        let synth_ms = self.total_synthesis_time_ms.load(Ordering::Relaxed);
        let audio_ms = self.total_audio_ms.load(Ordering::Relaxed);
        SynthesisStats {
            synthesis_count: count,
            avg_synthesis_time_ms: if count == 0 { 0.0 } else { synth_ms as f64 / count as f64 },
            total_audio_ms: audio_ms,
            real_time_factor: if audio_ms == 0 { 0.0 } else { synth_ms as f64 / audio_ms as f64 },
            total_bytes_stored: self.total_bytes_stored.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppMetrics {
    pub generate_speech: EndpointMetrics,
    pub synthesis: SynthesisMetrics,
}

impl AppMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Serialize)]
pub struct MetricsResponse {
    pub timestamp: DateTime<Utc>,
    pub system: SystemMetrics,
    pub endpoints: EndpointMetricsResponse,
    pub synthesis: SynthesisStats,
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

impl SystemMetrics {
    pub fn collect(request_count: u64, uptime_seconds: u64) -> Self {
        let mut system = sysinfo::System::new();
        system.refresh_cpu();
        system.refresh_memory();

        let memory_used = system.used_memory();
        let memory_total = system.total_memory();
        let memory_usage_percent = if memory_total > 0 {
            (memory_used as f64 / memory_total as f64 * 100.0) as f32
        } else {
            0.0
        };

        Self {
            cpu_usage_percent: system.global_cpu_info().cpu_usage(),
            memory_used_mb: memory_used / 1024 / 1024,
            memory_total_mb: memory_total / 1024 / 1024,
            memory_usage_percent,
            request_count,
            uptime_seconds,
            system_load: read_load_average(),
        }
    }
}

#[cfg(unix)]
fn read_load_average() -> Option<f64> {
    std::fs::read_to_string("/proc/loadavg")
        .ok()?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

#[cfg(not(unix))]
fn read_load_average() -> Option<f64> {
    None
}

#[derive(Serialize)]
pub struct EndpointMetricsResponse {
    pub generate_speech: EndpointStats,
}

#[derive(Debug, Serialize)]
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

#[derive(Debug, Serialize)]
pub struct SynthesisStats {
    pub synthesis_count: u64,
    pub avg_synthesis_time_ms: f64,
    pub total_audio_ms: u64,
    pub real_time_factor: f64,
    pub total_bytes_stored: u64,
}
