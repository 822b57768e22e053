//! # Application State Management
//!
//! Shared state accessed by every request handler: the live configuration,
//! service-wide counters, and the server start time. All mutable pieces are
//! behind `Arc<RwLock<_>>` so handlers on different workers can read
//! concurrently while updates stay exclusive.

use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// State shared across all HTTP and WebSocket handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Live configuration (updatable at runtime via `PUT /config`)
    pub config: Arc<RwLock<AppConfig>>,

    /// Service-wide counters
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected across all requests and streams.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total HTTP requests processed since startup
    pub request_count: u64,

    /// Total request errors since startup
    pub error_count: u64,

    /// Currently open streaming transcription sessions
    pub active_streams: u32,

    /// Per-endpoint statistics keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Statistics for one endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Snapshot of the current configuration.
    ///
    /// Cloning releases the read lock immediately; `AppConfig` is cheap to
    /// clone.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().unwrap().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().unwrap().error_count += 1;
    }

    /// Record one finished request against its endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let entry = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        entry.request_count += 1;
        entry.total_duration_ms += duration_ms;
        if is_error {
            entry.error_count += 1;
        }
    }

    /// A streaming session entered the `Streaming` phase.
    pub fn stream_opened(&self) {
        self.metrics.write().unwrap().active_streams += 1;
    }

    /// A streaming session closed (any path).
    pub fn stream_closed(&self) {
        let mut metrics = self.metrics.write().unwrap();
        // Guard against double-close underflow.
        if metrics.active_streams > 0 {
            metrics.active_streams -= 1;
        }
    }

    /// Consistent copy of the metrics for the `/metrics` endpoint.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_streams: metrics.active_streams,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_counters_never_underflow() {
        let state = AppState::new(AppConfig::default());
        state.stream_closed();
        assert_eq!(state.get_metrics_snapshot().active_streams, 0);

        state.stream_opened();
        state.stream_opened();
        state.stream_closed();
        assert_eq!(state.get_metrics_snapshot().active_streams, 1);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = AppState::new(AppConfig::default());
        state.record_endpoint_request("POST /transcribe", 120, false);
        state.record_endpoint_request("POST /transcribe", 80, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["POST /transcribe"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.error_count, 1);
        assert_eq!(metric.average_duration_ms(), 100.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[test]
    fn test_config_update_validates() {
        let state = AppState::new(AppConfig::default());
        let mut bad = state.get_config();
        bad.server.port = 0;
        assert!(state.update_config(bad).is_err());
    }
}
