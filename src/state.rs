//! # Application State Management
//!
//! Shared state accessed by every HTTP request handler and WebSocket
//! session. The configuration is loaded once at startup and treated as
//! read-only afterwards (sessions snapshot it on accept), so the only
//! genuinely mutable shared data is the metrics store.
//!
//! ## Thread Safety:
//! Everything mutable sits behind `Arc<RwLock<...>>`: many readers or one
//! writer, never both. Handlers clone what they need out of the lock rather
//! than holding it across I/O.

use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Shared application state injected into every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (read-only after startup)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request and session metrics, updated by middleware and sessions
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started (for uptime reporting)
    pub start_time: Instant,
}

/// Counters collected across all requests and voice sessions.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total HTTP requests processed since startup
    pub request_count: u64,

    /// Total errored requests since startup
    pub error_count: u64,

    /// Voice sessions currently connected
    pub active_sessions: u32,

    /// Voice sessions accepted since startup
    pub sessions_started: u64,

    /// Voice sessions that ran to completion (or closed) since startup
    pub sessions_completed: u64,

    /// Per-endpoint request statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Request statistics for one endpoint.
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

    /// Snapshot of the configuration. Cloning releases the lock immediately
    /// so sessions never contend with request handlers.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record per-endpoint stats for one completed request.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// A voice session was accepted.
    pub fn increment_active_sessions(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.active_sessions += 1;
        metrics.sessions_started += 1;
    }

    /// A voice session closed.
    pub fn decrement_active_sessions(&self) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
        metrics.sessions_completed += 1;
    }

    /// Consistent copy of the metrics for the health/metrics endpoints.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_sessions: metrics.active_sessions,
            sessions_started: metrics.sessions_started,
            sessions_completed: metrics.sessions_completed,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time for this endpoint, in milliseconds.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate for this endpoint, 0.0 to 1.0.
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
    fn test_session_counters() {
        let state = AppState::new(AppConfig::default());
        state.increment_active_sessions();
        state.increment_active_sessions();
        state.decrement_active_sessions();

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.active_sessions, 1);
        assert_eq!(metrics.sessions_started, 2);
        assert_eq!(metrics.sessions_completed, 1);

        // Underflow protection
        state.decrement_active_sessions();
        state.decrement_active_sessions();
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = AppState::new(AppConfig::default());
        state.record_endpoint_request("POST /api/v1/chat", 20, false);
        state.record_endpoint_request("POST /api/v1/chat", 40, true);

        let metrics = state.get_metrics_snapshot();
        let endpoint = metrics.endpoint_metrics.get("POST /api/v1/chat").unwrap();
        assert_eq!(endpoint.request_count, 2);
        assert_eq!(endpoint.average_duration_ms(), 30.0);
        assert_eq!(endpoint.error_rate(), 0.5);
    }
}
