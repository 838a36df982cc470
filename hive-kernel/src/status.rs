use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Alias utilisé pour l'état partagé du service.
pub type Shared<T> = Arc<Mutex<T>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub uptime_seconds: u64,
    pub refreshes: u64,
    pub refresh_failures: u32,
    pub last_error: Option<String>,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

/// Santé du service snapshot lui-même (pas celle des participants).
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    start_time: Instant,
    refreshes: Arc<AtomicU64>,
    refresh_failures: Arc<AtomicU32>,
    last_error: Shared<Option<String>>,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Shared<String>,
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceStatus {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            refreshes: Arc::new(AtomicU64::new(0)),
            refresh_failures: Arc::new(AtomicU32::new(0)),
            last_error: Arc::new(Mutex::new(None)),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new("disabled".to_string())),
        }
    }

    pub fn record_refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = None;
    }

    pub fn record_failure(&self, error: impl ToString) {
        self.refresh_failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(error.to_string());
    }

    pub fn mark_mqtt_connecting(&self) {
        *self.mqtt_status.lock() = "connecting".to_string();
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn snapshot(&self) -> ServiceHealth {
        ServiceHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_are_cleared_by_the_next_refresh() {
        let status = ServiceStatus::new();
        status.record_failure("bus down");
        assert_eq!(status.snapshot().last_error.as_deref(), Some("bus down"));
        status.record_refresh();
        let health = status.snapshot();
        assert_eq!(health.refreshes, 1);
        assert_eq!(health.refresh_failures, 1);
        assert!(health.last_error.is_none());
        assert_eq!(health.mqtt_status, "disabled");
    }
}
