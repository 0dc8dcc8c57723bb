//! Per-upstream health state and the derived status summary.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::TransportKind;

/// Consecutive failures at which a server is reported `down`.
const DOWN_THRESHOLD: u64 = 3;

/// Derived per-server status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Disabled,
    Healthy,
    Degraded,
    Down,
}

/// Point-in-time view of one server's health, sorted by id in
/// [`crate::upstream::UpstreamManager::get_health_snapshot`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub server_id: String,
    pub transport: TransportKind,
    pub enabled: bool,
    pub connected: bool,
    pub status: ServerStatus,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub consecutive_failures: u64,
    pub restarts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct HealthDetail {
    last_error: Option<String>,
    last_connected_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
}

/// Mutable health state for one upstream. Counters are atomics so the
/// status derivation can read them without locking; the derived status is
/// monotonic (down is sticky until a success) so torn reads are harmless.
#[derive(Debug)]
pub struct ServerHealth {
    transport: TransportKind,
    enabled: bool,
    connected: AtomicBool,
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    consecutive_failures: AtomicU64,
    restarts: AtomicU64,
    detail: Mutex<HealthDetail>,
}

impl ServerHealth {
    pub fn new(transport: TransportKind, enabled: bool) -> Self {
        Self {
            transport,
            enabled,
            connected: AtomicBool::new(false),
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            detail: Mutex::new(HealthDetail::default()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn record_call(&self) {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.detail.lock().unwrap().last_connected_at = Some(Utc::now());
    }

    pub fn record_disconnected(&self, reason: Option<String>) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(reason) = reason {
            self.detail.lock().unwrap().last_error = Some(reason);
        }
    }

    /// A successful call resets the failure streak and clears the armed
    /// retry gate.
    pub fn record_success(&self) {
        self.successful_calls.fetch_add(1, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        let mut detail = self.detail.lock().unwrap();
        detail.last_error = None;
        detail.next_retry_at = None;
        detail.last_success_at = Some(Utc::now());
    }

    /// Records one failed attempt and returns the new consecutive-failure
    /// count. The streak grows on every failure, retry or not; the
    /// operation-level `failed_calls` counter is bumped separately so that
    /// `successful + failed` never exceeds `total`.
    pub fn record_attempt_failure(&self, error: &str) -> u64 {
        let streak = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let mut detail = self.detail.lock().unwrap();
        detail.last_error = Some(error.to_string());
        detail.last_failure_at = Some(Utc::now());
        streak
    }

    /// Records the final failure of an operation, after retries are spent.
    pub fn record_call_failed(&self) {
        self.failed_calls.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_next_retry_at(&self, at: DateTime<Utc>) {
        self.detail.lock().unwrap().next_retry_at = Some(at);
    }

    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.detail.lock().unwrap().next_retry_at
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    fn status(&self) -> ServerStatus {
        if !self.enabled {
            return ServerStatus::Disabled;
        }
        let failures = self.consecutive_failures.load(Ordering::SeqCst);
        if failures >= DOWN_THRESHOLD {
            return ServerStatus::Down;
        }
        if self.connected.load(Ordering::SeqCst) && failures == 0 {
            return ServerStatus::Healthy;
        }
        ServerStatus::Degraded
    }

    pub fn snapshot(&self, server_id: &str) -> HealthSnapshot {
        let detail = self.detail.lock().unwrap();
        HealthSnapshot {
            server_id: server_id.to_string(),
            transport: self.transport,
            enabled: self.enabled,
            connected: self.connected.load(Ordering::SeqCst),
            status: self.status(),
            total_calls: self.total_calls.load(Ordering::SeqCst),
            successful_calls: self.successful_calls.load(Ordering::SeqCst),
            failed_calls: self.failed_calls.load(Ordering::SeqCst),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            restarts: self.restarts.load(Ordering::SeqCst),
            last_error: detail.last_error.clone(),
            last_connected_at: detail.last_connected_at,
            last_success_at: detail.last_success_at,
            last_failure_at: detail.last_failure_at,
            next_retry_at: detail.next_retry_at,
        }
    }
}
