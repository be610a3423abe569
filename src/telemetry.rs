use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::info;

use crate::runtime::{ExecutionResult, Language};
use crate::sandbox::ErrorKind;

const MAX_EVENTS: usize = 256;

/// Something worth alerting on: a rejected submission or a killed process.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    pub event_type: ErrorKind,
    pub severity: String,
    pub description: String,
    pub language: Option<Language>,
    pub identity: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Serializable view of the counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub started_at: DateTime<Utc>,
    pub executions: u64,
    pub successes: u64,
    pub failures: HashMap<ErrorKind, u64>,
    pub average_elapsed_ms: f64,
    pub peak_memory_bytes: u64,
    pub recent_events: Vec<SecurityEvent>,
}

#[derive(Default)]
struct Counters {
    executions: u64,
    successes: u64,
    failures: HashMap<ErrorKind, u64>,
    total_elapsed_ms: u64,
    peak_memory_bytes: u64,
    events: VecDeque<SecurityEvent>,
}

/// Execution counters for one service instance.
pub struct Telemetry {
    started_at: DateTime<Utc>,
    counters: Mutex<Counters>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Folds one finished (or rejected) request into the counters.
    pub fn record_execution(&self, language: Option<Language>, identity: Option<&str>, result: &ExecutionResult) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.executions += 1;
        counters.total_elapsed_ms += result.stats.elapsed_ms;
        counters.peak_memory_bytes = counters.peak_memory_bytes.max(result.stats.peak_memory_bytes);

        let Some(kind) = result.error_kind else {
            counters.successes += 1;
            return;
        };
        *counters.failures.entry(kind).or_insert(0) += 1;

        let severity = match kind {
            ErrorKind::SecurityViolation => "critical",
            ErrorKind::ExecutionTimeout | ErrorKind::OutputLimitExceeded => "warning",
            ErrorKind::RateLimitExceeded | ErrorKind::QueueTimeout => "info",
            _ => return,
        };
        let event = SecurityEvent {
            event_type: kind,
            severity: severity.to_string(),
            description: result.error.clone().unwrap_or_default(),
            language,
            identity: identity.map(str::to_string),
            timestamp: Utc::now(),
        };
        info!(kind = ?event.event_type, severity, "Recorded security event");
        if counters.events.len() == MAX_EVENTS {
            counters.events.pop_front();
        }
        counters.events.push_back(event);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let average_elapsed_ms = if counters.executions == 0 {
            0.0
        } else {
            counters.total_elapsed_ms as f64 / counters.executions as f64
        };
        TelemetrySnapshot {
            started_at: self.started_at,
            executions: counters.executions,
            successes: counters.successes,
            failures: counters.failures.clone(),
            average_elapsed_ms,
            peak_memory_bytes: counters.peak_memory_bytes,
            recent_events: counters.events.iter().cloned().collect(),
        }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceStats;
    use crate::sandbox::SandboxError;

    fn stats(elapsed_ms: u64, peak_memory_bytes: u64) -> ResourceStats {
        ResourceStats { elapsed_ms, peak_memory_bytes }
    }

    #[test]
    fn test_counts_successes_and_failures() {
        let telemetry = Telemetry::new();
        let ok = ExecutionResult::completed("5".into(), String::new(), 0, stats(10, 2048));
        let timeout = ExecutionResult::failed(&SandboxError::Timeout(500), stats(30, 1024));

        telemetry.record_execution(Some(Language::Python), Some("alice"), &ok);
        telemetry.record_execution(Some(Language::Python), Some("alice"), &timeout);

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.executions, 2);
        assert_eq!(snapshot.successes, 1);
        assert_eq!(snapshot.failures.get(&ErrorKind::ExecutionTimeout), Some(&1));
        assert_eq!(snapshot.average_elapsed_ms, 20.0);
        assert_eq!(snapshot.peak_memory_bytes, 2048);
        assert_eq!(snapshot.recent_events.len(), 1);
        assert_eq!(snapshot.recent_events[0].identity.as_deref(), Some("alice"));
    }

    #[test]
    fn test_runtime_errors_are_not_security_events() {
        let telemetry = Telemetry::new();
        let crashed = ExecutionResult::failed(&SandboxError::RuntimeError("exit 1".into()), stats(1, 0));
        telemetry.record_execution(Some(Language::Cpp), None, &crashed);
        assert!(telemetry.snapshot().recent_events.is_empty());
    }

    #[test]
    fn test_event_log_is_bounded() {
        let telemetry = Telemetry::new();
        let denied = ExecutionResult::failed(&SandboxError::SecurityViolation("eval".into()), stats(0, 0));
        for _ in 0..(MAX_EVENTS + 10) {
            telemetry.record_execution(Some(Language::JavaScript), None, &denied);
        }
        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.recent_events.len(), MAX_EVENTS);
        assert_eq!(snapshot.executions, (MAX_EVENTS + 10) as u64);
    }

    #[test]
    fn test_snapshot_serializes() {
        let telemetry = Telemetry::new();
        let denied = ExecutionResult::failed(&SandboxError::RateLimitExceeded("bob".into()), stats(0, 0));
        telemetry.record_execution(None, Some("bob"), &denied);
        let json = serde_json::to_value(telemetry.snapshot()).unwrap();
        assert_eq!(json["failures"]["RateLimitExceeded"], 1);
        assert_eq!(json["recentEvents"][0]["severity"], "info");
    }
}
