//! Circuit breaker derived from recent dispatch outcomes.
//!
//! The breaker keeps no counters of its own: the failure ratio is recomputed
//! from the last `window` terminal ledger entries on every evaluation. Only
//! the open/half-open state is persisted, as a sentinel document whose
//! absence means closed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::audit_log::{AuditAction, AuditCategory, AuditLevel, AuditLog, AuditRecord};
use super::dispatch_ledger::DispatchLedger;
use crate::domain::errors::StorageError;
use crate::domain::models::{duration_from_secs, BreakerConfig, BreakerSentinel, CircuitState};
use crate::infrastructure::storage::{JsonDocument, StateLayout};

const ACTOR: &str = "circuit_breaker";

/// Result of an evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStatus {
    pub state: CircuitState,
    pub fail_ratio: f64,
    pub samples: usize,
    pub failures: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    pub probes: u32,
}

impl BreakerStatus {
    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    ledger: DispatchLedger,
    sentinel: JsonDocument<BreakerSentinel>,
    audit: AuditLog,
}

struct Window {
    ratio: f64,
    samples: usize,
    failures: usize,
}

impl CircuitBreaker {
    pub fn new(layout: &StateLayout, config: BreakerConfig) -> Self {
        Self {
            config,
            ledger: DispatchLedger::new(layout.ledger()),
            sentinel: JsonDocument::new(layout.breaker()),
            audit: AuditLog::new(layout.audit()),
        }
    }

    fn window(&self) -> Result<Window, StorageError> {
        let recent = self.ledger.recent_terminal(self.config.window)?;
        let samples = recent.len();
        let failures = recent.iter().filter(|e| e.state.is_failure()).count();
        #[allow(clippy::cast_precision_loss)]
        let ratio = if samples == 0 {
            0.0
        } else {
            failures as f64 / samples as f64
        };
        Ok(Window {
            ratio,
            samples,
            failures,
        })
    }

    fn trips(&self, window: &Window) -> bool {
        window.samples >= self.config.min_samples && window.ratio >= self.config.threshold
    }

    fn status(state: CircuitState, window: &Window, sentinel: Option<&BreakerSentinel>) -> BreakerStatus {
        BreakerStatus {
            state,
            fail_ratio: window.ratio,
            samples: window.samples,
            failures: window.failures,
            opened_at: sentinel.map(|s| s.opened_at),
            probes: sentinel.map_or(0, |s| s.probes),
        }
    }

    /// Persisted state plus the current ratio, without transitioning.
    pub fn peek(&self) -> Result<BreakerStatus, StorageError> {
        let window = self.window()?;
        let sentinel = self.sentinel.load()?;
        let state = sentinel.as_ref().map_or(CircuitState::Closed, |s| s.state);
        Ok(Self::status(state, &window, sentinel.as_ref()))
    }

    /// Evaluate and apply any due transition.
    pub fn evaluate(&self, now: DateTime<Utc>) -> Result<BreakerStatus, StorageError> {
        let window = self.window()?;
        if !self.config.enabled {
            return Ok(Self::status(CircuitState::Closed, &window, None));
        }

        let Some(mut sentinel) = self.sentinel.load()? else {
            if self.trips(&window) {
                return self.open(now, &window, "failure ratio reached threshold");
            }
            return Ok(Self::status(CircuitState::Closed, &window, None));
        };

        match sentinel.state {
            CircuitState::Closed => {
                // A closed sentinel should not exist; treat it as absent.
                self.sentinel.remove()?;
                if self.trips(&window) {
                    return self.open(now, &window, "failure ratio reached threshold");
                }
                Ok(Self::status(CircuitState::Closed, &window, None))
            }
            CircuitState::Open => {
                let cooldown = duration_from_secs(sentinel.cooldown_sec);
                if now - sentinel.opened_at < cooldown {
                    return Ok(Self::status(CircuitState::Open, &window, Some(&sentinel)));
                }
                sentinel.state = CircuitState::HalfOpen;
                sentinel.half_opened_at = Some(now);
                sentinel.probes = 0;
                self.sentinel.save(&sentinel)?;
                info!(fail_ratio = window.ratio, "circuit breaker half-open");
                self.audit.record(
                    &AuditRecord::new(
                        AuditLevel::Warning,
                        AuditCategory::Breaker,
                        AuditAction::CircuitHalfOpened,
                        ACTOR,
                        "cooldown elapsed, probing",
                    )
                    .with_detail("fail_ratio", json!(window.ratio)),
                )?;
                Ok(Self::status(CircuitState::HalfOpen, &window, Some(&sentinel)))
            }
            CircuitState::HalfOpen => {
                let since = sentinel.half_opened_at.unwrap_or(sentinel.opened_at);
                let probe_failed = self
                    .ledger
                    .terminal_since(since)?
                    .iter()
                    .any(|e| e.state.is_failure());
                if probe_failed {
                    return self.open(now, &window, "probe failed while half-open");
                }
                if window.ratio < self.config.threshold {
                    self.close(&window)?;
                    return Ok(Self::status(CircuitState::Closed, &window, None));
                }
                Ok(Self::status(CircuitState::HalfOpen, &window, Some(&sentinel)))
            }
        }
    }

    /// Evaluate at the top of a dispatch cycle, counting half-open cycles
    /// against `half_open_max_probes`.
    pub fn begin_cycle(&self, now: DateTime<Utc>) -> Result<BreakerStatus, StorageError> {
        let status = self.evaluate(now)?;
        if status.state != CircuitState::HalfOpen {
            return Ok(status);
        }

        let Some(mut sentinel) = self.sentinel.load()? else {
            return Ok(status);
        };
        if let Some(max) = self.config.half_open_max_probes {
            if sentinel.probes >= max {
                let window = self.window()?;
                return self.open(now, &window, "half-open probes exhausted without recovery");
            }
        }
        sentinel.probes += 1;
        self.sentinel.save(&sentinel)?;
        Ok(BreakerStatus {
            probes: sentinel.probes,
            ..status
        })
    }

    /// Drop any persisted state.
    pub fn reset(&self) -> Result<(), StorageError> {
        self.sentinel.remove()
    }

    fn open(&self, now: DateTime<Utc>, window: &Window, reason: &str) -> Result<BreakerStatus, StorageError> {
        let sentinel = BreakerSentinel {
            state: CircuitState::Open,
            opened_at: now,
            fail_ratio: window.ratio,
            cooldown_sec: self.config.cooldown_secs,
            half_opened_at: None,
            probes: 0,
        };
        self.sentinel.save(&sentinel)?;
        warn!(
            fail_ratio = window.ratio,
            samples = window.samples,
            reason,
            "circuit breaker opened"
        );
        self.audit.record(
            &AuditRecord::new(
                AuditLevel::Critical,
                AuditCategory::Breaker,
                AuditAction::CircuitOpened,
                ACTOR,
                reason,
            )
            .with_detail("fail_ratio", json!(window.ratio))
            .with_detail("samples", json!(window.samples))
            .with_detail("cooldown_sec", json!(self.config.cooldown_secs)),
        )?;
        Ok(Self::status(CircuitState::Open, window, Some(&sentinel)))
    }

    fn close(&self, window: &Window) -> Result<(), StorageError> {
        self.sentinel.remove()?;
        info!(fail_ratio = window.ratio, "circuit breaker closed");
        self.audit.record(
            &AuditRecord::new(
                AuditLevel::Info,
                AuditCategory::Breaker,
                AuditAction::CircuitClosed,
                ACTOR,
                "failure ratio recovered",
            )
            .with_detail("fail_ratio", json!(window.ratio)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::LedgerState;
    use tempfile::TempDir;

    fn setup(config: BreakerConfig) -> (TempDir, StateLayout, CircuitBreaker, DispatchLedger) {
        let dir = TempDir::new().unwrap();
        let layout = StateLayout::new(dir.path());
        let breaker = CircuitBreaker::new(&layout, config);
        let ledger = DispatchLedger::new(layout.ledger());
        (dir, layout, breaker, ledger)
    }

    fn record(ledger: &DispatchLedger, state: LedgerState, n: usize) {
        for i in 0..n {
            ledger
                .transition(&format!("{}-{i}", state.as_str()), state, "t", json!(null))
                .unwrap();
        }
    }

    #[test]
    fn test_stays_closed_below_min_samples() {
        let (_dir, layout, breaker, ledger) = setup(BreakerConfig::default());
        record(&ledger, LedgerState::Failed, 9);

        let status = breaker.evaluate(Utc::now()).unwrap();
        assert_eq!(status.state, CircuitState::Closed);
        assert!(!layout.breaker().exists());
    }

    #[test]
    fn test_opens_at_threshold_and_persists() {
        let (_dir, layout, breaker, ledger) = setup(BreakerConfig::default());
        record(&ledger, LedgerState::Acked, 5);
        record(&ledger, LedgerState::Failed, 5);

        let status = breaker.evaluate(Utc::now()).unwrap();
        assert!(status.is_open());
        assert!((status.fail_ratio - 0.5).abs() < f64::EPSILON);
        assert!(layout.breaker().exists());

        // skipped entries are not terminal and do not dilute the ratio
        record(&ledger, LedgerState::Skipped, 10);
        assert!(breaker.evaluate(Utc::now()).unwrap().is_open());
    }

    #[test]
    fn test_half_open_after_cooldown_then_closes_on_recovery() {
        let (_dir, layout, breaker, ledger) = setup(BreakerConfig {
            cooldown_secs: 60,
            ..BreakerConfig::default()
        });
        record(&ledger, LedgerState::Failed, 10);
        let opened = Utc::now();
        assert!(breaker.evaluate(opened).unwrap().is_open());

        let later = opened + chrono::Duration::seconds(61);
        assert_eq!(breaker.evaluate(later).unwrap().state, CircuitState::HalfOpen);

        record(&ledger, LedgerState::Acked, 20);
        let status = breaker.evaluate(later + chrono::Duration::seconds(1)).unwrap();
        assert_eq!(status.state, CircuitState::Closed);
        assert!(!layout.breaker().exists());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (_dir, _layout, breaker, ledger) = setup(BreakerConfig {
            cooldown_secs: 0,
            ..BreakerConfig::default()
        });
        record(&ledger, LedgerState::Failed, 10);
        let t0 = Utc::now();
        assert!(breaker.evaluate(t0).unwrap().is_open());
        assert_eq!(breaker.evaluate(t0).unwrap().state, CircuitState::HalfOpen);

        std::thread::sleep(std::time::Duration::from_millis(5));
        record(&ledger, LedgerState::Failed, 1);
        assert!(breaker.evaluate(Utc::now()).unwrap().is_open());
    }

    #[test]
    fn test_probe_budget_exhaustion_reopens() {
        let (_dir, _layout, breaker, ledger) = setup(BreakerConfig {
            cooldown_secs: 0,
            half_open_max_probes: Some(1),
            ..BreakerConfig::default()
        });
        record(&ledger, LedgerState::Failed, 10);
        let t0 = Utc::now();
        breaker.evaluate(t0).unwrap();

        let first = breaker.begin_cycle(t0).unwrap();
        assert_eq!(first.state, CircuitState::HalfOpen);
        assert_eq!(first.probes, 1);

        let second = breaker.begin_cycle(t0).unwrap();
        assert!(second.is_open());
    }

    #[test]
    fn test_disabled_breaker_is_closed() {
        let (_dir, _layout, breaker, ledger) = setup(BreakerConfig {
            enabled: false,
            ..BreakerConfig::default()
        });
        record(&ledger, LedgerState::Failed, 20);
        assert_eq!(breaker.evaluate(Utc::now()).unwrap().state, CircuitState::Closed);
    }
}
