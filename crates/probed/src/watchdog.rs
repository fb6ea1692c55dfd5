//! Stuck detection for the task in progress.
//!
//! After each decision the watchdog turns the oracle's signals and the
//! task's attempt count into a verdict:
//! - completion always wins, even on the cycle the ceiling is reached
//! - an explicit stuck report from the oracle
//! - the attempt ceiling, regardless of what the oracle said

use tracing::{debug, info};

/// Watchdog configuration.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Cycles a task may spend in progress (default 50).
    pub max_attempts: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { max_attempts: 50 }
    }
}

/// Why a task was declared stuck.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StuckSignal {
    /// The oracle said no further progress is possible.
    Reported(String),
    AttemptCeiling { attempts: u32, max: u32 },
}

impl StuckSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reported(_) => "reported",
            Self::AttemptCeiling { .. } => "attempt_ceiling",
        }
    }

    /// Human-readable reason handed to the stuck handler.
    pub fn describe(&self, last_analysis: &str) -> String {
        match self {
            Self::Reported(reason) => reason.clone(),
            Self::AttemptCeiling { attempts, max } => {
                let mut reason = format!(
                    "attempt ceiling exceeded: {attempts} cycles without completion (max {max})"
                );
                if !last_analysis.is_empty() {
                    reason.push_str(". Last analysis: ");
                    reason.push_str(last_analysis);
                }
                reason
            }
        }
    }
}

/// What the signals of one cycle mean for the current task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskVerdict {
    Continue,
    Completed { result: String },
    Stuck { signal: StuckSignal, reason: String },
}

/// Signals gathered from one decision.
#[derive(Debug, Clone, Default)]
pub struct CycleSignals {
    pub completed: bool,
    pub result: String,
    pub reported_stuck: bool,
    pub stuck_reason: Option<String>,
    pub analysis: String,
    /// Attempts including this cycle.
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct Watchdog {
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn evaluate(&self, signals: &CycleSignals) -> TaskVerdict {
        if signals.completed {
            debug!(attempts = signals.attempts, "task reported complete");
            return TaskVerdict::Completed {
                result: signals.result.clone(),
            };
        }

        let signal = if signals.reported_stuck {
            let reason = signals
                .stuck_reason
                .clone()
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| signals.analysis.clone());
            Some(StuckSignal::Reported(reason))
        } else if signals.attempts >= self.config.max_attempts {
            Some(StuckSignal::AttemptCeiling {
                attempts: signals.attempts,
                max: self.config.max_attempts,
            })
        } else {
            None
        };

        match signal {
            Some(signal) => {
                let reason = signal.describe(&signals.analysis);
                info!(signal = signal.as_str(), attempts = signals.attempts, %reason, "task stuck");
                TaskVerdict::Stuck { signal, reason }
            }
            None => TaskVerdict::Continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watchdog(max: u32) -> Watchdog {
        Watchdog::new(WatchdogConfig { max_attempts: max })
    }

    #[test]
    fn default_ceiling_is_fifty() {
        assert_eq!(Watchdog::new(WatchdogConfig::default()).max_attempts(), 50);
    }

    #[test]
    fn below_ceiling_continues() {
        let verdict = watchdog(3).evaluate(&CycleSignals {
            attempts: 2,
            ..Default::default()
        });
        assert_eq!(verdict, TaskVerdict::Continue);
    }

    #[test]
    fn ceiling_marks_stuck_without_oracle_signal() {
        let verdict = watchdog(3).evaluate(&CycleSignals {
            attempts: 3,
            analysis: "still looking".to_string(),
            ..Default::default()
        });
        let TaskVerdict::Stuck { signal, reason } = verdict else {
            panic!("expected stuck verdict");
        };
        assert_eq!(signal, StuckSignal::AttemptCeiling { attempts: 3, max: 3 });
        assert!(reason.starts_with("attempt ceiling exceeded"));
        assert!(reason.contains("still looking"));
    }

    #[test]
    fn completion_wins_over_ceiling() {
        let verdict = watchdog(3).evaluate(&CycleSignals {
            completed: true,
            result: "text based".to_string(),
            reported_stuck: true,
            attempts: 3,
            ..Default::default()
        });
        assert_eq!(
            verdict,
            TaskVerdict::Completed {
                result: "text based".to_string()
            }
        );
    }

    #[test]
    fn reported_stuck_uses_reason_or_analysis() {
        let verdict = watchdog(50).evaluate(&CycleSignals {
            reported_stuck: true,
            stuck_reason: Some("no help command".to_string()),
            attempts: 1,
            ..Default::default()
        });
        assert!(matches!(
            verdict,
            TaskVerdict::Stuck { signal: StuckSignal::Reported(ref r), .. } if r == "no help command"
        ));

        let verdict = watchdog(50).evaluate(&CycleSignals {
            reported_stuck: true,
            stuck_reason: Some("  ".to_string()),
            analysis: "server ignores input".to_string(),
            attempts: 1,
            ..Default::default()
        });
        assert!(matches!(
            verdict,
            TaskVerdict::Stuck { ref reason, .. } if reason == "server ignores input"
        ));
    }
}
