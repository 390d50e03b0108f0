// Loop health: escalation counters and stagnation tracking across ticks.
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::agent_engine::state::{ActionOutcome, NavigationKind, NavigationState, OutcomeStatus, PauseReason};
use crate::config::{ClassifierConfig, LoopConfig};

/// Point-in-time copy published with every status snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub consecutive_unknown: u32,
    pub consecutive_dispatch_failures: u32,
    pub consecutive_capture_errors: u32,
    pub blocked_streak: u32,
    pub still_for_s: f64,
    pub since_progress_s: f64,
    pub stagnating: bool,
}

pub struct LoopHealth {
    config: LoopConfig,
    blocked_stagnation_ticks: u32,
    consecutive_unknown: u32,
    consecutive_failures: u32,
    consecutive_capture_errors: u32,
    blocked_streak: u32,
    still_for: Duration,
    stagnating: bool,
    last_confirmed: Option<NavigationKind>,
    last_progress: Instant,
}

impl LoopHealth {
    pub fn new(config: &LoopConfig, classifier: &ClassifierConfig) -> Self {
        Self {
            config: config.clone(),
            blocked_stagnation_ticks: classifier.blocked_stagnation_ticks,
            consecutive_unknown: 0,
            consecutive_failures: 0,
            consecutive_capture_errors: 0,
            blocked_streak: 0,
            still_for: Duration::ZERO,
            stagnating: false,
            last_confirmed: None,
            last_progress: Instant::now(),
        }
    }

    pub fn record_capture_error(&mut self) {
        self.consecutive_capture_errors += 1;
    }

    /// Feed the tick's classification. A confirmed change of state counts as
    /// progress.
    pub fn record_state(&mut self, state: &NavigationState, blocked_streak: u32, now: Instant) {
        self.consecutive_capture_errors = 0;
        self.blocked_streak = blocked_streak;
        if state.kind == NavigationKind::Unknown {
            self.consecutive_unknown += 1;
        } else {
            self.consecutive_unknown = 0;
        }
        if state.confirmed && self.last_confirmed != Some(state.kind) {
            if self.last_confirmed.is_some() {
                tracing::debug!(from = ?self.last_confirmed, to = %state.kind, "confirmed state change");
            }
            self.last_confirmed = Some(state.kind);
            self.last_progress = now;
        }
    }

    /// Feed how long the screen has been still and whether the previous action
    /// moved the avatar. Motion after a movement is progress; stillness during
    /// movement, or sustained BLOCKED, is stagnation.
    pub fn record_motion(&mut self, still_for: Duration, moving: bool, now: Instant) {
        self.still_for = still_for;
        if moving && still_for.is_zero() {
            self.last_progress = now;
        }
        let was = self.stagnating;
        self.stagnating = (moving && still_for >= self.config.stagnation_after())
            || self.blocked_streak >= self.blocked_stagnation_ticks;
        if self.stagnating && !was {
            tracing::warn!(
                still_for_s = still_for.as_secs_f64(),
                blocked_streak = self.blocked_streak,
                "stagnation detected"
            );
        }
    }

    pub fn record_outcome(&mut self, outcome: &ActionOutcome) {
        match outcome.status {
            OutcomeStatus::Delivered | OutcomeStatus::DryRun => self.consecutive_failures = 0,
            OutcomeStatus::Failed | OutcomeStatus::PermissionDenied => self.consecutive_failures += 1,
            // withheld input says nothing about the injection path
            OutcomeStatus::Skipped | OutcomeStatus::FocusLost => {}
        }
    }

    pub fn stagnating(&self) -> bool {
        self.stagnating
    }

    /// First escalation threshold exceeded, if any.
    pub fn pause_reason(&self, now: Instant) -> Option<PauseReason> {
        if self.consecutive_unknown > self.config.max_consecutive_unknown {
            return Some(PauseReason::ConsecutiveUnknown {
                count: self.consecutive_unknown,
            });
        }
        if self.consecutive_failures > self.config.max_dispatch_failures {
            return Some(PauseReason::DispatchFailures {
                count: self.consecutive_failures,
            });
        }
        if self.consecutive_capture_errors > self.config.max_capture_errors {
            return Some(PauseReason::CaptureErrors {
                count: self.consecutive_capture_errors,
            });
        }
        if let Some(limit) = self.config.max_no_progress() {
            let idle = now.saturating_duration_since(self.last_progress);
            if idle > limit {
                return Some(PauseReason::NoProgress { seconds: idle.as_secs() });
            }
        }
        None
    }

    /// Start the escalation counters over, e.g. after the operator resumes.
    pub fn reset(&mut self, now: Instant) {
        self.consecutive_unknown = 0;
        self.consecutive_failures = 0;
        self.consecutive_capture_errors = 0;
        self.stagnating = false;
        self.last_progress = now;
    }

    pub fn snapshot(&self, now: Instant) -> HealthSnapshot {
        HealthSnapshot {
            consecutive_unknown: self.consecutive_unknown,
            consecutive_dispatch_failures: self.consecutive_failures,
            consecutive_capture_errors: self.consecutive_capture_errors,
            blocked_streak: self.blocked_streak,
            still_for_s: self.still_for.as_secs_f64(),
            since_progress_s: now.saturating_duration_since(self.last_progress).as_secs_f64(),
            stagnating: self.stagnating,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::agent_engine::state::Action;
    use crate::test_support::observation;

    fn health(cfg: LoopConfig) -> LoopHealth {
        LoopHealth::new(&cfg, &ClassifierConfig::default())
    }

    fn nav(kind: NavigationKind) -> NavigationState {
        NavigationState {
            kind,
            raw: kind,
            confirmed: true,
            confidence: 1.0,
            observation: Arc::new(observation(vec![])),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_unknown_pauses_past_threshold() {
        let mut cfg = LoopConfig::default();
        cfg.max_consecutive_unknown = 3;
        let mut h = health(cfg);
        for _ in 0..3 {
            h.record_state(&nav(NavigationKind::Unknown), 0, Instant::now());
        }
        assert_eq!(h.pause_reason(Instant::now()), None);
        h.record_state(&nav(NavigationKind::Unknown), 0, Instant::now());
        assert_eq!(
            h.pause_reason(Instant::now()),
            Some(PauseReason::ConsecutiveUnknown { count: 4 })
        );
        h.record_state(&nav(NavigationKind::InCorridor), 0, Instant::now());
        assert_eq!(h.pause_reason(Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_failures_pause_and_success_resets() {
        let mut cfg = LoopConfig::default();
        cfg.max_dispatch_failures = 1;
        let mut h = health(cfg);
        let failed = ActionOutcome::new(Action::FORWARD, OutcomeStatus::Failed, Some("boom".into()));
        h.record_outcome(&failed);
        h.record_outcome(&ActionOutcome::new(Action::FORWARD, OutcomeStatus::FocusLost, None));
        assert_eq!(h.pause_reason(Instant::now()), None);
        h.record_outcome(&failed);
        assert_eq!(h.pause_reason(Instant::now()), Some(PauseReason::DispatchFailures { count: 2 }));
        h.record_outcome(&ActionOutcome::new(Action::FORWARD, OutcomeStatus::Delivered, None));
        assert_eq!(h.pause_reason(Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn capture_errors_pause_even_without_watchdog() {
        let mut cfg = LoopConfig::default();
        cfg.max_capture_errors = 2;
        cfg.max_no_progress_s = 0;
        let mut h = health(cfg);
        h.record_capture_error();
        h.record_capture_error();
        assert_eq!(h.pause_reason(Instant::now()), None);
        h.record_capture_error();
        assert_eq!(h.pause_reason(Instant::now()), Some(PauseReason::CaptureErrors { count: 3 }));

        // a classified frame clears the streak
        h.record_state(&nav(NavigationKind::InCorridor), 0, Instant::now());
        assert_eq!(h.pause_reason(Instant::now()), None);
        assert_eq!(h.snapshot(Instant::now()).consecutive_capture_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_progress_watchdog() {
        let mut cfg = LoopConfig::default();
        cfg.max_no_progress_s = 10;
        let mut h = health(cfg);
        h.record_state(&nav(NavigationKind::InCorridor), 0, Instant::now());
        tokio::time::advance(Duration::from_secs(11)).await;
        h.record_state(&nav(NavigationKind::InCorridor), 0, Instant::now());
        assert!(matches!(h.pause_reason(Instant::now()), Some(PauseReason::NoProgress { seconds: 11 })));

        h.reset(Instant::now());
        assert_eq!(h.pause_reason(Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn stillness_while_moving_is_stagnation() {
        let mut h = health(LoopConfig::default());
        h.record_motion(Duration::from_secs(9), false, Instant::now());
        assert!(!h.stagnating());
        h.record_motion(Duration::from_secs(9), true, Instant::now());
        assert!(h.stagnating());
        h.record_motion(Duration::ZERO, true, Instant::now());
        assert!(!h.stagnating());
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_blocked_is_stagnation() {
        let mut h = health(LoopConfig::default());
        h.record_state(&nav(NavigationKind::Blocked), 3, Instant::now());
        h.record_motion(Duration::ZERO, false, Instant::now());
        assert!(h.stagnating());
        assert_eq!(h.snapshot(Instant::now()).blocked_streak, 3);
    }
}
