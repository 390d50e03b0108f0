use std::sync::Arc;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::agent_engine::classifier::{ClassifierHistory, StateClassifier};
use crate::agent_engine::event_bus::{encode_preview, EventBus, LoopCommand, StatusSnapshot};
use crate::agent_engine::history::ActionHistory;
use crate::agent_engine::loop_control::LoopHealth;
use crate::agent_engine::policy::{DecisionContext, DecisionEngine};
use crate::agent_engine::state::{
    Action, ActionOutcome, ActionRecord, GoalHint, LoopState, NavigationSummary, OutcomeStatus, PauseReason,
    StopReason,
};
use crate::config::AppConfig;
use crate::executor::dispatcher::ActionDispatcher;
use crate::executor::input::InputBackend;
use crate::executor::safety::FocusProbe;
use crate::perception::calibration::Calibration;
use crate::perception::pipeline::{PerceptionEngine, PerceptionPass};
use crate::perception::stability::StillnessTracker;
use crate::perception::traits::{FrameSource, TextRecognizer, WindowHandle};

/// Explicit per-run context passed through the loop and control surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub window: WindowHandle,
    pub goal: GoalHint,
    pub dry_run: bool,
}

impl Session {
    pub fn new(window: WindowHandle, goal: GoalHint, dry_run: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            window,
            goal,
            dry_run,
        }
    }

    /// Live input with no window to check focus against.
    pub fn focus_unguarded(&self) -> bool {
        !self.dry_run && self.window == WindowHandle::PrimaryMonitor
    }
}

/// OS capture and input handles for one run. Acquired on the control thread
/// and dropped with the loop when the run ends.
pub struct PlatformHandles {
    pub frames: Box<dyn FrameSource>,
    pub input: Box<dyn InputBackend>,
    pub focus: Box<dyn FocusProbe>,
    pub recognizer: Option<Box<dyn TextRecognizer>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopExit {
    pub session_id: String,
    pub ticks: u64,
    pub reason: StopReason,
}

#[derive(Debug, PartialEq)]
pub enum TickFlow {
    Continue,
    Pause(PauseReason),
    Stop(StopReason),
}

/// The orchestrator: capture → perceive → classify → decide → dispatch, one
/// strictly ordered pass per tick. The only holder of cross-tick history.
pub struct AutoplayLoop {
    config: AppConfig,
    session: Session,
    frames: Box<dyn FrameSource>,
    perception: PerceptionEngine,
    classifier: StateClassifier,
    class_history: ClassifierHistory,
    policy: DecisionEngine,
    actions: ActionHistory,
    dispatcher: ActionDispatcher,
    stillness: StillnessTracker,
    health: LoopHealth,
    bus: EventBus,
    state: LoopState,
    tick: u64,
    /// Wall time the previous tick took, for the OCR cadence.
    last_tick_took: Option<Duration>,

    // ── Last tick, for snapshots ──────────────────────────────────────────
    last_navigation: Option<NavigationSummary>,
    last_action: Option<Action>,
    last_reason: Option<&'static str>,
    last_outcome: Option<ActionOutcome>,
    last_preview: Option<String>,
}

impl AutoplayLoop {
    pub fn new(
        config: &AppConfig,
        calibration: Arc<Calibration>,
        session: Session,
        handles: PlatformHandles,
        bus: EventBus,
    ) -> Self {
        let PlatformHandles {
            frames,
            input,
            focus,
            recognizer,
        } = handles;
        let dispatcher = ActionDispatcher::new(&config.dispatch, session.window.clone(), input, focus, session.dry_run);
        Self {
            perception: PerceptionEngine::new(&config.perception, calibration, recognizer),
            classifier: StateClassifier::new(&config.classifier),
            class_history: ClassifierHistory::new(&config.classifier),
            policy: DecisionEngine::new(&config.decision, &config.classifier),
            actions: ActionHistory::new(config.run_loop.history_len),
            stillness: StillnessTracker::new(config.run_loop.still_similarity),
            health: LoopHealth::new(&config.run_loop, &config.classifier),
            config: config.clone(),
            session,
            frames,
            dispatcher,
            bus,
            state: LoopState::Idle,
            tick: 0,
            last_tick_took: None,
            last_navigation: None,
            last_action: None,
            last_reason: None,
            last_outcome: None,
            last_preview: None,
        }
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    /// Drive the loop until it stops. Commands are honoured between ticks and
    /// also interrupt a tick in flight; an interrupted dispatch releases any
    /// key it was holding.
    pub async fn run(mut self, mut commands: mpsc::Receiver<LoopCommand>) -> LoopExit {
        tracing::info!(
            session = %self.session.id,
            window = %self.session.window,
            goal = %self.session.goal,
            dry_run = self.session.dry_run,
            ocr = self.perception.has_ocr(),
            "autoplay loop starting"
        );
        self.set_state(LoopState::Running);

        let mut interval = tokio::time::interval(self.config.run_loop.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            match &self.state {
                LoopState::Stopped(reason) => {
                    let exit = LoopExit {
                        session_id: self.session.id.clone(),
                        ticks: self.tick,
                        reason: reason.clone(),
                    };
                    tracing::info!(session = %exit.session_id, ticks = exit.ticks, reason = %exit.reason, "autoplay loop exited");
                    return exit;
                }
                LoopState::Idle | LoopState::Paused(_) => {
                    let cmd = commands.recv().await;
                    self.apply_command(cmd);
                    if self.state == LoopState::Running {
                        interval.reset();
                    }
                }
                LoopState::Running => {
                    let cmd = tokio::select! {
                        biased;
                        cmd = commands.recv() => Some(cmd),
                        _ = interval.tick() => None,
                    };
                    if let Some(cmd) = cmd {
                        self.apply_command(cmd);
                        continue;
                    }

                    let flow = tokio::select! {
                        biased;
                        cmd = commands.recv() => Err(cmd),
                        flow = self.tick() => Ok(flow),
                    };
                    match flow {
                        Ok(flow) => self.apply_flow(flow),
                        Err(cmd) => {
                            tracing::debug!(tick = self.tick, "tick interrupted by command");
                            self.apply_command(cmd);
                        }
                    }
                }
            }
        }
    }

    fn apply_command(&mut self, cmd: Option<LoopCommand>) {
        let running = self.state == LoopState::Running;
        match cmd {
            None => self.set_state(LoopState::Stopped(StopReason::Detached)),
            Some(LoopCommand::Stop) => self.set_state(LoopState::Stopped(StopReason::Operator)),
            Some(LoopCommand::Pause) if running => self.set_state(LoopState::Paused(PauseReason::Operator)),
            Some(LoopCommand::Resume) if !running => {
                self.health.reset(Instant::now());
                self.stillness.reset();
                self.set_state(LoopState::Running);
            }
            Some(cmd) => tracing::debug!(?cmd, state = ?self.state, "command ignored in current state"),
        }
    }

    fn apply_flow(&mut self, flow: TickFlow) {
        match flow {
            TickFlow::Continue => {}
            TickFlow::Pause(reason) => {
                tracing::warn!(tick = self.tick, %reason, "loop health threshold exceeded; pausing");
                self.set_state(LoopState::Paused(reason));
            }
            TickFlow::Stop(reason) => {
                tracing::error!(tick = self.tick, %reason, "stopping autoplay");
                self.set_state(LoopState::Stopped(reason));
            }
        }
    }

    fn set_state(&mut self, next: LoopState) {
        if self.state.is_stopped() {
            return;
        }
        tracing::info!(from = ?self.state, to = ?next, "loop state");
        self.state = next;
        self.publish();
    }

    /// OCR every tick while the loop keeps up with `ocr_full_rate_fps`,
    /// otherwise every `ocr_every` ticks.
    fn ocr_due(&self, tick: u64) -> bool {
        let full_rate = self.config.perception.ocr_full_rate_fps;
        let keeping_up = full_rate > 0.0
            && self
                .last_tick_took
                .is_some_and(|took| took.is_zero() || 1.0 / took.as_secs_f64() >= full_rate);
        let every = if keeping_up {
            1
        } else {
            self.config.perception.ocr_every.max(1) as u64
        };
        (tick - 1) % every == 0
    }

    fn escalation(&self) -> TickFlow {
        match self.health.pause_reason(Instant::now()) {
            Some(reason) => TickFlow::Pause(reason),
            None => TickFlow::Continue,
        }
    }

    /// One full pass. Public so embedders can single-step a loop.
    pub async fn tick(&mut self) -> TickFlow {
        let started = Instant::now();
        let flow = self.run_tick().await;
        self.last_tick_took = Some(started.elapsed());
        flow
    }

    async fn run_tick(&mut self) -> TickFlow {
        self.tick += 1;
        let tick = self.tick;

        // ── Capture ────────────────────────────────────────────────────────
        let frame = match self.frames.capture(&self.session.window) {
            Ok(frame) => frame,
            Err(e) if e.is_fatal() => return TickFlow::Stop(StopReason::Fatal(e.to_string())),
            Err(e) => {
                tracing::warn!(tick, error = %e, "capture failed; skipping tick");
                self.health.record_capture_error();
                self.publish();
                return self.escalation();
            }
        };
        self.dispatcher.set_geometry(frame.geometry);

        // ── Perceive ───────────────────────────────────────────────────────
        let pass = PerceptionPass { ocr: self.ocr_due(tick) };
        let observation = match self.perception.observe_with(&frame, pass) {
            Ok(obs) => Arc::new(obs),
            Err(e) => {
                tracing::warn!(tick, error = %e, "perception failed; skipping tick");
                self.health.record_capture_error();
                self.publish();
                return self.escalation();
            }
        };

        // ── Classify ───────────────────────────────────────────────────────
        let now = Instant::now();
        let still_for = self.stillness.update(&observation.signature, observation.captured_at);
        let state = self.classifier.classify(Arc::clone(&observation), &self.class_history);
        self.class_history.record(&state);
        self.health.record_state(&state, self.class_history.blocked_streak(), now);
        let moving = self
            .actions
            .last()
            .is_some_and(|r| r.action.is_movement() && r.status.was_sent());
        self.health.record_motion(still_for, moving, now);

        // ── Decide ─────────────────────────────────────────────────────────
        let decision = self.policy.decide(
            &state,
            &DecisionContext {
                history: &self.actions,
                goal: self.session.goal,
                stagnating: self.health.stagnating(),
                now,
            },
        );

        // never act on a frame that will be too old by the time input starts
        let age = self.dispatcher.next_ready().saturating_duration_since(frame.captured_at);
        let stale = decision.action != Action::Wait && age > self.config.run_loop.staleness();
        let (action, reason, tie_break) = if stale {
            tracing::debug!(tick, age_ms = age.as_millis() as u64, discarded = %decision.action, "stale frame");
            (Action::Wait, "stale_frame", None)
        } else {
            (decision.action, decision.reason, decision.tie_break)
        };

        // ── Dispatch ───────────────────────────────────────────────────────
        let outcome = self.dispatcher.dispatch(&action).await;
        self.actions.push(ActionRecord {
            action,
            state: state.kind,
            tie_break,
            status: outcome.status,
            at: Instant::now(),
        });
        self.health.record_outcome(&outcome);

        tracing::debug!(
            tick,
            state = %state.kind,
            raw = %state.raw,
            confirmed = state.confirmed,
            confidence = state.confidence,
            action = %action,
            reason,
            outcome = ?outcome.status,
            "tick"
        );

        self.last_navigation = Some(state.summary());
        self.last_action = Some(action);
        self.last_reason = Some(reason);
        self.last_preview = if self.config.run_loop.publish_preview {
            encode_preview(&observation.preview)
        } else {
            None
        };
        let permission_denied = outcome.status == OutcomeStatus::PermissionDenied;
        let detail = outcome.detail.clone();
        self.last_outcome = Some(outcome);
        self.publish();

        if permission_denied {
            let msg = detail.unwrap_or_else(|| "input injection not permitted".into());
            return TickFlow::Stop(StopReason::Fatal(msg));
        }
        self.escalation()
    }

    fn publish(&self) {
        self.bus.publish(StatusSnapshot {
            session_id: self.session.id.clone(),
            tick: self.tick,
            at: chrono::Utc::now(),
            loop_state: self.state.clone(),
            navigation: self.last_navigation.clone(),
            last_action: self.last_action,
            last_reason: self.last_reason.map(str::to_string),
            last_outcome: self.last_outcome.clone(),
            health: self.health.snapshot(Instant::now()),
            preview_png_base64: self.last_preview.clone(),
        });
    }
}
