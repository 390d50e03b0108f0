// Action dispatcher: turns one `Action` into timed synthetic input for the
// focused game window. Moves are egocentric, matching the screen-fixed
// perception bands: forward presses Up, turns tap Left/Right.
use std::time::Duration;

use tokio::time::{sleep, sleep_until, Instant};

use crate::agent_engine::state::{Action, ActionOutcome, OutcomeStatus};
use crate::config::DispatchConfig;
use crate::errors::{AutoplayError, AutoplayResult};
use crate::executor::input::{Heading, HeldKeys, InputBackend, KeyCode};
use crate::executor::safety::FocusProbe;
use crate::perception::traits::WindowHandle;
use crate::perception::types::WindowGeometry;

/// Mouse-mode click distance above the window centre, as a fraction of the
/// shorter window side.
const MOUSE_STEP_FRACTION: f32 = 0.125;

const FORWARD_KEY: KeyCode = KeyCode::Up;

pub struct ActionDispatcher {
    config: DispatchConfig,
    window: WindowHandle,
    input: Box<dyn InputBackend>,
    focus: Box<dyn FocusProbe>,
    dry_run: bool,
    heading: Heading,
    geometry: WindowGeometry,
    /// End of the last dispatch that emitted (or would have emitted) input.
    last_sent: Option<Instant>,
}

impl ActionDispatcher {
    pub fn new(
        config: &DispatchConfig,
        window: WindowHandle,
        input: Box<dyn InputBackend>,
        focus: Box<dyn FocusProbe>,
        dry_run: bool,
    ) -> Self {
        Self {
            heading: config.start_heading,
            config: config.clone(),
            window,
            input,
            focus,
            dry_run,
            geometry: WindowGeometry::default(),
            last_sent: None,
        }
    }

    pub fn heading(&self) -> Heading {
        self.heading
    }

    pub fn set_geometry(&mut self, geometry: WindowGeometry) {
        self.geometry = geometry;
    }

    /// Earliest instant the next input may start.
    pub fn next_ready(&self) -> Instant {
        let now = Instant::now();
        self.last_sent
            .map(|t| (t + self.config.min_interval()).max(now))
            .unwrap_or(now)
    }

    pub async fn dispatch(&mut self, action: &Action) -> ActionOutcome {
        if *action == Action::Wait {
            return ActionOutcome::new(*action, OutcomeStatus::Skipped, None);
        }

        sleep_until(self.next_ready()).await;

        if self.dry_run {
            self.apply_heading(action);
            self.last_sent = Some(Instant::now());
            tracing::debug!(action = %action, heading = ?self.heading, "dry run: input suppressed");
            return ActionOutcome::new(*action, OutcomeStatus::DryRun, None);
        }

        match self.focus.is_focused(&self.window) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(action = %action, window = %self.window, "target window not focused; input withheld");
                return ActionOutcome::new(*action, OutcomeStatus::FocusLost, None);
            }
            Err(e) => return Self::failed(action, e),
        }

        let result = self.emit(action).await;
        self.last_sent = Some(Instant::now());
        match result {
            Ok(()) => {
                tracing::debug!(action = %action, heading = ?self.heading, "input delivered");
                ActionOutcome::new(*action, OutcomeStatus::Delivered, None)
            }
            Err(e) => Self::failed(action, e),
        }
    }

    fn failed(action: &Action, e: AutoplayError) -> ActionOutcome {
        let status = match e {
            AutoplayError::PermissionDenied(_) => OutcomeStatus::PermissionDenied,
            AutoplayError::FocusLost => OutcomeStatus::FocusLost,
            _ => OutcomeStatus::Failed,
        };
        tracing::warn!(action = %action, error = %e, ?status, "dispatch failed");
        ActionOutcome::new(*action, status, Some(e.to_string()))
    }

    fn apply_heading(&mut self, action: &Action) {
        match *action {
            Action::TurnLeft { repeat } => (0..repeat).for_each(|_| self.heading = self.heading.rotate_left()),
            Action::TurnRight { repeat } => (0..repeat).for_each(|_| self.heading = self.heading.rotate_right()),
            _ => {}
        }
    }

    async fn emit(&mut self, action: &Action) -> AutoplayResult<()> {
        let mut keys = HeldKeys::new(self.input.as_mut());
        let press = Duration::from_millis(self.config.move_press_ms);
        let turn = Duration::from_millis(self.config.turn_press_ms);
        let tap = Duration::from_millis(self.config.tap_ms);

        match *action {
            Action::MoveForward { steps } => {
                for _ in 0..steps.max(1) {
                    if self.config.mouse_mode {
                        let (x, y) = mouse_target(&self.geometry);
                        keys.click_at(x, y)?;
                        sleep(press).await;
                    } else {
                        hold(&mut keys, FORWARD_KEY, press).await?;
                    }
                }
            }
            Action::TurnLeft { repeat } | Action::TurnRight { repeat } => {
                let (key, rotate): (KeyCode, fn(Heading) -> Heading) = match action {
                    Action::TurnLeft { .. } => (KeyCode::Left, Heading::rotate_left),
                    _ => (KeyCode::Right, Heading::rotate_right),
                };
                for _ in 0..repeat.max(1) {
                    // a short tap rotates the view without stepping
                    hold(&mut keys, key, turn).await?;
                    self.heading = rotate(self.heading);
                }
            }
            Action::Interact { menu_steps: None } => {
                for key in &self.config.interact_keys {
                    hold(&mut keys, *key, tap).await?;
                }
            }
            Action::Interact { menu_steps: Some(steps) } => {
                let cursor = if steps < 0 { KeyCode::Up } else { KeyCode::Down };
                for _ in 0..steps.unsigned_abs() {
                    hold(&mut keys, cursor, tap).await?;
                    sleep(tap).await;
                }
                // one confirm, so the next screen is not confirmed too
                if let Some(confirm) = self.config.interact_keys.first() {
                    hold(&mut keys, *confirm, tap).await?;
                }
            }
            Action::Wait => {}
        }
        Ok(())
    }
}

async fn hold(keys: &mut HeldKeys<'_>, key: KeyCode, duration: Duration) -> AutoplayResult<()> {
    keys.press(key)?;
    sleep(duration).await;
    keys.release(key)
}

fn mouse_target(geometry: &WindowGeometry) -> (i32, i32) {
    let (cx, cy) = geometry.center();
    let step = (geometry.width.min(geometry.height) as f32 * MOUSE_STEP_FRACTION).round() as i32;
    (cx, cy - step)
}
