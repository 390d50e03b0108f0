/// Navigation policy: (state, action history, goal hint) → next action.
///
/// Pure and deterministic; time enters only through `DecisionContext::now`.
use tokio::time::Instant;

use crate::agent_engine::history::ActionHistory;
use crate::agent_engine::state::{Action, Decision, GoalHint, NavigationKind, NavigationState};
use crate::config::{ClassifierConfig, DecisionConfig, DIALOG_REGION};
use crate::perception::ocr::{menu_options, MenuOption};
use crate::perception::types::{CueKind, Side};

const CONFIRM_WORDS: &[&str] = &[
    "はい", "yes", "ok", "proceed", "next", "continue", "enter", "investigate", "talk", "agree", "story", "start",
];
const AVOID_WORDS: &[&str] = &["いいえ", "no", "cancel", "exit", "quit", "save", "load", "settings", "back", "title"];

pub struct DecisionContext<'a> {
    pub history: &'a ActionHistory,
    pub goal: GoalHint,
    /// LoopHealth reports the avatar is not getting anywhere.
    pub stagnating: bool,
    pub now: Instant,
}

pub struct DecisionEngine {
    config: DecisionConfig,
    door_threshold: f32,
    cue_threshold: f32,
    tie_epsilon: f32,
}

impl DecisionEngine {
    pub fn new(config: &DecisionConfig, classifier: &ClassifierConfig) -> Self {
        Self {
            config: config.clone(),
            door_threshold: classifier.door_threshold,
            cue_threshold: classifier.cue_threshold,
            tie_epsilon: classifier.turn_tie_epsilon,
        }
    }

    pub fn decide(&self, state: &NavigationState, ctx: &DecisionContext<'_>) -> Decision {
        match state.kind {
            NavigationKind::Unknown => Decision::new(Action::Wait, "unclassified"),
            NavigationKind::InCorridor => self.corridor(ctx),
            NavigationKind::AtTurn => self.turn(state, ctx),
            NavigationKind::AtDoor => self.door(state, ctx),
            NavigationKind::Blocked => self.blocked(ctx),
            NavigationKind::InDialog => self.dialog(state, ctx),
        }
    }

    fn corridor(&self, ctx: &DecisionContext<'_>) -> Decision {
        if ctx.stagnating && ctx.history.last_n_all(2, |r| r.action.is_forward()) {
            let side = ctx.goal.preferred_side();
            return Decision::new(Action::turn(side, 1), "stagnation_probe");
        }
        Decision::new(Action::FORWARD, "corridor")
    }

    fn turn(&self, state: &NavigationState, ctx: &DecisionContext<'_>) -> Decision {
        let obs = &state.observation;
        let left = obs.cue_confidence(CueKind::TurnMarker(Side::Left));
        let right = obs.cue_confidence(CueKind::TurnMarker(Side::Right));

        // a held AT_TURN whose frame no longer shows either opening
        if left < self.cue_threshold && right < self.cue_threshold {
            if obs.cue_confidence(CueKind::CorridorAhead) >= self.cue_threshold {
                return Decision::new(Action::FORWARD, "turn_taken");
            }
            return Decision::new(Action::Wait, "turn_cue_lost");
        }

        if (left - right).abs() <= self.tie_epsilon {
            // repeated ambiguity alternates instead of looping on one side
            let side = ctx
                .history
                .last_tie_break()
                .map(Side::opposite)
                .unwrap_or_else(|| ctx.goal.preferred_side());
            return Decision {
                action: Action::turn(side, 1),
                reason: "turn_tie_break",
                tie_break: Some(side),
            };
        }
        let side = if left > right { Side::Left } else { Side::Right };
        Decision::new(Action::turn(side, 1), "turn_cue")
    }

    fn door(&self, state: &NavigationState, ctx: &DecisionContext<'_>) -> Decision {
        let obs = &state.observation;
        let interacted_last = ctx
            .history
            .last()
            .is_some_and(|r| r.action.is_interact() && r.status.was_sent());
        let door_gone = obs.cue_confidence(CueKind::DoorFrame) < self.door_threshold
            || obs.cue_confidence(CueKind::DoorOpen) >= self.cue_threshold;
        if interacted_last && door_gone {
            return Decision::new(Action::FORWARD, "door_opened");
        }
        self.interact_or_wait(ctx, Action::INTERACT, "open_door")
    }

    fn blocked(&self, ctx: &DecisionContext<'_>) -> Decision {
        let waited = ctx
            .history
            .trailing(|r| r.state == NavigationKind::Blocked && r.action == Action::Wait);
        if waited < self.config.blocked_retry_count {
            return Decision::new(Action::Wait, "blocked_wait");
        }
        // turn around
        Decision::new(Action::turn(ctx.goal.preferred_side(), 2), "blocked_reverse")
    }

    fn dialog(&self, state: &NavigationState, ctx: &DecisionContext<'_>) -> Decision {
        let obs = &state.observation;
        let options = if obs.menu_detected {
            menu_options(&obs.tokens, DIALOG_REGION)
        } else {
            Vec::new()
        };
        if options.len() < 2 {
            return self.interact_or_wait(ctx, Action::INTERACT, "advance_dialog");
        }
        match menu_choice(&options) {
            Some(steps) => self.interact_or_wait(ctx, Action::select(steps), "menu_choice"),
            None => Decision::new(Action::Wait, "menu_only_negative"),
        }
    }

    fn interact_or_wait(&self, ctx: &DecisionContext<'_>, action: Action, reason: &'static str) -> Decision {
        let debounced = ctx
            .history
            .last_interact_at()
            .is_some_and(|at| ctx.now.saturating_duration_since(at) < self.config.interact_debounce());
        if debounced {
            Decision::new(Action::Wait, "interact_debounce")
        } else {
            Decision::new(action, reason)
        }
    }
}

fn mentions(text: &str, words: &[&str]) -> bool {
    let lower = text.to_lowercase();
    words.iter().any(|w| {
        if w.is_ascii() {
            lower.split(|c: char| !c.is_alphanumeric()).any(|part| part == *w)
        } else {
            lower.contains(*w)
        }
    })
}

/// Cursor steps from the current selection to the option to confirm: the
/// marked option unless it backs out, else the first confirming option, else
/// the first option that does not back out. `None` when every option backs out.
pub fn menu_choice(options: &[MenuOption]) -> Option<i32> {
    let cursor = options.iter().position(|o| o.marked);
    let target = cursor
        .filter(|&i| !mentions(&options[i].text, AVOID_WORDS))
        .or_else(|| options.iter().position(|o| mentions(&o.text, CONFIRM_WORDS)))
        .or_else(|| options.iter().position(|o| !mentions(&o.text, AVOID_WORDS)))?;
    Some(target as i32 - cursor.unwrap_or(0) as i32)
}
