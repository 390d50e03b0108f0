/// Reduces a `SceneObservation` plus short history to one `NavigationState`.
///
/// Rule order: dialogue text > door > turn > corridor > blocked > unknown.
/// Raw results are smoothed K-of-M before they count as confirmed; a raw
/// UNKNOWN is never smoothed over, so no movement state survives a frame
/// that carries no usable signal.
use std::sync::Arc;

use crate::agent_engine::history::Ring;
use crate::agent_engine::state::{NavigationKind, NavigationState};
use crate::config::{ClassifierConfig, DIALOG_REGION};
use crate::perception::ocr::meaningful_chars;
use crate::perception::types::{CueKind, SceneObservation, Side};

/// Cross-tick memory the classifier reads. Owned by the loop, which records
/// each emitted state after classification.
#[derive(Debug, Clone)]
pub struct ClassifierHistory {
    raw: Ring<NavigationKind>,
    last_confirmed: Option<NavigationKind>,
    blocked_streak: u32,
}

impl ClassifierHistory {
    pub fn new(config: &ClassifierConfig) -> Self {
        Self {
            // the current tick completes the M-window
            raw: Ring::new(config.smoothing_m.saturating_sub(1).max(1)),
            last_confirmed: None,
            blocked_streak: 0,
        }
    }

    pub fn record(&mut self, state: &NavigationState) {
        self.raw.push(state.raw);
        if state.confirmed {
            self.last_confirmed = Some(state.kind);
        }
        if state.confirmed && state.kind == NavigationKind::Blocked {
            self.blocked_streak += 1;
        } else {
            self.blocked_streak = 0;
        }
    }

    pub fn last_confirmed(&self) -> Option<NavigationKind> {
        self.last_confirmed
    }

    /// Consecutive ticks confirmed BLOCKED.
    pub fn blocked_streak(&self) -> u32 {
        self.blocked_streak
    }

    pub fn clear(&mut self) {
        self.raw.clear();
        self.last_confirmed = None;
        self.blocked_streak = 0;
    }
}

pub struct StateClassifier {
    config: ClassifierConfig,
}

impl StateClassifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        Self { config: config.clone() }
    }

    /// Deterministic: identical observation and history give identical output.
    pub fn classify(&self, observation: Arc<SceneObservation>, history: &ClassifierHistory) -> NavigationState {
        let (raw, raw_confidence) = self.raw_kind(&observation);

        if raw == NavigationKind::Unknown {
            return NavigationState {
                kind: raw,
                raw,
                confirmed: true,
                confidence: raw_confidence,
                observation,
            };
        }

        // K-of-M over the previous M-1 raw kinds plus this one; while the
        // window is still filling, K shrinks to the window length
        let window = history.raw.len() + 1;
        let needed = self.config.smoothing_k.min(window).max(1);
        let agreeing = 1 + history.raw.iter().filter(|k| **k == raw).count();

        if agreeing >= needed {
            return NavigationState {
                kind: raw,
                raw,
                confirmed: true,
                confidence: raw_confidence,
                observation,
            };
        }

        let held = history.last_confirmed().unwrap_or(NavigationKind::Unknown);
        tracing::trace!(%raw, %held, agreeing, needed, "holding previous state");
        NavigationState {
            kind: held,
            raw,
            confirmed: false,
            confidence: self.support(held, &observation),
            observation,
        }
    }

    /// Single-frame classification with the confidence of its deciding cue.
    pub fn raw_kind(&self, obs: &SceneObservation) -> (NavigationKind, f32) {
        let c = &self.config;

        if let Some(conf) = self.dialog_confidence(obs) {
            return (NavigationKind::InDialog, conf);
        }

        let door = obs.cue_confidence(CueKind::DoorFrame);
        let open = obs.cue_confidence(CueKind::DoorOpen);
        if door >= c.door_threshold && open < c.cue_threshold {
            return (NavigationKind::AtDoor, door);
        }

        let turn = obs
            .cue_confidence(CueKind::TurnMarker(Side::Left))
            .max(obs.cue_confidence(CueKind::TurnMarker(Side::Right)));
        if turn >= c.cue_threshold {
            return (NavigationKind::AtTurn, turn);
        }

        let corridor = obs.cue_confidence(CueKind::CorridorAhead);
        if corridor >= c.cue_threshold {
            return (NavigationKind::InCorridor, corridor);
        }

        // structure is visible but neither forward nor sideways is open
        if obs.has_geometric_cue(c.cue_threshold) {
            let strongest = obs
                .cues
                .iter()
                .filter(|m| m.is_geometric())
                .map(|m| m.confidence)
                .fold(0.0f32, f32::max);
            return (NavigationKind::Blocked, strongest);
        }

        (NavigationKind::Unknown, 0.0)
    }

    fn dialog_confidence(&self, obs: &SceneObservation) -> Option<f32> {
        let dialog: Vec<_> = obs.confident_tokens().filter(|t| t.region == DIALOG_REGION).collect();
        if dialog.is_empty() {
            return None;
        }
        let chars = meaningful_chars(dialog.iter().copied());
        if chars < self.config.dialog_min_chars && !obs.menu_detected {
            return None;
        }
        let mean = dialog.iter().map(|t| t.confidence).sum::<f32>() / dialog.len() as f32;
        Some(mean)
    }

    /// How well the current observation still supports a held state.
    fn support(&self, kind: NavigationKind, obs: &SceneObservation) -> f32 {
        match kind {
            NavigationKind::InCorridor => obs.cue_confidence(CueKind::CorridorAhead),
            NavigationKind::AtDoor => obs.cue_confidence(CueKind::DoorFrame),
            NavigationKind::AtTurn => obs
                .cue_confidence(CueKind::TurnMarker(Side::Left))
                .max(obs.cue_confidence(CueKind::TurnMarker(Side::Right))),
            NavigationKind::Blocked => obs.cue_confidence(CueKind::Obstacle),
            NavigationKind::InDialog => self.dialog_confidence(obs).unwrap_or(0.0),
            NavigationKind::Unknown => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::types::{CueSource, TextToken};
    use crate::test_support::{cue, observation, text_cue};

    fn classifier() -> StateClassifier {
        StateClassifier::new(&ClassifierConfig::default())
    }

    fn run(classifier: &StateClassifier, history: &mut ClassifierHistory, obs: SceneObservation) -> NavigationState {
        let state = classifier.classify(Arc::new(obs), history);
        history.record(&state);
        state
    }

    #[test]
    fn no_cues_and_no_confident_text_is_unknown() {
        let c = classifier();
        let mut noisy = observation(vec![]);
        noisy.tokens.push(TextToken {
            text: "Fl00r".into(),
            bbox: crate::perception::types::BBox::FULL,
            confidence: 0.2,
            low_confidence: true,
            region: DIALOG_REGION.into(),
            line: 0,
        });
        let mut history = ClassifierHistory::new(&ClassifierConfig::default());
        for _ in 0..3 {
            let state = run(&c, &mut history, noisy.clone());
            assert_eq!(state.kind, NavigationKind::Unknown);
        }
        // weak geometric cues below threshold are insufficient signal too
        let weak = observation(vec![cue(CueKind::Obstacle, 0.3)]);
        assert_eq!(c.raw_kind(&weak).0, NavigationKind::Unknown);
    }

    #[test]
    fn unknown_is_never_held_over_a_movement_state() {
        let c = classifier();
        let mut history = ClassifierHistory::new(&ClassifierConfig::default());
        run(&c, &mut history, observation(vec![cue(CueKind::CorridorAhead, 0.9)]));
        run(&c, &mut history, observation(vec![cue(CueKind::CorridorAhead, 0.9)]));
        let state = run(&c, &mut history, observation(vec![]));
        assert_eq!(state.kind, NavigationKind::Unknown);
    }

    #[test]
    fn rule_precedence() {
        let c = classifier();
        let all = observation(vec![
            cue(CueKind::DoorFrame, 0.7),
            cue(CueKind::TurnMarker(Side::Left), 0.9),
            cue(CueKind::CorridorAhead, 0.9),
        ]);
        assert_eq!(c.raw_kind(&all).0, NavigationKind::AtDoor);

        let weak_door = observation(vec![cue(CueKind::DoorFrame, 0.55), cue(CueKind::CorridorAhead, 0.9)]);
        assert_eq!(c.raw_kind(&weak_door).0, NavigationKind::InCorridor);

        let open_door = observation(vec![cue(CueKind::DoorFrame, 0.8), cue(CueKind::DoorOpen, 0.8)]);
        assert_ne!(c.raw_kind(&open_door).0, NavigationKind::AtDoor);

        let turn = observation(vec![cue(CueKind::TurnMarker(Side::Right), 0.6), cue(CueKind::CorridorAhead, 0.9)]);
        assert_eq!(c.raw_kind(&turn).0, NavigationKind::AtTurn);

        let wall = observation(vec![cue(CueKind::Obstacle, 0.8), cue(CueKind::WallEdge(Side::Left), 0.9)]);
        assert_eq!(c.raw_kind(&wall), (NavigationKind::Blocked, 0.9));
    }

    #[test]
    fn dialogue_text_outranks_map_cues() {
        let c = classifier();
        let mut obs = observation(vec![cue(CueKind::DoorFrame, 0.9)]);
        obs.tokens = ["Welcome", "to", "town!"]
            .iter()
            .map(|w| TextToken {
                text: (*w).into(),
                bbox: crate::perception::types::BBox::FULL,
                confidence: 0.8,
                low_confidence: false,
                region: DIALOG_REGION.into(),
                line: 0,
            })
            .collect();
        let (kind, conf) = c.raw_kind(&obs);
        assert_eq!(kind, NavigationKind::InDialog);
        assert!((conf - 0.8).abs() < 1e-6);

        // a short word is not a dialogue box
        obs.tokens.truncate(1);
        assert_eq!(c.raw_kind(&obs).0, NavigationKind::AtDoor);
    }

    #[test]
    fn text_only_cues_count_as_signal() {
        let c = classifier();
        let obs = observation(vec![text_cue(CueKind::DoorFrame, 0.9)]);
        assert_eq!(c.raw_kind(&obs).0, NavigationKind::AtDoor);
        assert_eq!(obs.cues[0].source, CueSource::Text);
    }

    #[test]
    fn single_flicker_is_held_as_tentative() {
        let c = classifier();
        let mut history = ClassifierHistory::new(&ClassifierConfig::default());
        let corridor = || observation(vec![cue(CueKind::CorridorAhead, 0.9)]);
        let turn = || observation(vec![cue(CueKind::TurnMarker(Side::Left), 0.9)]);

        assert!(run(&c, &mut history, corridor()).confirmed);
        assert!(run(&c, &mut history, corridor()).confirmed);

        let flicker = run(&c, &mut history, turn());
        assert_eq!(flicker.kind, NavigationKind::InCorridor);
        assert_eq!(flicker.raw, NavigationKind::AtTurn);
        assert!(flicker.is_tentative());

        // second turn frame in the 3-window confirms it
        let second = run(&c, &mut history, turn());
        assert_eq!(second.kind, NavigationKind::AtTurn);
        assert!(second.confirmed);
    }

    #[test]
    fn first_tick_confirms_immediately() {
        let c = classifier();
        let history = ClassifierHistory::new(&ClassifierConfig::default());
        let state = c.classify(Arc::new(observation(vec![cue(CueKind::CorridorAhead, 0.9)])), &history);
        assert!(state.confirmed);
        assert_eq!(state.kind, NavigationKind::InCorridor);
    }

    #[test]
    fn classification_is_idempotent() {
        let c = classifier();
        let mut history = ClassifierHistory::new(&ClassifierConfig::default());
        run(&c, &mut history, observation(vec![cue(CueKind::CorridorAhead, 0.9)]));
        let obs = Arc::new(observation(vec![cue(CueKind::TurnMarker(Side::Left), 0.9)]));
        let a = c.classify(obs.clone(), &history);
        let b = c.classify(obs, &history);
        assert_eq!((a.kind, a.raw, a.confirmed, a.confidence), (b.kind, b.raw, b.confirmed, b.confidence));
    }

    #[test]
    fn blocked_streak_counts_confirmed_ticks() {
        let c = classifier();
        let mut history = ClassifierHistory::new(&ClassifierConfig::default());
        for _ in 0..3 {
            run(&c, &mut history, observation(vec![cue(CueKind::Obstacle, 0.9)]));
        }
        assert_eq!(history.blocked_streak(), 3);
        run(&c, &mut history, observation(vec![]));
        assert_eq!(history.blocked_streak(), 0);
    }
}
