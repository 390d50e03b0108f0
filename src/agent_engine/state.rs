use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::perception::types::{CueMatch, SceneObservation, Side};

/// Navigational situation the avatar is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NavigationKind {
    InCorridor,
    AtDoor,
    AtTurn,
    Blocked,
    /// A dialogue box or choice menu covers the map.
    InDialog,
    Unknown,
}

impl fmt::Display for NavigationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NavigationKind::InCorridor => "IN_CORRIDOR",
            NavigationKind::AtDoor => "AT_DOOR",
            NavigationKind::AtTurn => "AT_TURN",
            NavigationKind::Blocked => "BLOCKED",
            NavigationKind::InDialog => "IN_DIALOG",
            NavigationKind::Unknown => "UNKNOWN",
        })
    }
}

/// One classification per tick, tied to the observation it came from.
#[derive(Debug, Clone)]
pub struct NavigationState {
    /// Emitted state: the raw classification when confirmed, otherwise the
    /// previously confirmed state held over.
    pub kind: NavigationKind,
    /// What this tick's observation alone classified as.
    pub raw: NavigationKind,
    pub confirmed: bool,
    pub confidence: f32,
    pub observation: Arc<SceneObservation>,
}

impl NavigationState {
    pub fn is_tentative(&self) -> bool {
        !self.confirmed
    }

    pub fn summary(&self) -> NavigationSummary {
        NavigationSummary {
            kind: self.kind,
            raw: self.raw,
            confirmed: self.confirmed,
            confidence: self.confidence,
            cues: self.observation.cues.clone(),
            text: self.observation.confident_tokens().map(|t| t.text.clone()).collect(),
            menu_detected: self.observation.menu_detected,
        }
    }
}

/// Serializable view of a [`NavigationState`] for observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationSummary {
    pub kind: NavigationKind,
    pub raw: NavigationKind,
    pub confirmed: bool,
    pub confidence: f32,
    pub cues: Vec<CueMatch>,
    pub text: Vec<String>,
    pub menu_detected: bool,
}

// ── Actions ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    MoveForward { steps: u32 },
    TurnLeft { repeat: u32 },
    TurnRight { repeat: u32 },
    /// Without `menu_steps`: the confirm combo (dialogue, doors). With it: move
    /// the menu cursor that many lines (positive is down), then confirm once.
    Interact {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        menu_steps: Option<i32>,
    },
    Wait,
}

impl Action {
    pub const FORWARD: Action = Action::MoveForward { steps: 1 };
    pub const INTERACT: Action = Action::Interact { menu_steps: None };

    pub fn select(menu_steps: i32) -> Self {
        Action::Interact {
            menu_steps: Some(menu_steps),
        }
    }

    pub fn is_interact(&self) -> bool {
        matches!(self, Action::Interact { .. })
    }

    pub fn turn(side: Side, repeat: u32) -> Self {
        match side {
            Side::Left => Action::TurnLeft { repeat },
            Side::Right => Action::TurnRight { repeat },
        }
    }

    pub fn is_forward(&self) -> bool {
        matches!(self, Action::MoveForward { .. })
    }

    pub fn is_turn(&self) -> bool {
        matches!(self, Action::TurnLeft { .. } | Action::TurnRight { .. })
    }

    /// Anything that moves or rotates the avatar.
    pub fn is_movement(&self) -> bool {
        self.is_forward() || self.is_turn()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::MoveForward { .. } => "MOVE_FORWARD",
            Action::TurnLeft { .. } => "TURN_LEFT",
            Action::TurnRight { .. } => "TURN_RIGHT",
            Action::Interact { .. } => "INTERACT",
            Action::Wait => "WAIT",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::MoveForward { steps } if *steps != 1 => write!(f, "{}×{steps}", self.name()),
            Action::TurnLeft { repeat } | Action::TurnRight { repeat } if *repeat != 1 => {
                write!(f, "{}×{repeat}", self.name())
            }
            Action::Interact { menu_steps: Some(steps) } => write!(f, "{}(menu {steps:+})", self.name()),
            _ => f.write_str(self.name()),
        }
    }
}

/// Policy output: the action plus why it was chosen.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: Action,
    pub reason: &'static str,
    /// Set when an ambiguous turn was resolved by the tie-break rule.
    pub tie_break: Option<Side>,
}

impl Decision {
    pub fn new(action: Action, reason: &'static str) -> Self {
        Self {
            action,
            reason,
            tie_break: None,
        }
    }
}

// ── Outcomes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Delivered,
    /// Dry run: everything but the input emission happened.
    DryRun,
    /// WAIT, or an action with nothing to send.
    Skipped,
    FocusLost,
    PermissionDenied,
    Failed,
}

impl OutcomeStatus {
    /// The game saw (or in a dry run, would have seen) the input.
    pub fn was_sent(self) -> bool {
        matches!(self, OutcomeStatus::Delivered | OutcomeStatus::DryRun)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action: Action,
    pub status: OutcomeStatus,
    pub detail: Option<String>,
    pub at: chrono::DateTime<chrono::Utc>,
}

impl ActionOutcome {
    pub fn new(action: Action, status: OutcomeStatus, detail: Option<String>) -> Self {
        Self {
            action,
            status,
            detail,
            at: chrono::Utc::now(),
        }
    }
}

/// What the loop remembers about each dispatched action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRecord {
    pub action: Action,
    pub state: NavigationKind,
    pub tie_break: Option<Side>,
    pub status: OutcomeStatus,
    pub at: tokio::time::Instant,
}

// ── Goal hint ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GoalHint {
    /// Free exploration: ambiguous turns start left.
    #[default]
    Explore,
    /// Keep one hand on the wall: ties and probes start on that side.
    FollowWall(Side),
}

impl GoalHint {
    pub fn preferred_side(self) -> Side {
        match self {
            GoalHint::Explore => Side::Left,
            GoalHint::FollowWall(side) => side,
        }
    }
}

impl fmt::Display for GoalHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GoalHint::Explore => f.write_str("explore"),
            GoalHint::FollowWall(side) => write!(f, "follow_{side}"),
        }
    }
}

impl FromStr for GoalHint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "explore" => Ok(GoalHint::Explore),
            "follow_left" | "left" => Ok(GoalHint::FollowWall(Side::Left)),
            "follow_right" | "right" => Ok(GoalHint::FollowWall(Side::Right)),
            other => Err(format!("unknown goal hint: {other}")),
        }
    }
}

impl Serialize for GoalHint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GoalHint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── Loop lifecycle ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Running,
    Paused(PauseReason),
    Stopped(StopReason),
}

impl LoopState {
    pub fn is_stopped(&self) -> bool {
        matches!(self, LoopState::Stopped(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PauseReason {
    Operator,
    ConsecutiveUnknown { count: u32 },
    DispatchFailures { count: u32 },
    CaptureErrors { count: u32 },
    NoProgress { seconds: u64 },
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PauseReason::Operator => f.write_str("paused by operator"),
            PauseReason::ConsecutiveUnknown { count } => write!(f, "{count} consecutive unclassified frames"),
            PauseReason::DispatchFailures { count } => write!(f, "{count} consecutive dispatch failures"),
            PauseReason::CaptureErrors { count } => write!(f, "{count} consecutive capture errors"),
            PauseReason::NoProgress { seconds } => write!(f, "no navigational progress for {seconds}s"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum StopReason {
    Operator,
    /// The controller side of the command channel went away.
    Detached,
    /// Verbatim fatal error (no window, no permission).
    Fatal(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Operator => f.write_str("stopped by operator"),
            StopReason::Detached => f.write_str("controller detached"),
            StopReason::Fatal(msg) => f.write_str(msg),
        }
    }
}
