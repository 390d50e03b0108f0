use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent_engine::state::GoalHint;
use crate::errors::{AutoplayError, AutoplayResult};
use crate::executor::input::{Heading, KeyCode};
use crate::perception::traits::WindowHandle;
use crate::perception::types::{BBox, CueKind};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub perception: PerceptionConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub decision: DecisionConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default, rename = "loop")]
    pub run_loop: LoopConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Substring matched against window title / owning app name (e.g. "nwjs").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,
    /// Exact platform window id; wins over `window` when both are set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<u32>,
    #[serde(default)]
    pub goal: GoalHint,
    /// Run the whole pipeline but never emit input.
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerceptionConfig {
    /// Frames wider than this are downscaled before edge and template analysis.
    pub working_width: u32,
    pub ocr_enabled: bool,
    /// Run OCR on every Nth tick only, unless the loop is keeping up.
    pub ocr_every: u32,
    /// While ticks complete at this rate or faster, OCR runs every tick.
    /// 0 keeps the fixed `ocr_every` cadence.
    pub ocr_full_rate_fps: f64,
    pub ocr_lang: String,
    pub tesseract_path: String,
    /// Tokens below this are kept but flagged as low confidence.
    pub ocr_min_confidence: f32,
    pub ocr_upscale: f32,
    /// Minimum Sobel gradient magnitude for a pixel to count as an edge.
    pub edge_threshold: u16,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            working_width: 320,
            ocr_enabled: true,
            ocr_every: 3,
            ocr_full_rate_fps: 6.0,
            ocr_lang: "eng+jpn".into(),
            tesseract_path: "tesseract".into(),
            ocr_min_confidence: 0.5,
            ocr_upscale: 1.5,
            edge_threshold: 48,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Minimum match confidence for a geometric cue to count as evidence.
    pub cue_threshold: f32,
    pub door_threshold: f32,
    /// Turn cues closer than this are treated as an ambiguous tie.
    pub turn_tie_epsilon: f32,
    pub smoothing_k: usize,
    pub smoothing_m: usize,
    pub dialog_min_chars: usize,
    /// Confirmed BLOCKED ticks after which stagnation is flagged.
    pub blocked_stagnation_ticks: u32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            cue_threshold: 0.5,
            door_threshold: 0.6,
            turn_tie_epsilon: 0.05,
            smoothing_k: 2,
            smoothing_m: 3,
            dialog_min_chars: 10,
            blocked_stagnation_ticks: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub interact_debounce_ms: u64,
    /// WAIT ticks spent on BLOCKED before turning around.
    pub blocked_retry_count: usize,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            interact_debounce_ms: 1500,
            blocked_retry_count: 2,
        }
    }
}

impl DecisionConfig {
    pub fn interact_debounce(&self) -> Duration {
        Duration::from_millis(self.interact_debounce_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub min_interval_ms: u64,
    pub move_press_ms: u64,
    pub turn_press_ms: u64,
    pub tap_ms: u64,
    pub interact_keys: Vec<KeyCode>,
    /// Forward moves click inside the window instead of holding a key.
    pub mouse_mode: bool,
    pub start_heading: Heading,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 90,
            move_press_ms: 150,
            turn_press_ms: 40,
            tap_ms: 40,
            interact_keys: vec![KeyCode::Char('z'), KeyCode::Enter, KeyCode::Space],
            mouse_mode: false,
            start_heading: Heading::Up,
        }
    }
}

impl DispatchConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub max_fps: u32,
    /// A frame older than this when its action would be sent is discarded.
    pub staleness_ms: u64,
    pub max_consecutive_unknown: u32,
    pub max_dispatch_failures: u32,
    /// Consecutive failed captures (or perception passes) before pausing.
    pub max_capture_errors: u32,
    pub history_len: usize,
    pub stagnation_after_s: f64,
    pub still_similarity: f64,
    /// 0 disables the no-progress watchdog.
    pub max_no_progress_s: u64,
    pub publish_preview: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_fps: 12,
            staleness_ms: 400,
            max_consecutive_unknown: 60,
            max_dispatch_failures: 5,
            max_capture_errors: 30,
            history_len: 10,
            stagnation_after_s: 8.0,
            still_similarity: 0.995,
            max_no_progress_s: 180,
            publish_preview: false,
        }
    }
}

impl LoopConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.max_fps.clamp(5, 25) as f64)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_millis(self.staleness_ms)
    }

    pub fn stagnation_after(&self) -> Duration {
        Duration::from_secs_f64(self.stagnation_after_s.max(0.0))
    }

    pub fn max_no_progress(&self) -> Option<Duration> {
        (self.max_no_progress_s > 0).then(|| Duration::from_secs(self.max_no_progress_s))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
            json: false,
        }
    }
}

// ── Calibration ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Client-area width the templates were cut from.
    pub reference_width: u32,
    pub ocr_regions: Vec<NamedRegion>,
    pub ahead_band: BBox,
    pub left_band: BBox,
    pub right_band: BBox,
    pub heuristics: EdgeHeuristics,
    pub templates: Vec<TemplateSpec>,
    pub text_cues: Vec<TextCueSpec>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            reference_width: 816,
            ocr_regions: vec![NamedRegion {
                name: DIALOG_REGION.into(),
                rect: BBox::new(0.0, 0.6, 1.0, 1.0),
            }],
            ahead_band: BBox::new(0.35, 0.15, 0.65, 0.6),
            left_band: BBox::new(0.0, 0.15, 0.25, 0.9),
            right_band: BBox::new(0.75, 0.15, 1.0, 0.9),
            heuristics: EdgeHeuristics::default(),
            templates: Vec::new(),
            text_cues: vec![
                TextCueSpec {
                    pattern: r"(?i)\bdoor\b|扉|ドア".into(),
                    cue: CueKind::DoorFrame,
                },
                TextCueSpec {
                    pattern: r"(?i)\bopen(ed)?\b|開いた".into(),
                    cue: CueKind::DoorOpen,
                },
            ],
        }
    }
}

/// Name of the OCR region holding the game's message window.
pub const DIALOG_REGION: &str = "dialog";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedRegion {
    pub name: String,
    pub rect: BBox,
}

/// Edge-density limits, as fractions of the pixels of a band.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeHeuristics {
    pub wall_min_density: f32,
    pub opening_max_density: f32,
    pub open_ahead_max_density: f32,
    pub obstacle_min_density: f32,
    /// Minimum vertical edge run for a door jamb, as a fraction of frame height.
    pub door_min_run: f32,
    /// Jamb columns needed for full door confidence.
    pub door_full_runs: u32,
}

impl Default for EdgeHeuristics {
    fn default() -> Self {
        Self {
            wall_min_density: 0.08,
            opening_max_density: 0.03,
            open_ahead_max_density: 0.04,
            obstacle_min_density: 0.10,
            door_min_run: 0.12,
            door_full_runs: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub name: String,
    pub cue: CueKind,
    pub path: PathBuf,
    #[serde(default = "default_template_threshold")]
    pub threshold: f32,
    /// Restrict the search to this normalized region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<BBox>,
}

fn default_template_threshold() -> f32 {
    0.8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextCueSpec {
    pub pattern: String,
    pub cue: CueKind,
}

impl SessionConfig {
    /// Window id wins over title keyword; neither means the primary monitor.
    pub fn window_handle(&self) -> WindowHandle {
        match (&self.window_id, &self.window) {
            (Some(id), _) => WindowHandle::Id(*id),
            (None, Some(keyword)) => WindowHandle::Keyword(keyword.clone()),
            (None, None) => WindowHandle::PrimaryMonitor,
        }
    }
}

// ── Validation and overrides ──────────────────────────────────────────────────

impl AppConfig {
    pub fn validate(&self) -> AutoplayResult<()> {
        let unit = [
            ("perception.ocr_min_confidence", self.perception.ocr_min_confidence),
            ("classifier.cue_threshold", self.classifier.cue_threshold),
            ("classifier.door_threshold", self.classifier.door_threshold),
            ("classifier.turn_tie_epsilon", self.classifier.turn_tie_epsilon),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(AutoplayError::Config(format!("{name} must be within [0, 1], got {value}")));
            }
        }
        if !(0.0..=1.0).contains(&self.run_loop.still_similarity) {
            return Err(AutoplayError::Config("loop.still_similarity must be within [0, 1]".into()));
        }
        let c = &self.classifier;
        if c.smoothing_m == 0 || c.smoothing_k == 0 || c.smoothing_k > c.smoothing_m {
            return Err(AutoplayError::Config(format!(
                "classifier smoothing needs 1 <= k <= m, got k={} m={}",
                c.smoothing_k, c.smoothing_m
            )));
        }
        if self.perception.ocr_every == 0 {
            return Err(AutoplayError::Config("perception.ocr_every must be >= 1".into()));
        }
        if self.perception.ocr_full_rate_fps < 0.0 {
            return Err(AutoplayError::Config("perception.ocr_full_rate_fps must be >= 0".into()));
        }
        if self.perception.working_width < 32 {
            return Err(AutoplayError::Config("perception.working_width must be >= 32".into()));
        }
        if self.run_loop.history_len < 2 {
            return Err(AutoplayError::Config("loop.history_len must be >= 2".into()));
        }
        let cal = &self.calibration;
        let mut regions: Vec<(&str, &BBox)> = vec![
            ("calibration.ahead_band", &cal.ahead_band),
            ("calibration.left_band", &cal.left_band),
            ("calibration.right_band", &cal.right_band),
        ];
        regions.extend(cal.ocr_regions.iter().map(|r| (r.name.as_str(), &r.rect)));
        regions.extend(cal.templates.iter().filter_map(|t| t.region.as_ref().map(|r| (t.name.as_str(), r))));
        for (name, rect) in regions {
            if !rect.is_valid() {
                return Err(AutoplayError::Config(format!("region {name} is not inside the unit square: {rect:?}")));
            }
        }
        Ok(())
    }

    /// Apply `AUTOPLAY_*` environment variables on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(window) = std::env::var("AUTOPLAY_WINDOW") {
            if !window.trim().is_empty() {
                self.session.window = Some(window.trim().to_string());
            }
        }
        if let Ok(id) = std::env::var("AUTOPLAY_WINDOW_ID") {
            match id.trim().parse::<u32>() {
                Ok(id) => self.session.window_id = Some(id),
                Err(e) => tracing::warn!(value = %id, error = %e, "ignoring invalid AUTOPLAY_WINDOW_ID"),
            }
        }
        if let Ok(flag) = std::env::var("AUTOPLAY_DRY_RUN") {
            self.session.dry_run = matches!(flag.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Ok(goal) = std::env::var("AUTOPLAY_GOAL") {
            match goal.parse::<GoalHint>() {
                Ok(goal) => self.session.goal = goal,
                Err(e) => tracing::warn!(value = %goal, error = %e, "ignoring invalid AUTOPLAY_GOAL"),
            }
        }
    }
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Some(candidate);
            }
        }
    }

    if let Ok(cwd) = std::env::current_dir() {
        let candidate = cwd.join("config.toml");
        if candidate.exists() {
            tracing::debug!(path = %candidate.display(), "config found in working directory");
            return Some(candidate);
        }
    }

    let candidate = dirs::config_dir()?.join("rpg-autoplay").join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in user config dir");
        return Some(candidate);
    }
    None
}

/// Directory relative calibration paths resolve against: the directory of the
/// config file in use, else the working directory.
pub fn config_base_dir() -> PathBuf {
    resolve_config_path()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Load `config.toml` from the usual locations, falling back to defaults when
/// none exists. Environment overrides are applied last.
pub fn load_config() -> AutoplayResult<AppConfig> {
    let mut config = match resolve_config_path() {
        Some(path) => load_config_from(&path)?,
        None => {
            tracing::info!("no config.toml found; using defaults");
            AppConfig::default()
        }
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

pub fn load_config_from(path: &Path) -> AutoplayResult<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    config.validate()?;
    tracing::info!(path = %path.display(), "config loaded");
    Ok(config)
}

pub fn save_config(config: &AppConfig, path: &Path) -> AutoplayResult<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    tracing::info!(path = %path.display(), "config saved");
    Ok(())
}
