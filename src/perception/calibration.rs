/// Calibration data loaded once at startup and shared read-only afterwards.
use std::path::Path;

use image::imageops::{self, FilterType};
use regex::Regex;

use crate::config::{CalibrationConfig, NamedRegion};
use crate::errors::{AutoplayError, AutoplayResult};
use crate::perception::template::Template;
use crate::perception::types::{BBox, CueKind};

pub struct TextCue {
    pub pattern: Regex,
    pub cue: CueKind,
}

pub struct Calibration {
    pub bands: CalibrationConfig,
    pub templates: Vec<Template>,
    pub text_cues: Vec<TextCue>,
}

impl Calibration {
    /// Load template images (relative paths resolve against `base_dir`) and
    /// compile text cue patterns. Templates are rescaled from the calibration
    /// reference width to `working_width`.
    pub fn load(config: &CalibrationConfig, working_width: u32, base_dir: &Path) -> AutoplayResult<Self> {
        let scale = working_width as f32 / config.reference_width.max(1) as f32;

        let mut templates = Vec::with_capacity(config.templates.len());
        for spec in &config.templates {
            let path = if spec.path.is_absolute() {
                spec.path.clone()
            } else {
                base_dir.join(&spec.path)
            };
            let img = image::open(&path)
                .map_err(|e| AutoplayError::Calibration(format!("template {} ({}): {e}", spec.name, path.display())))?
                .to_luma8();
            let w = ((img.width() as f32 * scale).round() as u32).max(2);
            let h = ((img.height() as f32 * scale).round() as u32).max(2);
            let scaled = imageops::resize(&img, w, h, FilterType::Triangle);
            let region = spec.region.unwrap_or(BBox::FULL);
            templates.push(Template::new(&spec.name, spec.cue, &scaled, spec.threshold, region)?);
            tracing::debug!(template = %spec.name, cue = %spec.cue, w, h, "template loaded");
        }

        let mut text_cues = Vec::with_capacity(config.text_cues.len());
        for spec in &config.text_cues {
            text_cues.push(TextCue {
                pattern: Regex::new(&spec.pattern)?,
                cue: spec.cue,
            });
        }

        tracing::info!(
            templates = templates.len(),
            text_cues = text_cues.len(),
            ocr_regions = config.ocr_regions.len(),
            "calibration loaded"
        );
        Ok(Self {
            bands: config.clone(),
            templates,
            text_cues,
        })
    }

    pub fn ocr_regions(&self) -> &[NamedRegion] {
        &self.bands.ocr_regions
    }

    pub fn region(&self, name: &str) -> Option<&NamedRegion> {
        self.bands.ocr_regions.iter().find(|r| r.name == name)
    }
}
