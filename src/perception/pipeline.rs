/// Perception pipeline: turns one captured frame into a `SceneObservation`.
///
/// 1. Grayscale and downscale to the working width.
/// 2. Sobel edge statistics → geometric heuristic cues.
/// 3. Calibrated template matches.
/// 4. OCR over each region of interest (when this pass asks for it).
/// 5. Text cues and menu detection over confident tokens.
/// 6. Stillness signature and preview image.
use std::sync::Arc;

use image::imageops::{self, FilterType};

use crate::config::PerceptionConfig;
use crate::errors::{AutoplayError, AutoplayResult};
use crate::perception::calibration::Calibration;
use crate::perception::edges::{heuristic_cues, EdgeMap};
use crate::perception::ocr::{looks_like_menu, region_lines, OcrReader};
use crate::perception::stability::FrameSignature;
use crate::perception::traits::TextRecognizer;
use crate::perception::types::{CueMatch, CueSource, Frame, SceneObservation, TextToken};

/// Per-call options; the engine keeps no state between frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerceptionPass {
    pub ocr: bool,
}

impl PerceptionPass {
    pub const FULL: PerceptionPass = PerceptionPass { ocr: true };
    pub const GEOMETRY_ONLY: PerceptionPass = PerceptionPass { ocr: false };
}

pub struct PerceptionEngine {
    config: PerceptionConfig,
    calibration: Arc<Calibration>,
    ocr: Option<OcrReader>,
}

impl PerceptionEngine {
    pub fn new(
        config: &PerceptionConfig,
        calibration: Arc<Calibration>,
        recognizer: Option<Box<dyn TextRecognizer>>,
    ) -> Self {
        let ocr = recognizer
            .filter(|_| config.ocr_enabled)
            .map(|r| OcrReader::new(r, config.ocr_min_confidence, config.ocr_upscale));
        Self {
            config: config.clone(),
            calibration,
            ocr,
        }
    }

    pub fn has_ocr(&self) -> bool {
        self.ocr.is_some()
    }

    pub fn observe(&self, frame: &Frame) -> AutoplayResult<SceneObservation> {
        self.observe_with(frame, PerceptionPass::FULL)
    }

    pub fn observe_with(&self, frame: &Frame, pass: PerceptionPass) -> AutoplayResult<SceneObservation> {
        if frame.is_empty() || frame.geometry.is_empty() {
            return Err(AutoplayError::Capture(format!(
                "zero-size frame ({}x{}, geometry {}x{})",
                frame.image.width(),
                frame.image.height(),
                frame.geometry.width,
                frame.geometry.height
            )));
        }

        // ── Working image ──────────────────────────────────────────────────
        let gray = imageops::grayscale(frame.image.as_ref());
        let working = if gray.width() > self.config.working_width {
            let scale = self.config.working_width as f32 / gray.width() as f32;
            let h = ((gray.height() as f32 * scale).round() as u32).max(1);
            imageops::resize(&gray, self.config.working_width, h, FilterType::Triangle)
        } else {
            gray
        };

        // ── Geometric cues ─────────────────────────────────────────────────
        let edges = EdgeMap::compute(&working, self.config.edge_threshold);
        let mut cues = heuristic_cues(&edges, &self.calibration.bands);
        cues.extend(self.calibration.templates.iter().filter_map(|t| t.find(&working)));

        // ── Text ───────────────────────────────────────────────────────────
        let (tokens, ocr_ran) = match (&self.ocr, pass.ocr) {
            (Some(reader), true) => (self.read_text(reader, frame), true),
            _ => (Vec::new(), false),
        };
        cues.extend(self.text_cues(&tokens));
        let menu_detected = self
            .calibration
            .ocr_regions()
            .iter()
            .any(|r| looks_like_menu(&region_lines(&tokens, &r.name)));

        tracing::debug!(
            cues = cues.len(),
            tokens = tokens.len(),
            ocr_ran,
            menu_detected,
            "scene observed"
        );

        Ok(SceneObservation {
            captured_at: frame.captured_at,
            geometry: frame.geometry,
            tokens,
            cues,
            ocr_ran,
            menu_detected,
            signature: FrameSignature::from_gray(&working),
            preview: Arc::new(working),
        })
    }

    /// A failing recognizer costs this tick its text, not the whole tick.
    fn read_text(&self, reader: &OcrReader, frame: &Frame) -> Vec<TextToken> {
        let mut tokens = Vec::new();
        for region in self.calibration.ocr_regions() {
            match reader.read_region(&frame.image, region) {
                Ok(mut found) => tokens.append(&mut found),
                Err(e) => tracing::warn!(region = %region.name, error = %e, "OCR failed for region"),
            }
        }
        tokens
    }

    fn text_cues(&self, tokens: &[TextToken]) -> Vec<CueMatch> {
        let mut cues = Vec::new();
        for token in tokens.iter().filter(|t| !t.low_confidence) {
            for cue in &self.calibration.text_cues {
                if cue.pattern.is_match(&token.text) {
                    cues.push(CueMatch {
                        kind: cue.cue,
                        bbox: token.bbox,
                        confidence: token.confidence,
                        source: CueSource::Text,
                    });
                }
            }
        }
        cues
    }
}
