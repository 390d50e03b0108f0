//! Deterministic platform doubles and synthetic frames shared by unit tests.
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use image::{DynamicImage, GrayImage, Luma};
use tokio::time::Instant;

use crate::config::CalibrationConfig;
use crate::errors::{AutoplayError, AutoplayResult};
use crate::executor::input::{InputBackend, KeyCode};
use crate::executor::safety::FocusProbe;
use crate::perception::calibration::Calibration;
use crate::perception::stability::FrameSignature;
use crate::perception::traits::{FrameSource, RecognizedWord, TextRecognizer, WindowHandle};
use crate::perception::types::{BBox, CueKind, CueMatch, CueSource, Frame, SceneObservation, WindowGeometry};

// ── Synthetic 320×240 scenes ──────────────────────────────────────────────────

fn wall(x: u32) -> bool {
    (x < 80 || x >= 240) && (x / 8) % 2 == 0
}

/// Textured walls on both sides, open floor ahead.
pub fn corridor() -> GrayImage {
    GrayImage::from_fn(320, 240, |x, _| Luma([if wall(x) { 255 } else { 0 }]))
}

/// Wall on the right only; the left side opens up.
pub fn turn_left() -> GrayImage {
    GrayImage::from_fn(320, 240, |x, _| Luma([if x >= 240 && (x / 8) % 2 == 0 { 255 } else { 0 }]))
}

/// Facing wall with both sides open: a T-junction.
pub fn junction() -> GrayImage {
    GrayImage::from_fn(320, 240, |x, y| {
        let ahead = (112..208).contains(&x) && (36..144).contains(&y);
        Luma([if ahead && (y / 6) % 2 == 0 { 255 } else { 0 }])
    })
}

/// Walls on both sides and a facing wall.
pub fn dead_end() -> GrayImage {
    GrayImage::from_fn(320, 240, |x, y| {
        let facing = (90..230).contains(&x) && (20..200).contains(&y) && (y / 6) % 2 == 0;
        Luma([if wall(x) || facing { 255 } else { 0 }])
    })
}

/// Corridor with two tall door jambs straight ahead.
pub fn door() -> GrayImage {
    GrayImage::from_fn(320, 240, |x, y| {
        let jamb = (40..140).contains(&y) && ((130..134).contains(&x) || (186..190).contains(&x));
        Luma([if wall(x) || jamb { 255 } else { 0 }])
    })
}

pub fn blank() -> GrayImage {
    GrayImage::from_pixel(320, 240, Luma([90]))
}

pub fn frame(gray: GrayImage) -> Frame {
    let (width, height) = gray.dimensions();
    let rgba = DynamicImage::ImageLuma8(gray).to_rgba8();
    Frame::new(rgba, WindowGeometry { x: 0, y: 0, width, height })
}

pub fn calibration() -> Arc<Calibration> {
    Arc::new(Calibration::load(&CalibrationConfig::default(), 320, Path::new(".")).unwrap())
}

// ── Hand-built observations ───────────────────────────────────────────────────

pub fn cue(kind: CueKind, confidence: f32) -> CueMatch {
    CueMatch {
        kind,
        bbox: BBox::FULL,
        confidence,
        source: CueSource::Heuristic,
    }
}

pub fn text_cue(kind: CueKind, confidence: f32) -> CueMatch {
    CueMatch {
        source: CueSource::Text,
        ..cue(kind, confidence)
    }
}

pub fn observation(cues: Vec<CueMatch>) -> SceneObservation {
    let preview = GrayImage::new(32, 18);
    SceneObservation {
        captured_at: Instant::now(),
        geometry: WindowGeometry { x: 0, y: 0, width: 320, height: 240 },
        tokens: Vec::new(),
        cues,
        ocr_ran: false,
        menu_detected: false,
        signature: FrameSignature::from_gray(&preview),
        preview: Arc::new(preview),
    }
}

// ── Frame source ──────────────────────────────────────────────────────────────

/// Plays back a script of frames and errors, one per capture. An exhausted
/// script behaves like a closed window.
#[derive(Default)]
pub struct ScriptedFrames {
    script: VecDeque<AutoplayResult<GrayImage>>,
}

impl ScriptedFrames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_frame(mut self, gray: GrayImage) -> Self {
        self.script.push_back(Ok(gray));
        self
    }

    pub fn then_error(mut self, error: AutoplayError) -> Self {
        self.script.push_back(Err(error));
        self
    }
}

impl FrameSource for ScriptedFrames {
    fn capture(&mut self, window: &WindowHandle) -> AutoplayResult<Frame> {
        match self.script.pop_front() {
            Some(Ok(gray)) => Ok(frame(gray)),
            Some(Err(e)) => Err(e),
            None => Err(AutoplayError::WindowNotFound(window.to_string())),
        }
    }
}

// ── Input ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Press(KeyCode),
    Release(KeyCode),
    Click(i32, i32),
}

/// Shared view of everything a [`RecordingInput`] emitted, with timestamps.
#[derive(Clone, Default)]
pub struct InputLog(Arc<Mutex<Vec<(InputEvent, Instant)>>>);

impl InputLog {
    fn push(&self, event: InputEvent) {
        self.0.lock().unwrap().push((event, Instant::now()));
    }

    pub fn events(&self) -> Vec<InputEvent> {
        self.0.lock().unwrap().iter().map(|(e, _)| *e).collect()
    }

    pub fn timed(&self) -> Vec<(InputEvent, Instant)> {
        self.0.lock().unwrap().clone()
    }

    /// Every press was matched by a later release.
    pub fn nothing_held(&self) -> bool {
        let mut down: HashMap<KeyCode, i32> = HashMap::new();
        for event in self.events() {
            match event {
                InputEvent::Press(k) => *down.entry(k).or_default() += 1,
                InputEvent::Release(k) => *down.entry(k).or_default() -= 1,
                InputEvent::Click(..) => {}
            }
        }
        down.values().all(|n| *n <= 0)
    }
}

#[derive(Default)]
pub struct RecordingInput {
    log: InputLog,
    presses: usize,
    fail_press_at: Option<usize>,
    failing_releases: usize,
    deny: bool,
}

impl RecordingInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first `n` presses succeed; press number `n + 1` fails.
    pub fn fail_press_after(mut self, n: usize) -> Self {
        self.fail_press_at = Some(n);
        self
    }

    /// The next `n` releases fail without reaching the log.
    pub fn fail_release_times(mut self, n: usize) -> Self {
        self.failing_releases = n;
        self
    }

    pub fn deny_permission(mut self) -> Self {
        self.deny = true;
        self
    }

    pub fn log(&self) -> InputLog {
        self.log.clone()
    }
}

impl InputBackend for RecordingInput {
    fn press(&mut self, key: KeyCode) -> AutoplayResult<()> {
        if self.deny {
            return Err(AutoplayError::PermissionDenied("accessibility not granted".into()));
        }
        let index = self.presses;
        self.presses += 1;
        if self.fail_press_at == Some(index) {
            return Err(AutoplayError::Dispatch(format!("injected failure on {key}")));
        }
        self.log.push(InputEvent::Press(key));
        Ok(())
    }

    fn release(&mut self, key: KeyCode) -> AutoplayResult<()> {
        if self.failing_releases > 0 {
            self.failing_releases -= 1;
            return Err(AutoplayError::Dispatch(format!("injected release failure on {key}")));
        }
        self.log.push(InputEvent::Release(key));
        Ok(())
    }

    fn click_at(&mut self, x: i32, y: i32) -> AutoplayResult<()> {
        if self.deny {
            return Err(AutoplayError::PermissionDenied("accessibility not granted".into()));
        }
        self.log.push(InputEvent::Click(x, y));
        Ok(())
    }
}

// ── Focus ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct FocusSwitch(Arc<AtomicBool>);

impl FocusSwitch {
    pub fn focused() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn set(&self, focused: bool) {
        self.0.store(focused, Ordering::SeqCst);
    }
}

impl FocusProbe for FocusSwitch {
    fn is_focused(&mut self, _target: &WindowHandle) -> AutoplayResult<bool> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

// ── OCR ───────────────────────────────────────────────────────────────────────

/// Returns the same words for every crop and counts how often it was asked.
pub struct CannedText {
    words: Vec<RecognizedWord>,
    calls: Arc<AtomicUsize>,
}

impl CannedText {
    /// One entry per text line; words are laid out left to right.
    pub fn lines(lines: &[(&str, f32)]) -> Self {
        let mut words = Vec::new();
        for (i, (text, confidence)) in lines.iter().enumerate() {
            for (j, word) in text.split_whitespace().enumerate() {
                words.push(RecognizedWord {
                    text: word.to_string(),
                    left: 10 + j as u32 * 60,
                    top: 10 + i as u32 * 30,
                    width: 50,
                    height: 20,
                    confidence: *confidence,
                    line_key: (1, 1, i as u32 + 1),
                });
            }
        }
        Self {
            words,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl TextRecognizer for CannedText {
    fn recognize(&self, _image: &GrayImage) -> AutoplayResult<Vec<RecognizedWord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.words.clone())
    }
}
