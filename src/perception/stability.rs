use std::time::Duration;

use image::imageops::{self, FilterType};
use image::GrayImage;
use tokio::time::Instant;

pub const SIGNATURE_WIDTH: u32 = 32;
pub const SIGNATURE_HEIGHT: u32 = 18;

/// Tiny grayscale thumbnail used to tell whether the screen moved between ticks.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSignature {
    pixels: Vec<u8>,
}

impl FrameSignature {
    pub fn from_gray(gray: &GrayImage) -> Self {
        if gray.width() == 0 || gray.height() == 0 {
            return Self { pixels: Vec::new() };
        }
        let thumb = imageops::resize(gray, SIGNATURE_WIDTH, SIGNATURE_HEIGHT, FilterType::Triangle);
        Self { pixels: thumb.into_raw() }
    }

    /// Zero-mean normalized correlation mapped to [0, 1]; 1.0 means identical
    /// structure. Two flat images are considered identical.
    pub fn similarity(&self, other: &FrameSignature) -> f64 {
        if self.pixels.is_empty() || self.pixels.len() != other.pixels.len() {
            return 0.0;
        }
        let n = self.pixels.len() as f64;
        let mean = |p: &[u8]| p.iter().map(|&v| v as f64).sum::<f64>() / n;
        let (ma, mb) = (mean(&self.pixels), mean(&other.pixels));

        let (mut cov, mut va, mut vb) = (0.0, 0.0, 0.0);
        for (&a, &b) in self.pixels.iter().zip(&other.pixels) {
            let (da, db) = (a as f64 - ma, b as f64 - mb);
            cov += da * db;
            va += da * da;
            vb += db * db;
        }
        if va < 1e-6 && vb < 1e-6 {
            return if (ma - mb).abs() < 1.0 { 1.0 } else { 0.0 };
        }
        let denom = (va * vb).sqrt();
        if denom < 1e-6 {
            return 0.5;
        }
        ((cov / denom) + 1.0) / 2.0
    }
}

/// Accumulates how long consecutive frames have stayed visually unchanged.
pub struct StillnessTracker {
    threshold: f64,
    last: Option<(FrameSignature, Instant)>,
    still_since: Option<Instant>,
}

impl StillnessTracker {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            last: None,
            still_since: None,
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.still_since = None;
    }

    /// Feed the signature of a new frame; returns how long the screen has been still.
    pub fn update(&mut self, signature: &FrameSignature, at: Instant) -> Duration {
        if let Some((prev, prev_at)) = &self.last {
            let sim = prev.similarity(signature);
            if sim >= self.threshold {
                self.still_since.get_or_insert(*prev_at);
            } else {
                self.still_since = None;
            }
            tracing::trace!(similarity = sim, "frame similarity");
        }
        self.last = Some((signature.clone(), at));
        self.still_for(at)
    }

    pub fn still_for(&self, now: Instant) -> Duration {
        self.still_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default()
    }
}
