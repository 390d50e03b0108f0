/// Normalized cross-correlation matching of calibrated grayscale templates.
use image::GrayImage;

use crate::errors::{AutoplayError, AutoplayResult};
use crate::perception::types::{BBox, CueKind, CueMatch, CueSource};

const SEARCH_STRIDE: u32 = 2;

pub struct Template {
    pub name: String,
    pub cue: CueKind,
    pub threshold: f32,
    pub region: BBox,
    width: u32,
    height: u32,
    /// Zero-mean template pixels.
    centered: Vec<f32>,
    norm: f32,
}

impl Template {
    pub fn new(name: &str, cue: CueKind, image: &GrayImage, threshold: f32, region: BBox) -> AutoplayResult<Self> {
        let (width, height) = image.dimensions();
        if width < 2 || height < 2 {
            return Err(AutoplayError::Calibration(format!("template {name} is smaller than 2×2")));
        }
        let n = (width * height) as f32;
        let mean = image.as_raw().iter().map(|&p| p as f32).sum::<f32>() / n;
        let centered: Vec<f32> = image.as_raw().iter().map(|&p| p as f32 - mean).collect();
        let norm = centered.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm < 1e-3 {
            return Err(AutoplayError::Calibration(format!("template {name} has no contrast")));
        }
        Ok(Self {
            name: name.to_string(),
            cue,
            threshold,
            region,
            width,
            height,
            centered,
            norm,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Best correlation of the template inside its search region, if it clears
    /// the template's threshold.
    pub fn find(&self, gray: &GrayImage) -> Option<CueMatch> {
        let (iw, ih) = gray.dimensions();
        let (rx, ry, rw, rh) = self.region.to_pixels(iw, ih);
        if rw < self.width || rh < self.height {
            return None;
        }

        let mut best = (f32::MIN, 0u32, 0u32);
        let mut y = ry;
        while y + self.height <= ry + rh {
            let mut x = rx;
            while x + self.width <= rx + rw {
                let score = self.score_at(gray, x, y);
                if score > best.0 {
                    best = (score, x, y);
                }
                x += SEARCH_STRIDE;
            }
            y += SEARCH_STRIDE;
        }

        let (score, x, y) = best;
        tracing::trace!(template = %self.name, score, x, y, "template best match");
        if score < self.threshold {
            return None;
        }
        Some(CueMatch {
            kind: self.cue,
            bbox: BBox::from_pixels(x, y, self.width, self.height, iw, ih),
            confidence: score.clamp(0.0, 1.0),
            source: CueSource::Template(self.name.clone()),
        })
    }

    fn score_at(&self, gray: &GrayImage, x0: u32, y0: u32) -> f32 {
        let iw = gray.width();
        let raw = gray.as_raw();
        let n = (self.width * self.height) as f32;

        let mut sum = 0.0f32;
        let mut sum_sq = 0.0f32;
        let mut dot = 0.0f32;
        for ty in 0..self.height {
            let row = ((y0 + ty) * iw + x0) as usize;
            let trow = (ty * self.width) as usize;
            for tx in 0..self.width as usize {
                let p = raw[row + tx] as f32;
                sum += p;
                sum_sq += p * p;
                dot += p * self.centered[trow + tx];
            }
        }
        // Σ(p - p̄)·t' == Σp·t' because Σt' == 0
        let var = sum_sq - sum * sum / n;
        if var <= 1e-3 {
            return 0.0;
        }
        dot / (var.sqrt() * self.norm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn cross() -> GrayImage {
        GrayImage::from_fn(8, 8, |x, y| Luma([if x == 3 || x == 4 || y == 3 || y == 4 { 250 } else { 10 }]))
    }

    #[test]
    fn finds_template_at_its_position() {
        let tpl = Template::new("cross", CueKind::TurnMarker(crate::perception::types::Side::Left), &cross(), 0.9, BBox::FULL).unwrap();
        let mut scene = GrayImage::from_pixel(64, 48, Luma([10]));
        image::imageops::replace(&mut scene, &cross(), 20, 12);

        let m = tpl.find(&scene).unwrap();
        assert!(m.confidence > 0.99);
        let (cx, cy) = m.bbox.center();
        assert!((cx - 24.0 / 64.0).abs() < 0.02);
        assert!((cy - 16.0 / 48.0).abs() < 0.02);
        assert_eq!(m.source, CueSource::Template("cross".into()));
    }

    #[test]
    fn flat_scene_does_not_match() {
        let tpl = Template::new("cross", CueKind::DoorFrame, &cross(), 0.5, BBox::FULL).unwrap();
        assert!(tpl.find(&GrayImage::from_pixel(64, 48, Luma([128]))).is_none());
    }

    #[test]
    fn region_limits_the_search() {
        let tpl = Template::new("cross", CueKind::DoorFrame, &cross(), 0.9, BBox::new(0.5, 0.0, 1.0, 1.0)).unwrap();
        let mut scene = GrayImage::from_pixel(64, 48, Luma([10]));
        image::imageops::replace(&mut scene, &cross(), 4, 4);
        assert!(tpl.find(&scene).is_none());
    }

    #[test]
    fn rejects_flat_template() {
        let flat = GrayImage::from_pixel(6, 6, Luma([42]));
        assert!(matches!(
            Template::new("flat", CueKind::DoorFrame, &flat, 0.8, BBox::FULL),
            Err(AutoplayError::Calibration(_))
        ));
    }
}
