/// Edge statistics over calibrated bands of the working image, and the
/// geometric heuristics built on them (walls, openings, corridor, obstacle,
/// door jambs).
use image::GrayImage;

use crate::config::{CalibrationConfig, EdgeHeuristics};
use crate::perception::types::{BBox, CueKind, CueMatch, CueSource, Side};

/// Per-pixel edge orientation from a 3×3 Sobel pass.
pub struct EdgeMap {
    width: u32,
    height: u32,
    /// Strong horizontal gradient: the edge line itself runs vertically.
    vertical: Vec<bool>,
    horizontal: Vec<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BandStats {
    /// Fraction of band pixels on a vertical edge.
    pub vertical: f32,
    pub horizontal: f32,
}

impl EdgeMap {
    pub fn compute(gray: &GrayImage, threshold: u16) -> Self {
        let (w, h) = gray.dimensions();
        let len = (w * h) as usize;
        let mut vertical = vec![false; len];
        let mut horizontal = vec![false; len];
        if w < 3 || h < 3 {
            return Self { width: w, height: h, vertical, horizontal };
        }

        let raw = gray.as_raw();
        let px = |x: u32, y: u32| raw[(y * w + x) as usize] as i32;
        let threshold = threshold as i32;

        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let gx = (px(x + 1, y - 1) + 2 * px(x + 1, y) + px(x + 1, y + 1))
                    - (px(x - 1, y - 1) + 2 * px(x - 1, y) + px(x - 1, y + 1));
                let gy = (px(x - 1, y + 1) + 2 * px(x, y + 1) + px(x + 1, y + 1))
                    - (px(x - 1, y - 1) + 2 * px(x, y - 1) + px(x + 1, y - 1));
                let (ax, ay) = (gx.abs(), gy.abs());
                let idx = (y * w + x) as usize;
                if ax >= threshold && ax >= 2 * ay {
                    vertical[idx] = true;
                } else if ay >= threshold && ay >= 2 * ax {
                    horizontal[idx] = true;
                }
            }
        }

        Self { width: w, height: h, vertical, horizontal }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn band_stats(&self, band: &BBox) -> BandStats {
        let (x0, y0, bw, bh) = band.to_pixels(self.width, self.height);
        let total = (bw * bh) as f32;
        if total == 0.0 {
            return BandStats::default();
        }
        let (mut v, mut hz) = (0u32, 0u32);
        for y in y0..y0 + bh {
            for x in x0..x0 + bw {
                let idx = (y * self.width + x) as usize;
                v += self.vertical[idx] as u32;
                hz += self.horizontal[idx] as u32;
            }
        }
        BandStats {
            vertical: v as f32 / total,
            horizontal: hz as f32 / total,
        }
    }

    /// Number of columns in `band` holding an unbroken vertical edge run of at
    /// least `min_run` pixels.
    pub fn vertical_runs(&self, band: &BBox, min_run: u32) -> u32 {
        let (x0, y0, bw, bh) = band.to_pixels(self.width, self.height);
        let min_run = min_run.max(1);
        let mut columns = 0;
        for x in x0..x0 + bw {
            let mut run = 0;
            let mut best = 0;
            for y in y0..y0 + bh {
                if self.vertical[(y * self.width + x) as usize] {
                    run += 1;
                    best = best.max(run);
                } else {
                    run = 0;
                }
            }
            if best >= min_run {
                columns += 1;
            }
        }
        columns
    }
}

fn heuristic(kind: CueKind, bbox: BBox, confidence: f32) -> CueMatch {
    CueMatch {
        kind,
        bbox,
        confidence: confidence.clamp(0.0, 1.0),
        source: CueSource::Heuristic,
    }
}

/// Derive geometric cues from band edge densities. Every cue needs positive
/// edge evidence somewhere in the frame: a featureless frame yields nothing.
pub fn heuristic_cues(edges: &EdgeMap, cal: &CalibrationConfig) -> Vec<CueMatch> {
    let h: &EdgeHeuristics = &cal.heuristics;
    let left = edges.band_stats(&cal.left_band);
    let right = edges.band_stats(&cal.right_band);
    let ahead = edges.band_stats(&cal.ahead_band);

    let walled = |s: &BandStats| s.vertical >= h.wall_min_density;
    let structure = walled(&left) || walled(&right) || ahead.horizontal >= h.obstacle_min_density;
    let mut cues = Vec::new();
    if !structure {
        return cues;
    }

    let sides = [(Side::Left, left, cal.left_band), (Side::Right, right, cal.right_band)];
    let mut walled_sides = 0;
    for (side, stats, band) in sides {
        if walled(&stats) {
            walled_sides += 1;
            let conf = stats.vertical / (2.0 * h.wall_min_density);
            cues.push(heuristic(CueKind::WallEdge(side), band, conf));
        } else if stats.vertical <= h.opening_max_density && stats.horizontal <= h.opening_max_density {
            let conf = 1.0 - (stats.vertical + stats.horizontal) / (2.0 * h.opening_max_density);
            cues.push(heuristic(CueKind::TurnMarker(side), band, conf));
        }
    }

    if ahead.horizontal >= h.obstacle_min_density {
        let conf = ahead.horizontal / (2.0 * h.obstacle_min_density);
        cues.push(heuristic(CueKind::Obstacle, cal.ahead_band, conf));
    } else if walled_sides > 0 && ahead.horizontal <= h.open_ahead_max_density {
        let openness = 1.0 - ahead.horizontal / h.open_ahead_max_density;
        let support = 0.5 + 0.25 * walled_sides as f32;
        cues.push(heuristic(CueKind::CorridorAhead, cal.ahead_band, openness * support));
    }

    let (_, height) = edges.dimensions();
    let min_run = (h.door_min_run * height as f32).round() as u32;
    let jambs = edges.vertical_runs(&cal.ahead_band, min_run);
    if jambs > 0 {
        let conf = jambs as f32 / h.door_full_runs.max(1) as f32;
        cues.push(heuristic(CueKind::DoorFrame, cal.ahead_band, conf));
    }

    cues
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// 320×240 frame with 8 px vertical stripes inside the given x-ranges.
    fn striped(ranges: &[(u32, u32)]) -> GrayImage {
        GrayImage::from_fn(320, 240, |x, _| {
            let inside = ranges.iter().any(|&(a, b)| x >= a && x < b);
            Luma([if inside && (x / 8) % 2 == 0 { 255 } else { 0 }])
        })
    }

    fn find(cues: &[CueMatch], kind: CueKind) -> Option<&CueMatch> {
        cues.iter().find(|c| c.kind == kind)
    }

    #[test]
    fn sobel_marks_stripe_boundaries_as_vertical() {
        let edges = EdgeMap::compute(&striped(&[(0, 320)]), 48);
        let stats = edges.band_stats(&BBox::new(0.1, 0.1, 0.9, 0.9));
        assert!(stats.vertical > 0.2, "{stats:?}");
        assert_eq!(stats.horizontal, 0.0);
    }

    #[test]
    fn blank_frame_has_no_cues() {
        let edges = EdgeMap::compute(&GrayImage::from_pixel(320, 240, Luma([90])), 48);
        assert!(heuristic_cues(&edges, &CalibrationConfig::default()).is_empty());
    }

    #[test]
    fn walls_on_both_sides_read_as_corridor() {
        let edges = EdgeMap::compute(&striped(&[(0, 80), (240, 320)]), 48);
        let cues = heuristic_cues(&edges, &CalibrationConfig::default());
        assert!(find(&cues, CueKind::WallEdge(Side::Left)).is_some());
        assert!(find(&cues, CueKind::WallEdge(Side::Right)).is_some());
        let corridor = find(&cues, CueKind::CorridorAhead).unwrap();
        assert!(corridor.confidence > 0.9);
        assert!(find(&cues, CueKind::TurnMarker(Side::Left)).is_none());
        assert!(find(&cues, CueKind::Obstacle).is_none());
    }

    #[test]
    fn missing_left_wall_is_a_turn_marker() {
        let edges = EdgeMap::compute(&striped(&[(240, 320)]), 48);
        let cues = heuristic_cues(&edges, &CalibrationConfig::default());
        let turn = find(&cues, CueKind::TurnMarker(Side::Left)).unwrap();
        assert!(turn.confidence > 0.9);
        assert!(find(&cues, CueKind::TurnMarker(Side::Right)).is_none());
        assert!(find(&cues, CueKind::WallEdge(Side::Right)).is_some());
    }

    #[test]
    fn facing_wall_is_an_obstacle() {
        // horizontal stripes across the ahead band only
        let img = GrayImage::from_fn(320, 240, |x, y| {
            let ahead = (112..208).contains(&x) && (36..144).contains(&y);
            Luma([if ahead && (y / 6) % 2 == 0 { 255 } else { 0 }])
        });
        let edges = EdgeMap::compute(&img, 48);
        let cues = heuristic_cues(&edges, &CalibrationConfig::default());
        assert!(find(&cues, CueKind::Obstacle).is_some());
        assert!(find(&cues, CueKind::CorridorAhead).is_none());
        // both sides are quiet while the frame has structure
        assert!(find(&cues, CueKind::TurnMarker(Side::Left)).is_some());
        assert!(find(&cues, CueKind::TurnMarker(Side::Right)).is_some());
    }

    #[test]
    fn tall_jambs_ahead_count_as_door_frame() {
        // walls on both sides plus two bright 4 px jambs in the ahead band
        let img = GrayImage::from_fn(320, 240, |x, y| {
            let wall = (x < 80 || x >= 240) && (x / 8) % 2 == 0;
            let jamb = (40..140).contains(&y) && ((130..134).contains(&x) || (186..190).contains(&x));
            Luma([if wall || jamb { 255 } else { 0 }])
        });
        let edges = EdgeMap::compute(&img, 48);
        let cues = heuristic_cues(&edges, &CalibrationConfig::default());
        let door = find(&cues, CueKind::DoorFrame).unwrap();
        assert!(door.confidence >= 0.6, "{door:?}");
    }
}
