/// OCR over calibrated regions of interest.
///
/// Crops are binarised before recognition (grayscale → upscale → contrast
/// stretch → adaptive mean threshold), recognised through the `tesseract`
/// CLI in TSV mode, and mapped back into normalized frame coordinates.
use std::collections::BTreeMap;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::OnceLock;

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbaImage};
use regex::Regex;

use crate::config::NamedRegion;
use crate::errors::{AutoplayError, AutoplayResult};
use crate::perception::traits::{RecognizedWord, TextRecognizer};
use crate::perception::types::{BBox, TextToken};

const THRESH_BLOCK: u32 = 31;
const THRESH_C: i32 = 10;
/// Lines at most this long count as menu entries.
const MENU_LINE_MAX_CHARS: usize = 18;

// ── Preprocessing ─────────────────────────────────────────────────────────────

/// Upscale, stretch contrast and binarise (dark text on white).
pub fn preprocess(gray: &GrayImage, upscale: f32) -> GrayImage {
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return gray.clone();
    }
    let scale = upscale.max(1.0);
    let (nw, nh) = ((w as f32 * scale).round() as u32, (h as f32 * scale).round() as u32);
    let mut img = if scale > 1.0 {
        imageops::resize(gray, nw, nh, FilterType::CatmullRom)
    } else {
        gray.clone()
    };
    stretch_contrast(&mut img);
    adaptive_threshold(&img, THRESH_BLOCK, THRESH_C)
}

fn stretch_contrast(img: &mut GrayImage) {
    let (lo, hi) = img
        .as_raw()
        .iter()
        .fold((u8::MAX, u8::MIN), |(lo, hi), &p| (lo.min(p), hi.max(p)));
    if hi <= lo {
        return;
    }
    let range = (hi - lo) as f32;
    for p in img.pixels_mut() {
        p[0] = (((p[0] - lo) as f32 / range) * 255.0).round() as u8;
    }
}

/// Mean-of-neighbourhood threshold computed with an integral image.
fn adaptive_threshold(img: &GrayImage, block: u32, c: i32) -> GrayImage {
    let (w, h) = img.dimensions();
    let raw = img.as_raw();
    let stride = (w + 1) as usize;
    let mut integral = vec![0u64; stride * (h + 1) as usize];
    for y in 0..h as usize {
        let mut row = 0u64;
        for x in 0..w as usize {
            row += raw[y * w as usize + x] as u64;
            integral[(y + 1) * stride + x + 1] = integral[y * stride + x + 1] + row;
        }
    }

    let r = (block / 2) as i64;
    GrayImage::from_fn(w, h, |x, y| {
        let x0 = (x as i64 - r).max(0) as usize;
        let y0 = (y as i64 - r).max(0) as usize;
        let x1 = ((x as i64 + r + 1).min(w as i64)) as usize;
        let y1 = ((y as i64 + r + 1).min(h as i64)) as usize;
        let area = ((x1 - x0) * (y1 - y0)) as u64;
        let sum = integral[y1 * stride + x1] + integral[y0 * stride + x0]
            - integral[y0 * stride + x1]
            - integral[y1 * stride + x0];
        let mean = (sum / area.max(1)) as i32;
        let p = raw[y as usize * w as usize + x as usize] as i32;
        Luma([if p > mean - c { 255 } else { 0 }])
    })
}

// ── Tesseract CLI ─────────────────────────────────────────────────────────────

pub struct TesseractCli {
    binary: String,
    lang: String,
    psm: u32,
}

impl TesseractCli {
    pub fn new(binary: &str, lang: &str) -> Self {
        Self {
            binary: binary.to_string(),
            lang: lang.to_string(),
            psm: 6,
        }
    }
}

impl TextRecognizer for TesseractCli {
    fn recognize(&self, image: &GrayImage) -> AutoplayResult<Vec<RecognizedWord>> {
        let mut png = Vec::new();
        image
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .map_err(|e| AutoplayError::Ocr(format!("PNG encode: {e}")))?;

        let psm = self.psm.to_string();
        let mut child = Command::new(&self.binary)
            .args(["stdin", "stdout", "-l", &self.lang, "--psm", &psm, "tsv"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AutoplayError::Ocr(format!("spawn {}: {e}", self.binary)))?;

        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(&png),
            None => Ok(()),
        };
        // reap the child even when it stopped reading early
        let output = child.wait_with_output()?;
        if let Err(e) = written {
            return Err(AutoplayError::Ocr(format!("write to {}: {e}", self.binary)));
        }
        if !output.status.success() {
            return Err(AutoplayError::Ocr(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(parse_tsv(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse tesseract's TSV output, keeping word-level rows with text.
pub fn parse_tsv(tsv: &str) -> Vec<RecognizedWord> {
    let mut words = Vec::new();
    for line in tsv.lines().skip(1) {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let text = cols[11].trim();
        if text.is_empty() {
            continue;
        }
        let num = |i: usize| cols[i].trim().parse::<u32>().unwrap_or(0);
        let conf = cols[10].trim().parse::<f32>().unwrap_or(-1.0);
        if conf < 0.0 {
            continue;
        }
        words.push(RecognizedWord {
            text: text.to_string(),
            left: num(6),
            top: num(7),
            width: num(8),
            height: num(9),
            confidence: (conf / 100.0).clamp(0.0, 1.0),
            line_key: (num(2), num(3), num(4)),
        });
    }
    words
}

// ── Region reader ─────────────────────────────────────────────────────────────

pub struct OcrReader {
    recognizer: Box<dyn TextRecognizer>,
    min_confidence: f32,
    upscale: f32,
}

impl OcrReader {
    pub fn new(recognizer: Box<dyn TextRecognizer>, min_confidence: f32, upscale: f32) -> Self {
        Self {
            recognizer,
            min_confidence,
            upscale,
        }
    }

    /// Read one named region of `frame`. Tokens below the confidence floor
    /// are returned flagged, never dropped.
    pub fn read_region(&self, frame: &RgbaImage, region: &NamedRegion) -> AutoplayResult<Vec<TextToken>> {
        let (fw, fh) = frame.dimensions();
        let (rx, ry, rw, rh) = region.rect.to_pixels(fw, fh);
        if rw == 0 || rh == 0 {
            return Ok(Vec::new());
        }
        let crop = imageops::crop_imm(frame, rx, ry, rw, rh).to_image();
        let gray = imageops::grayscale(&crop);
        let prepared = preprocess(&gray, self.upscale);
        let scale = prepared.width() as f32 / rw as f32;

        let words = self.recognizer.recognize(&prepared)?;

        // order lines top to bottom by their first word
        let mut line_tops: BTreeMap<(u32, u32, u32), u32> = BTreeMap::new();
        for w in &words {
            let top = line_tops.entry(w.line_key).or_insert(w.top);
            *top = (*top).min(w.top);
        }
        let mut ordered: Vec<_> = line_tops.into_iter().collect();
        ordered.sort_by_key(|(_, top)| *top);
        let line_index = |key: &(u32, u32, u32)| ordered.iter().position(|(k, _)| k == key).unwrap_or(0) as u32;

        let to_frame = |v: u32| (v as f32 / scale).round() as u32;
        Ok(words
            .iter()
            .map(|w| TextToken {
                text: w.text.clone(),
                bbox: BBox::from_pixels(
                    rx + to_frame(w.left),
                    ry + to_frame(w.top),
                    to_frame(w.width),
                    to_frame(w.height),
                    fw,
                    fh,
                ),
                confidence: w.confidence,
                low_confidence: w.confidence < self.min_confidence,
                region: region.name.clone(),
                line: line_index(&w.line_key),
            })
            .collect())
    }
}

// ── Text heuristics ───────────────────────────────────────────────────────────

fn text_chars() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[0-9A-Za-z\p{Hiragana}\p{Katakana}\p{Han}]").ok())
        .as_ref()
}

/// Count of alphanumeric / kana / kanji characters over confident tokens.
pub fn meaningful_chars<'a>(tokens: impl IntoIterator<Item = &'a TextToken>) -> usize {
    tokens
        .into_iter()
        .filter(|t| !t.low_confidence)
        .map(|t| match text_chars() {
            Some(re) => re.find_iter(&t.text).count(),
            None => t.text.chars().filter(|c| c.is_alphanumeric()).count(),
        })
        .sum()
}

const LINE_DECORATION: &str = "•>▶-–·◆* ";

/// Confident words of one region joined per line, top to bottom, still
/// carrying any leading cursor glyph.
fn joined_lines<'a>(tokens: impl IntoIterator<Item = &'a TextToken>, region: &str) -> Vec<String> {
    let mut lines: BTreeMap<u32, Vec<&str>> = BTreeMap::new();
    for t in tokens.into_iter().filter(|t| t.region == region && !t.low_confidence) {
        lines.entry(t.line).or_default().push(t.text.as_str());
    }
    lines.into_values().map(|words| words.join(" ")).collect()
}

/// Lines of confident text in one region, joined per line.
pub fn region_lines<'a>(tokens: impl IntoIterator<Item = &'a TextToken>, region: &str) -> Vec<String> {
    joined_lines(tokens, region)
        .into_iter()
        .map(|line| line.trim_matches(|c: char| LINE_DECORATION.contains(c)).to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

/// One line of an on-screen choice list.
#[derive(Debug, Clone, PartialEq)]
pub struct MenuOption {
    pub text: String,
    /// The line starts with a `>` or `▶` cursor.
    pub marked: bool,
}

/// The lines of `region` as menu options, in screen order.
pub fn menu_options<'a>(tokens: impl IntoIterator<Item = &'a TextToken>, region: &str) -> Vec<MenuOption> {
    joined_lines(tokens, region)
        .into_iter()
        .filter_map(|line| {
            let line = line.trim_start();
            let marked = line.starts_with(['>', '▶']);
            let text = line.trim_matches(|c: char| LINE_DECORATION.contains(c));
            (!text.is_empty()).then(|| MenuOption {
                text: text.to_string(),
                marked,
            })
        })
        .collect()
}

/// A choice list: at least two short lines in the same region.
pub fn looks_like_menu(lines: &[String]) -> bool {
    lines.len() >= 2 && lines.iter().filter(|l| l.chars().count() <= MENU_LINE_MAX_CHARS).count() >= 2
}
