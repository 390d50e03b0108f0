use std::fmt;

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::errors::AutoplayResult;
use crate::perception::types::Frame;

/// Which window the session drives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WindowHandle {
    Id(u32),
    /// Case-insensitive substring of the window title or owning app name.
    Keyword(String),
    PrimaryMonitor,
}

impl fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowHandle::Id(id) => write!(f, "window #{id}"),
            WindowHandle::Keyword(k) => write!(f, "window matching '{k}'"),
            WindowHandle::PrimaryMonitor => f.write_str("primary monitor"),
        }
    }
}

/// Produces frames of the target window's client area on demand.
///
/// Capture is a bounded-latency blocking call made from the control thread.
/// `WindowNotFound` and `PermissionDenied` propagate to the loop unretried.
pub trait FrameSource {
    fn capture(&mut self, window: &WindowHandle) -> AutoplayResult<Frame>;
}

/// One word reported by an OCR engine, in pixels of the image it was given.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedWord {
    pub text: String,
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
    /// Engine confidence scaled to [0, 1].
    pub confidence: f32,
    /// Engine-specific line identity; words sharing it are on one line.
    pub line_key: (u32, u32, u32),
}

/// Strategy trait for text recognition over a preprocessed grayscale crop.
pub trait TextRecognizer: Send + Sync {
    fn recognize(&self, image: &GrayImage) -> AutoplayResult<Vec<RecognizedWord>>;
}
