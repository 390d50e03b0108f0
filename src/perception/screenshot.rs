/// Window capture through `xcap`.
use xcap::{Monitor, Window};

use crate::errors::{AutoplayError, AutoplayResult};
use crate::perception::traits::{FrameSource, WindowHandle};
use crate::perception::types::{Frame, WindowGeometry};

/// Windows at or below this size are toolbars, tooltips and tray icons.
const MIN_WINDOW_SIDE: u32 = 200;

fn platform_err(context: &str, e: impl std::fmt::Display) -> AutoplayError {
    AutoplayError::from_platform(context, e)
}

/// Locate the window `handle` names. Keyword matches prefer the largest
/// visible candidate and never pick this process's own windows.
pub fn find_window(handle: &WindowHandle) -> AutoplayResult<Window> {
    let windows = Window::all().map_err(|e| platform_err("enumerate windows", e))?;
    let own_pid = std::process::id();

    let found = match handle {
        WindowHandle::Id(id) => windows.into_iter().find(|w| w.id().ok() == Some(*id)),
        WindowHandle::Keyword(keyword) => {
            let needle = keyword.to_lowercase();
            windows
                .into_iter()
                .filter(|w| w.pid().ok() != Some(own_pid))
                .filter(|w| !w.is_minimized().unwrap_or(false))
                .filter(|w| {
                    let title = w.title().unwrap_or_default().to_lowercase();
                    let app = w.app_name().unwrap_or_default().to_lowercase();
                    title.contains(&needle) || app.contains(&needle)
                })
                .filter(|w| {
                    let (ww, wh) = (w.width().unwrap_or(0), w.height().unwrap_or(0));
                    ww > MIN_WINDOW_SIDE && wh > MIN_WINDOW_SIDE
                })
                .max_by_key(|w| w.width().unwrap_or(0) as u64 * w.height().unwrap_or(0) as u64)
        }
        WindowHandle::PrimaryMonitor => {
            return Err(AutoplayError::Config("primary monitor is not a window".into()));
        }
    };
    found.ok_or_else(|| AutoplayError::WindowNotFound(handle.to_string()))
}

fn primary_monitor() -> AutoplayResult<Monitor> {
    let monitors = Monitor::all().map_err(|e| platform_err("enumerate monitors", e))?;
    monitors
        .into_iter()
        .find(|m| m.is_primary().unwrap_or(false))
        .ok_or_else(|| AutoplayError::WindowNotFound("primary monitor".into()))
}

/// Captures the target window's client area each tick.
#[derive(Default)]
pub struct XcapFrameSource;

impl XcapFrameSource {
    pub fn new() -> Self {
        Self
    }
}

impl FrameSource for XcapFrameSource {
    fn capture(&mut self, window: &WindowHandle) -> AutoplayResult<Frame> {
        let (image, geometry) = match window {
            WindowHandle::PrimaryMonitor => {
                let monitor = primary_monitor()?;
                let image = monitor.capture_image().map_err(|e| platform_err("capture monitor", e))?;
                let geometry = WindowGeometry {
                    x: monitor.x().unwrap_or(0),
                    y: monitor.y().unwrap_or(0),
                    width: image.width(),
                    height: image.height(),
                };
                (image, geometry)
            }
            handle => {
                let target = find_window(handle)?;
                if target.is_minimized().unwrap_or(false) {
                    return Err(AutoplayError::Capture(format!("{handle} is minimized")));
                }
                let image = target.capture_image().map_err(|e| platform_err("capture window", e))?;
                let geometry = WindowGeometry {
                    x: target.x().unwrap_or(0),
                    y: target.y().unwrap_or(0),
                    width: image.width(),
                    height: image.height(),
                };
                (image, geometry)
            }
        };
        tracing::trace!(width = geometry.width, height = geometry.height, "frame captured");
        Ok(Frame::new(image, geometry))
    }
}
