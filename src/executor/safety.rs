// Focus gate: input is only ever sent to the window the session targets.
use crate::errors::AutoplayResult;
use crate::perception::screenshot::find_window;
use crate::perception::traits::WindowHandle;

pub trait FocusProbe {
    /// Whether `target` currently holds input focus.
    fn is_focused(&mut self, target: &WindowHandle) -> AutoplayResult<bool>;
}

/// Asks the window system through `xcap`.
#[derive(Default)]
pub struct XcapFocusProbe;

impl FocusProbe for XcapFocusProbe {
    fn is_focused(&mut self, target: &WindowHandle) -> AutoplayResult<bool> {
        match target {
            // whole-screen sessions have no window to lose focus
            WindowHandle::PrimaryMonitor => Ok(true),
            handle => {
                let window = find_window(handle)?;
                let focused = window
                    .is_focused()
                    .map_err(|e| crate::errors::AutoplayError::from_platform("query focus", e))?;
                tracing::trace!(window = %handle, focused, "focus probe");
                Ok(focused)
            }
        }
    }
}

/// For dry runs on headless machines.
pub struct AlwaysFocused;

impl FocusProbe for AlwaysFocused {
    fn is_focused(&mut self, _target: &WindowHandle) -> AutoplayResult<bool> {
        Ok(true)
    }
}
