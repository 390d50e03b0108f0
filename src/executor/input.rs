// Physical input simulation: key codes, compass heading, the enigo backend and
// the scoped guard that keeps key-down/key-up balanced.
use std::fmt;
use std::str::FromStr;

use enigo::{Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};
use serde::{Deserialize, Serialize};

use crate::errors::{AutoplayError, AutoplayResult};

// ── Key codes ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyCode {
    Char(char),
    Enter,
    Space,
    Escape,
    Up,
    Down,
    Left,
    Right,
}

impl fmt::Display for KeyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyCode::Char(c) => write!(f, "{c}"),
            KeyCode::Enter => f.write_str("enter"),
            KeyCode::Space => f.write_str("space"),
            KeyCode::Escape => f.write_str("escape"),
            KeyCode::Up => f.write_str("up"),
            KeyCode::Down => f.write_str("down"),
            KeyCode::Left => f.write_str("left"),
            KeyCode::Right => f.write_str("right"),
        }
    }
}

impl FromStr for KeyCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        let key = match lower.as_str() {
            "enter" | "return" => KeyCode::Enter,
            "space" => KeyCode::Space,
            "esc" | "escape" => KeyCode::Escape,
            "up" => KeyCode::Up,
            "down" => KeyCode::Down,
            "left" => KeyCode::Left,
            "right" => KeyCode::Right,
            other => {
                let mut chars = other.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => KeyCode::Char(c),
                    _ => return Err(format!("unknown key: {s}")),
                }
            }
        };
        Ok(key)
    }
}

impl Serialize for KeyCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for KeyCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── Heading ───────────────────────────────────────────────────────────────────

/// Compass facing relative to the session start. Movement is egocentric
/// (forward is always Up, turns rotate the view), so this is bookkeeping for
/// observers and never changes which key a move presses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Heading {
    #[default]
    Up,
    Right,
    Down,
    Left,
}

impl Heading {
    pub fn rotate_left(self) -> Self {
        match self {
            Heading::Up => Heading::Left,
            Heading::Left => Heading::Down,
            Heading::Down => Heading::Right,
            Heading::Right => Heading::Up,
        }
    }

    pub fn rotate_right(self) -> Self {
        match self {
            Heading::Up => Heading::Right,
            Heading::Right => Heading::Down,
            Heading::Down => Heading::Left,
            Heading::Left => Heading::Up,
        }
    }
}

// ── Backend ───────────────────────────────────────────────────────────────────

/// Primitive synthetic input. Implementations fail with `PermissionDenied`
/// when the OS refuses injection.
pub trait InputBackend {
    fn press(&mut self, key: KeyCode) -> AutoplayResult<()>;
    fn release(&mut self, key: KeyCode) -> AutoplayResult<()>;
    fn click_at(&mut self, x: i32, y: i32) -> AutoplayResult<()>;
}

fn input_err(context: &str, e: impl fmt::Display) -> AutoplayError {
    match AutoplayError::from_platform(context, e) {
        AutoplayError::Capture(msg) => AutoplayError::Dispatch(msg),
        other => other,
    }
}

pub struct EnigoBackend {
    enigo: Enigo,
}

impl EnigoBackend {
    pub fn new() -> AutoplayResult<Self> {
        let enigo = Enigo::new(&Settings::default()).map_err(|e| input_err("open input device", e))?;
        Ok(Self { enigo })
    }

    fn map_key(key: KeyCode) -> Key {
        match key {
            KeyCode::Char(c) => Key::Unicode(c),
            KeyCode::Enter => Key::Return,
            KeyCode::Space => Key::Space,
            KeyCode::Escape => Key::Escape,
            KeyCode::Up => Key::UpArrow,
            KeyCode::Down => Key::DownArrow,
            KeyCode::Left => Key::LeftArrow,
            KeyCode::Right => Key::RightArrow,
        }
    }
}

impl InputBackend for EnigoBackend {
    fn press(&mut self, key: KeyCode) -> AutoplayResult<()> {
        self.enigo
            .key(Self::map_key(key), Direction::Press)
            .map_err(|e| input_err(&format!("press {key}"), e))
    }

    fn release(&mut self, key: KeyCode) -> AutoplayResult<()> {
        self.enigo
            .key(Self::map_key(key), Direction::Release)
            .map_err(|e| input_err(&format!("release {key}"), e))
    }

    fn click_at(&mut self, x: i32, y: i32) -> AutoplayResult<()> {
        self.enigo
            .move_mouse(x, y, Coordinate::Abs)
            .map_err(|e| input_err("move mouse", e))?;
        self.enigo
            .button(Button::Left, Direction::Click)
            .map_err(|e| input_err("click", e))
    }
}

/// Stand-in for dry runs, where no input device is opened at all.
pub struct DisabledInput;

impl InputBackend for DisabledInput {
    fn press(&mut self, key: KeyCode) -> AutoplayResult<()> {
        tracing::trace!(key = %key, "input disabled: press");
        Ok(())
    }

    fn release(&mut self, key: KeyCode) -> AutoplayResult<()> {
        tracing::trace!(key = %key, "input disabled: release");
        Ok(())
    }

    fn click_at(&mut self, x: i32, y: i32) -> AutoplayResult<()> {
        tracing::trace!(x, y, "input disabled: click");
        Ok(())
    }
}

// ── Scoped key holding ────────────────────────────────────────────────────────

/// Borrows the backend for one action. Every key pressed through the guard is
/// released when the guard drops, including on error returns and when the
/// owning future is cancelled mid-hold.
pub struct HeldKeys<'a> {
    backend: &'a mut dyn InputBackend,
    held: Vec<KeyCode>,
}

impl<'a> HeldKeys<'a> {
    pub fn new(backend: &'a mut dyn InputBackend) -> Self {
        Self {
            backend,
            held: Vec::new(),
        }
    }

    pub fn press(&mut self, key: KeyCode) -> AutoplayResult<()> {
        // a failed press may still have gone down on some platforms
        self.held.push(key);
        self.backend.press(key)
    }

    /// The key stays tracked until the backend confirms the release, so a
    /// failed release is retried on drop.
    pub fn release(&mut self, key: KeyCode) -> AutoplayResult<()> {
        self.backend.release(key)?;
        if let Some(pos) = self.held.iter().rposition(|k| *k == key) {
            self.held.remove(pos);
        }
        Ok(())
    }

    pub fn click_at(&mut self, x: i32, y: i32) -> AutoplayResult<()> {
        self.backend.click_at(x, y)
    }

    pub fn held(&self) -> &[KeyCode] {
        &self.held
    }
}

impl Drop for HeldKeys<'_> {
    fn drop(&mut self) {
        while let Some(key) = self.held.pop() {
            if let Err(e) = self.backend.release(key) {
                tracing::error!(key = %key, error = %e, "failed to release held key");
            } else {
                tracing::debug!(key = %key, "released dangling key");
            }
        }
    }
}
