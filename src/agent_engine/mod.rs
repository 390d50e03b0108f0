pub mod classifier;
pub mod controller;
pub mod engine;
pub mod event_bus;
pub mod history;
pub mod loop_control;
pub mod policy;
pub mod state;

pub use controller::{AutoplayController, DesktopPlatform, Platform};
pub use engine::{AutoplayLoop, LoopExit, PlatformHandles, Session};
pub use event_bus::{LoopCommand, StatusSnapshot};
