pub mod dispatcher;
pub mod input;
pub mod safety;

pub use dispatcher::ActionDispatcher;
pub use input::{DisabledInput, EnigoBackend, Heading, InputBackend, KeyCode};
pub use safety::{AlwaysFocused, FocusProbe, XcapFocusProbe};
