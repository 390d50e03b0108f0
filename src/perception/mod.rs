pub mod calibration;
pub mod edges;
pub mod ocr;
pub mod pipeline;
pub mod screenshot;
pub mod stability;
pub mod template;
pub mod traits;
pub mod types;

pub use pipeline::{PerceptionEngine, PerceptionPass};
pub use traits::{FrameSource, TextRecognizer, WindowHandle};
