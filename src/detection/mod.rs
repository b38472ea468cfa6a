/// Regex-driven error classification with per-component history
pub mod error_detector;

pub use error_detector::{ErrorDetector, ErrorHandler, ErrorRecord};
