pub mod canonical;
pub mod controller;
pub mod frontier;
pub mod task;

// Re-export common types
pub use controller::{RunRequest, SiteDiff, SiteDiffError};
pub use frontier::CrawlState;
pub use task::{CaptureOutcome, CaptureRequest, DiffOutcome, DiffRequest, TaskError};
