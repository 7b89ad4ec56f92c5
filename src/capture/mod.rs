pub mod artifact;
pub mod diff;
pub mod fetch;
pub mod handlers;
pub mod render;
pub mod tool;

#[cfg(test)]
pub mod testing;

// Re-export common types
pub use artifact::{artifact_name, ArtifactPaths};
pub use diff::{DiffVerdict, ImageDiffer, SubprocessDiffer};
pub use handlers::{build_registry, CaptureHandler, DiffHandler};
pub use render::{Renderer, SubprocessRenderer};
