//! Error types for the display loop.

use thiserror::Error;

pub type DisplayResult<T> = Result<T, DisplayError>;

/// Errors surfaced by the render loop and the backend seams it consumes.
///
/// Nothing here crosses a thread boundary; failures on the render thread
/// are logged and tolerated (the affected window simply does not render
/// until the operation succeeds on a later pass).
#[derive(Debug, Error)]
pub enum DisplayError {
    /// The context factory could not produce a graphics context for the
    /// target surface. Common in headless/CI environments.
    #[error("failed to create graphics context: {0}")]
    ContextCreation(String),

    /// The native surface behind a window could not be realized.
    #[error("failed to realize window surface: {0}")]
    SurfaceRealize(String),

    /// The wakeup pipe between the render thread and the host's dispatch
    /// loop could not be set up.
    #[error("wakeup pipe: {0}")]
    WakeupPipe(#[from] std::io::Error),
}
