//! Backend traits consumed by the render worker.
//!
//! Implementations provide the actual graphics API binding (context
//! creation, buffer swap, framebuffer readback) and the scene-graph
//! runtime. Both live exclusively on the render thread once the worker is
//! running; the factory is the only piece shared across threads.

use crate::core::error::DisplayResult;
use crate::core::scene::WindowRef;
use crate::core::types::{GrabImage, SurfaceSize};

/// A graphics context owned exclusively by the render thread.
///
/// `Send` because the worker's state (with the context already torn down,
/// or parked) travels back to the GUI thread between worker runs.
pub trait GraphicsContext: Send {
    /// Bind the context to a window's surface. Returns false when the
    /// surface cannot be made current; callers log and skip the window.
    fn make_current(&mut self, window: &WindowRef) -> bool;

    /// Release the current surface binding.
    fn done_current(&mut self);

    /// Present the bound window's back buffer.
    fn swap_buffers(&mut self, window: &WindowRef);

    /// Read the bound framebuffer back as a tightly packed RGBA8 image.
    fn read_framebuffer(&mut self, size: SurfaceSize) -> GrabImage;
}

/// Creates graphics contexts matching a window's requested surface format.
pub trait ContextFactory: Send + Sync {
    fn create_context(&self, window: &WindowRef) -> DisplayResult<Box<dyn GraphicsContext>>;
}

/// The singular scene-graph runtime.
///
/// Ownership is transferred into the render thread at spawn and recovered
/// through the join handle when the worker exits, so device resources are
/// only ever touched from the thread that owns the context.
pub trait SceneRuntime: Send {
    /// Bind the runtime to a freshly created graphics context.
    fn initialize(&mut self, context: &mut dyn GraphicsContext);

    fn is_ready(&self) -> bool;

    /// Tear down device resources. The runtime may be initialized again
    /// against a new context later.
    fn invalidate(&mut self);

    /// Drop objects whose deletion was deferred to a safe point between
    /// event batches.
    fn flush_deferred_deletions(&mut self);
}
