//! The seam between the render loop and the toolkit's scene graph.
//!
//! The loop never walks the scene tree itself. Each window exposes the
//! hooks the two threads need: polish on the GUI thread, sync/render on
//! the render thread, and the persistence queries that decide whether the
//! scene-graph runtime and graphics context survive visibility cycles.

use std::sync::Arc;

use crate::core::error::DisplayResult;
use crate::core::types::{SurfaceSize, WindowId};

/// Shared handle to a toolkit window.
///
/// Cheap to clone and safe to inspect from either thread. The mutating
/// hooks have a fixed thread affinity, documented per method; the loop
/// upholds it.
pub type WindowRef = Arc<dyn SceneWindow>;

pub trait SceneWindow: Send + Sync {
    fn id(&self) -> WindowId;

    /// Current surface size in physical pixels.
    fn surface_size(&self) -> SurfaceSize;

    fn is_visible(&self) -> bool;

    /// Whether the platform currently exposes the window's surface.
    fn is_exposed(&self) -> bool;

    /// Ensure the native surface exists so a graphics context can bind to
    /// it. Idempotent.
    fn realize(&self) -> DisplayResult<()>;

    /// GUI-thread finalization of declarative items (layout, pending
    /// geometry) before their state is handed to the render thread.
    fn polish_items(&self);

    /// Reconcile the polished declarative state into renderable nodes.
    /// Called on the render thread with the graphics context bound and the
    /// GUI thread blocked in the sync rendezvous.
    fn sync_scene_graph(&self);

    /// Traverse and draw. Called on the render thread with the context
    /// bound; runs concurrently with GUI mutations, against the snapshot
    /// the last sync produced.
    fn render_scene_graph(&self, size: SurfaceSize);

    /// Whether sync has produced a renderer for this window yet. Windows
    /// without one are skipped by the render pass.
    fn has_renderer(&self) -> bool;

    /// Drop the window's scene nodes and their device resources. Render
    /// thread, context bound.
    fn cleanup_nodes_on_shutdown(&self);

    /// Notification fired after the window's frame was presented.
    fn fire_frame_swapped(&self);

    /// Keep the scene-graph runtime alive while this window is hidden.
    fn is_persistent_scene_graph(&self) -> bool;

    /// Keep the graphics context alive while this window is hidden.
    fn is_persistent_graphics_context(&self) -> bool;
}
