//! Render worker: the dedicated thread owning the graphics context and the
//! scene-graph runtime.
//!
//! The worker is never blocked by the GUI. Every synchronous hand-off is
//! initiated by the GUI and completed from one of the worker's event
//! handlers, so execution stays deterministic: one blocking point, picked
//! up at well-defined times. While the GUI is blocked elsewhere the worker
//! keeps posting animation advances so the animation clock never stalls.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use bitflags::bitflags;
use crossbeam_channel::TryRecvError;

use crate::backend::{ContextFactory, GraphicsContext, SceneRuntime};
use crate::core::scene::WindowRef;
use crate::core::types::{SurfaceSize, WindowId};
use crate::thread_comm::{GuiEvent, RenderComms, RenderEvent, Rendezvous};

/// Ceiling on in-flight AdvanceAnimations events. Backpressure against
/// animation storms when the GUI is slow to drain its queue.
const MAX_ANIMATION_REQUESTS: u32 = 2;

bitflags! {
    /// Work the worker's main loop owes. Set by event handlers; each bit is
    /// cleared when the corresponding pass runs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct UpdateRequests: u8 {
        const SYNC_REQUEST = 0x01;
        const REPAINT_REQUEST = 0x02;
    }
}

/// Flags shared between the coordinator and the worker.
///
/// Read without the rendezvous mutex; they gate fast paths only. All
/// writes publish with sequentially consistent ordering.
pub(crate) struct RenderFlags {
    /// The worker is parked waiting for posted events.
    pub sleeping: AtomicBool,

    /// The render-driven animation clock is ticking.
    pub animation_running: AtomicBool,

    /// Terminate request; the main loop drains after its iteration.
    pub should_exit: AtomicBool,

    /// Set before spawn, cleared as `run()` returns.
    pub worker_running: AtomicBool,

    /// Gate read by embedders that process deferred GUI work while the
    /// GUI thread is blocked in a rendezvous.
    pub allow_main_thread_processing: AtomicBool,

    /// In-flight AdvanceAnimations events (≤ MAX_ANIMATION_REQUESTS).
    pub animation_requests_pending: AtomicU32,

    /// Identity of the live render thread, for update-path routing.
    pub render_thread: Mutex<Option<ThreadId>>,
}

impl RenderFlags {
    pub fn new() -> Self {
        Self {
            sleeping: AtomicBool::new(false),
            animation_running: AtomicBool::new(false),
            should_exit: AtomicBool::new(false),
            worker_running: AtomicBool::new(false),
            allow_main_thread_processing: AtomicBool::new(true),
            animation_requests_pending: AtomicU32::new(0),
            render_thread: Mutex::new(None),
        }
    }

    pub fn on_render_thread(&self) -> bool {
        *self.render_thread.lock().unwrap() == Some(thread::current().id())
    }
}

/// Per-window record on the render side. Exists only while the window is
/// exposed; the coordinator's list is always a superset.
struct RenderWindow {
    window: WindowRef,
    size: SurfaceSize,
}

/// State of the render thread.
///
/// Constructed on the GUI thread, moved into the worker thread at spawn,
/// and recovered through the join handle when the worker exits so a later
/// expose can restart it with the scene-graph runtime intact.
pub(crate) struct RenderWorker {
    runtime: Box<dyn SceneRuntime>,
    factory: Arc<dyn ContextFactory>,
    context: Option<Box<dyn GraphicsContext>>,
    windows: Vec<RenderWindow>,
    pending: UpdateRequests,
    comms: RenderComms,
    flags: Arc<RenderFlags>,
    rendezvous: Arc<Rendezvous>,
    window_timing: bool,
    context_failed: bool,
}

impl RenderWorker {
    pub fn new(
        runtime: Box<dyn SceneRuntime>,
        factory: Arc<dyn ContextFactory>,
        comms: RenderComms,
        flags: Arc<RenderFlags>,
        rendezvous: Arc<Rendezvous>,
        window_timing: bool,
    ) -> Self {
        Self {
            runtime,
            factory,
            context: None,
            windows: Vec::new(),
            pending: UpdateRequests::empty(),
            comms,
            flags,
            rendezvous,
            window_timing,
            context_failed: false,
        }
    }

    /// Start the render thread. The worker owns itself until it exits.
    pub fn spawn(self) -> JoinHandle<RenderWorker> {
        self.flags.worker_running.store(true, Ordering::SeqCst);
        thread::Builder::new()
            .name("vitrail-render".into())
            .spawn(move || self.run())
            .expect("failed to spawn render thread")
    }

    fn window_index(&self, id: WindowId) -> Option<usize> {
        self.windows.iter().position(|w| w.window.id() == id)
    }

    fn run(mut self) -> Self {
        log::trace!("render: run()");
        *self.flags.render_thread.lock().unwrap() = Some(thread::current().id());

        while !self.flags.should_exit.load(Ordering::SeqCst) {
            // Drain everything queued before deciding what this iteration
            // does, so a resize and the sync right behind it land in the
            // same frame. Events posted before the thread started are
            // picked up here on the first iteration.
            self.drain_events();
            self.runtime.flush_deferred_deletions();

            if self.flags.should_exit.load(Ordering::SeqCst) {
                break;
            }

            if !self.windows.is_empty() {
                self.ensure_context();
                if let Some(context) = self.context.as_mut() {
                    if !self.runtime.is_ready() {
                        self.runtime.initialize(context.as_mut());
                    }
                }
                self.sync_and_render();
            }

            if !self.flags.should_exit.load(Ordering::SeqCst)
                && ((!self.flags.animation_running.load(Ordering::SeqCst)
                    && self.pending.is_empty())
                    || self.windows.is_empty())
            {
                self.park();
            }
        }

        self.teardown_on_exit();
        *self.flags.render_thread.lock().unwrap() = None;
        self.flags.worker_running.store(false, Ordering::SeqCst);
        log::trace!("render: run() completed");
        self
    }

    fn drain_events(&mut self) {
        loop {
            match self.comms.render_rx.try_recv() {
                Ok(event) => {
                    self.handle_event(event);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.flags.should_exit.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }
    }

    /// Park until an event that warrants another loop iteration arrives.
    ///
    /// Handlers keep running while parked; only events that create or
    /// change renderable work end the park (a sync or repaint request, an
    /// animation start, an obscure that leaves windows behind, a release
    /// that tore resources down). A grab or resize is handled in place and
    /// leaves the worker asleep.
    fn park(&mut self) {
        log::trace!("render: going to sleep");
        self.flags.sleeping.store(true, Ordering::SeqCst);
        while self.flags.sleeping.load(Ordering::SeqCst) {
            match self.comms.render_rx.recv() {
                Ok(event) => {
                    let wake = self.handle_event(event);
                    if wake || self.flags.should_exit.load(Ordering::SeqCst) {
                        self.flags.sleeping.store(false, Ordering::SeqCst);
                    }
                }
                Err(_) => {
                    // Coordinator gone; treat as terminate
                    self.flags.should_exit.store(true, Ordering::SeqCst);
                    self.flags.sleeping.store(false, Ordering::SeqCst);
                }
            }
        }
    }

    /// The context must not outlive the loop. The orderly exit path tears
    /// it down in the TryRelease handler; this catches teardown-by-channel
    /// disconnect, where windows may still be tracked.
    fn teardown_on_exit(&mut self) {
        if self.context.is_none() {
            return;
        }
        log::warn!("render: exiting with a live graphics context, tearing it down");
        if self.runtime.is_ready() {
            self.runtime.invalidate();
        }
        self.runtime.flush_deferred_deletions();
        self.context = None;
    }

    /// Dispatch one posted event. Returns whether a park should end: true
    /// for events that create renderable work, false for ones handled
    /// entirely in place.
    fn handle_event(&mut self, event: RenderEvent) -> bool {
        match event {
            RenderEvent::Expose { window, size } => {
                log::trace!("render: expose {} at {}", window.id(), size);
                // The GUI may be blocked in a rendezvous; list edits take
                // the rendezvous lock.
                let rdv = self.rendezvous.clone();
                let _guard = rdv.lock();
                if self.window_index(window.id()).is_some() {
                    log::trace!("render:  - window already tracked");
                    return false;
                }
                self.windows.push(RenderWindow { window, size });
                self.context_failed = false;
                // The sync request right behind this event does the waking
                false
            }

            RenderEvent::Obscure { id } => {
                log::trace!("render: obscure {id}");
                let rdv = self.rendezvous.clone();
                let _guard = rdv.lock();
                if let Some(i) = self.window_index(id) {
                    self.windows.remove(i);
                }
                // Remaining windows need a fresh pass; with none left the
                // park continues
                !self.windows.is_empty()
            }

            RenderEvent::RequestSync => {
                log::trace!("render: request_sync");
                if !self.windows.is_empty() {
                    self.pending |= UpdateRequests::SYNC_REQUEST;
                } else {
                    // Nothing to sync against, but the GUI is parked in the
                    // rendezvous; complete it so it never deadlocks.
                    let rdv = self.rendezvous.clone();
                    let mut state = rdv.lock();
                    if rdv.gui_is_locked() {
                        rdv.complete(&mut state);
                    }
                }
                true
            }

            RenderEvent::RequestRepaint => {
                if !self.windows.is_empty() {
                    self.pending |= UpdateRequests::REPAINT_REQUEST;
                }
                true
            }

            RenderEvent::Resize { id, size } => {
                log::trace!("render: resize {id} to {size}");
                // No wake; a sync arrives right behind this event. The
                // window may already have been obscured: tolerate.
                if let Some(i) = self.window_index(id) {
                    self.windows[i].size = size;
                }
                false
            }

            RenderEvent::TryRelease {
                window,
                in_destructor,
                remaining,
            } => self.handle_try_release(window, in_destructor, remaining),

            RenderEvent::Grab { window } => {
                self.handle_grab(window);
                false
            }

            // Wake carrier; the flag itself travels as an atomic
            RenderEvent::AnimationsStarted => {
                log::trace!("render: animations started");
                true
            }
            RenderEvent::AnimationsStopped => {
                log::trace!("render: animations stopped");
                false
            }
        }
    }

    /// Release the runtime and context if no window needs them anymore.
    /// Completes the rendezvous unconditionally, even when nothing could be
    /// torn down. Returns whether anything was released (which ends a
    /// park so the main loop can re-evaluate its exit condition).
    fn handle_try_release(
        &mut self,
        window: WindowRef,
        in_destructor: bool,
        remaining: Vec<WindowRef>,
    ) -> bool {
        log::trace!("render: try_release (in_destructor={in_destructor})");
        let rdv = self.rendezvous.clone();
        let mut state = rdv.lock();

        let released = self.windows.is_empty();
        if released {
            self.invalidate_graphics(&window, in_destructor, &remaining);
            self.flags
                .should_exit
                .store(self.context.is_none(), Ordering::SeqCst);
        } else {
            log::trace!("render:  - not releasing, active windows remain");
        }

        rdv.complete(&mut state);
        released
    }

    /// Tear down the scene-graph runtime and graphics context, honoring
    /// per-window persistence. Persistence is OR'd across the remaining
    /// windows: the runtime is singular, so one persistent consumer keeps
    /// it alive. A window in its destructor no longer counts.
    fn invalidate_graphics(
        &mut self,
        window: &WindowRef,
        in_destructor: bool,
        remaining: &[WindowRef],
    ) {
        log::trace!("render: invalidate_graphics()");
        if self.context.is_none() {
            return;
        }

        let mut persistent_sg = false;
        let mut persistent_context = false;
        for w in remaining {
            if in_destructor && w.id() == window.id() {
                continue;
            }
            persistent_sg |= w.is_persistent_scene_graph();
            persistent_context |= w.is_persistent_graphics_context();
        }

        if let Some(context) = self.context.as_mut() {
            context.make_current(window);
        }

        // The window's nodes must go regardless when the window is dying
        if !persistent_sg || in_destructor {
            window.cleanup_nodes_on_shutdown();
        }

        if persistent_sg {
            log::trace!("render:  - persistent scene graph, skipping teardown");
            return;
        }

        self.runtime.invalidate();
        self.runtime.flush_deferred_deletions();
        if let Some(context) = self.context.as_mut() {
            context.done_current();
        }
        log::trace!("render:  - invalidated scene graph");

        if !persistent_context {
            self.context = None;
            log::trace!("render:  - destroyed graphics context");
        } else {
            log::trace!("render:  - persistent graphics context, keeping it");
        }
    }

    /// Synchronous capture. Runs a full sync+render cycle because the
    /// scene may have changed since the last frame (deletions included),
    /// then reads the framebuffer back into the rendezvous result slot.
    fn handle_grab(&mut self, window: WindowRef) {
        log::trace!("render: grab {}", window.id());
        let size = self.window_index(window.id()).map(|i| self.windows[i].size);

        let rdv = self.rendezvous.clone();
        let mut state = rdv.lock();

        if let Some(size) = size {
            // A grab can arrive before the first frame; bring the context
            // and runtime up first.
            self.ensure_context();
            if let Some(context) = self.context.as_mut() {
                if !self.runtime.is_ready() {
                    self.runtime.initialize(context.as_mut());
                }
                context.make_current(&window);
                window.sync_scene_graph();
                window.render_scene_graph(size);
                state.grab_result = Some(context.read_framebuffer(size));
            }
        }

        log::trace!("render:  - waking gui with grab result");
        rdv.complete(&mut state);
    }

    /// Create the graphics context if it is missing. Failure is logged and
    /// tolerated (headless/CI); the worker retries on a later pass and the
    /// affected windows simply do not render until it succeeds.
    fn ensure_context(&mut self) {
        if self.context.is_some() || self.windows.is_empty() {
            return;
        }

        // Prefer a window with a real surface size; an expose can arrive
        // while the size is still degenerate.
        let target = self
            .windows
            .iter()
            .find(|w| !w.size.is_degenerate())
            .unwrap_or(&self.windows[0])
            .window
            .clone();

        match self.factory.create_context(&target) {
            Ok(context) => {
                self.context = Some(context);
                self.context_failed = false;
            }
            Err(err) => {
                if !self.context_failed {
                    log::warn!("render: failed to create graphics context: {err}");
                    self.context_failed = true;
                }
            }
        }
    }

    fn sync_and_render(&mut self) {
        let timing = self.window_timing;
        let frame_start = Instant::now();
        log::trace!("render: sync_and_render()");

        // Keep the GUI-side animation clock ticking even while the GUI is
        // blocked; the advance request lands after the sync completes.
        if self.flags.animation_running.load(Ordering::SeqCst)
            && self.flags.animation_requests_pending.load(Ordering::SeqCst)
                < MAX_ANIMATION_REQUESTS
        {
            self.flags
                .animation_requests_pending
                .fetch_add(1, Ordering::SeqCst);
            self.comms.post_gui(GuiEvent::AdvanceAnimations);
        }

        if self.pending.contains(UpdateRequests::SYNC_REQUEST) {
            self.sync();
        }
        let sync_done = Instant::now();

        // The pass below satisfies any repaint request
        self.pending.remove(UpdateRequests::REPAINT_REQUEST);

        if self.context.is_none() {
            return;
        }

        let mut rendered = 0usize;
        for i in 0..self.windows.len() {
            let window = self.windows[i].window.clone();
            let size = self.windows[i].size;
            if size.is_degenerate() || !window.has_renderer() {
                log::trace!("render:  - {} not ready, skipping render", window.id());
                continue;
            }
            let Some(context) = self.context.as_mut() else {
                break;
            };
            if !context.make_current(&window) {
                log::warn!("render: make_current failed for {}", window.id());
                continue;
            }
            window.render_scene_graph(size);
            context.swap_buffers(&window);
            window.fire_frame_swapped();
            rendered += 1;
        }

        if timing {
            log::debug!(
                "render: frame timing - sync={}us render+swap={}us windows={}",
                sync_done.duration_since(frame_start).as_micros(),
                sync_done.elapsed().as_micros(),
                rendered,
            );
        }
    }

    /// Enters the rendezvous lock to make sure the GUI is blocking,
    /// reconciles every renderable window, then wakes the GUI. After this
    /// returns the GUI resumes in parallel with the render pass.
    fn sync(&mut self) {
        log::trace!("render: sync()");
        let rdv = self.rendezvous.clone();
        let mut state = rdv.lock();

        debug_assert!(
            rdv.gui_is_locked(),
            "sync() entered while the GUI is not waiting"
        );

        self.pending = UpdateRequests::empty();

        for i in 0..self.windows.len() {
            let window = self.windows[i].window.clone();
            let size = self.windows[i].size;
            if size.is_degenerate() {
                log::trace!("render:  - {} has degenerate size, skipping sync", window.id());
                continue;
            }
            let Some(context) = self.context.as_mut() else {
                break;
            };
            if !context.make_current(&window) {
                log::warn!("render: make_current failed for {} during sync", window.id());
                continue;
            }
            window.sync_scene_graph();
        }

        log::trace!("render:  - waking gui after sync");
        rdv.complete(&mut state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_request_bits() {
        let mut pending = UpdateRequests::empty();
        assert!(pending.is_empty());

        pending |= UpdateRequests::SYNC_REQUEST;
        pending |= UpdateRequests::REPAINT_REQUEST;
        assert!(pending.contains(UpdateRequests::SYNC_REQUEST));

        pending.remove(UpdateRequests::REPAINT_REQUEST);
        assert!(pending.contains(UpdateRequests::SYNC_REQUEST));
        assert!(!pending.contains(UpdateRequests::REPAINT_REQUEST));
    }

    #[test]
    fn test_flags_default_state() {
        let flags = RenderFlags::new();
        assert!(!flags.sleeping.load(Ordering::SeqCst));
        assert!(!flags.animation_running.load(Ordering::SeqCst));
        assert!(!flags.should_exit.load(Ordering::SeqCst));
        assert!(!flags.worker_running.load(Ordering::SeqCst));
        assert!(flags.allow_main_thread_processing.load(Ordering::SeqCst));
        assert_eq!(flags.animation_requests_pending.load(Ordering::SeqCst), 0);
        assert!(!flags.on_render_thread());
    }
}
