//! GUI-side loop coordinator.
//!
//! Tracks shown windows, runs the polish pass, owns the coalescing update
//! timer and the off-screen animation timer, and initiates the one
//! blocking rendezvous with the render worker. All methods are GUI-thread
//! affine except through [`UpdateHandle`], which the scene runtime may use
//! from the render thread during sync.

use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use crate::backend::{ContextFactory, SceneRuntime};
use crate::core::animation::AnimationDriver;
use crate::core::error::DisplayResult;
use crate::core::scene::WindowRef;
use crate::core::types::{GrabImage, SurfaceSize, WindowId};
use crate::render_thread::{RenderFlags, RenderWorker};
use crate::thread_comm::{
    GuiComms, GuiEvent, RenderEvent, Rendezvous, ThreadComms, WakeupHandle,
};
use crate::timer::{TimerKind, TimerService};

/// Tunables injected at construction. The refresh rate and context factory
/// are process-wide inputs; they are passed in rather than read from
/// globals.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Primary screen refresh rate in Hz; drives the off-screen animation
    /// tick interval.
    pub refresh_rate: f64,

    /// Coalescing interval applied between an update request and the
    /// ensuing polish-and-sync while animations run.
    pub exhaust_delay: Duration,

    /// Emit per-frame timing logs.
    pub window_timing: bool,
}

impl LoopConfig {
    /// Build from the environment: `VITRAIL_EXHAUST_DELAY` (integer ms,
    /// default 5) and `VITRAIL_WINDOW_TIMING` (presence enables timing
    /// logs).
    pub fn from_env(refresh_rate: f64) -> Self {
        Self {
            refresh_rate,
            exhaust_delay: Duration::from_millis(crate::env_u64("VITRAIL_EXHAUST_DELAY", 5)),
            window_timing: std::env::var_os("VITRAIL_WINDOW_TIMING").is_some(),
        }
    }

    /// Off-screen animation tick interval. Some platforms report 0 or
    /// something bogus for the refresh rate; fall back to 16 ms.
    pub fn animation_interval(&self) -> Duration {
        if self.refresh_rate < 1.0 {
            Duration::from_millis(16)
        } else {
            Duration::from_millis((1000.0 / self.refresh_rate) as u64)
        }
    }
}

/// Per-window record on the GUI side. One per shown window; a superset of
/// the render side's exposed-window list.
struct GuiWindow {
    window: WindowRef,
    pending_update: bool,
}

enum WorkerSlot {
    /// Worker state parked on the GUI side between runs.
    Idle(RenderWorker),
    /// Worker thread live (or exited and awaiting reap).
    Running(JoinHandle<RenderWorker>),
}

/// The threaded render loop's GUI-side coordinator.
pub struct ThreadedRenderLoop {
    windows: Vec<GuiWindow>,
    driver: AnimationDriver,
    config: LoopConfig,
    flags: Arc<RenderFlags>,
    rendezvous: Arc<Rendezvous>,
    comms: GuiComms,
    timers: TimerService,
    update_timer_armed: bool,
    animation_timer_armed: bool,
    worker: Option<WorkerSlot>,
    gui_thread: ThreadId,
}

impl ThreadedRenderLoop {
    /// Create the loop. The scene-graph runtime is handed over here and
    /// moves into the render thread on first expose; the factory is shared
    /// with the worker for lazy context creation.
    pub fn new(
        runtime: Box<dyn SceneRuntime>,
        factory: Arc<dyn ContextFactory>,
        config: LoopConfig,
    ) -> DisplayResult<Self> {
        let (gui_comms, render_comms) = ThreadComms::new()?.split();
        let flags = Arc::new(RenderFlags::new());
        let rendezvous = Arc::new(Rendezvous::new());
        let timers = TimerService::spawn(gui_comms.gui_tx.clone(), gui_comms.wakeup.handle());
        let worker = RenderWorker::new(
            runtime,
            factory,
            render_comms,
            flags.clone(),
            rendezvous.clone(),
            config.window_timing,
        );

        log::trace!("gui: threaded render loop created");
        Ok(Self {
            windows: Vec::new(),
            driver: AnimationDriver::new(),
            config,
            flags,
            rendezvous,
            comms: gui_comms,
            timers,
            update_timer_armed: false,
            animation_timer_armed: false,
            worker: Some(WorkerSlot::Idle(worker)),
            gui_thread: thread::current().id(),
        })
    }

    // ===================================================================
    // Host-facing state
    // ===================================================================

    /// The fd the host's dispatch loop should `select()` on; readable when
    /// [`process_events`](Self::process_events) has work.
    pub fn wakeup_fd(&self) -> RawFd {
        self.comms.wakeup.read_fd()
    }

    /// Handle for requesting updates from the render thread during sync,
    /// or from GUI code that only holds a cheap handle.
    pub fn update_handle(&self) -> UpdateHandle {
        UpdateHandle {
            render_tx: self.comms.render_tx.clone(),
            gui_tx: self.comms.gui_tx.clone(),
            wakeup: self.comms.wakeup.handle(),
            flags: self.flags.clone(),
            rendezvous: self.rendezvous.clone(),
            gui_thread: self.gui_thread,
        }
    }

    pub fn animation_driver(&self) -> &AnimationDriver {
        &self.driver
    }

    /// Whether embedders may keep processing deferred GUI work while the
    /// GUI thread is blocked in a rendezvous.
    pub fn allow_main_thread_processing(&self) -> bool {
        self.flags.allow_main_thread_processing.load(Ordering::SeqCst)
    }

    fn window_index(&self, id: WindowId) -> Option<usize> {
        self.windows.iter().position(|w| w.window.id() == id)
    }

    fn anyone_showing(&self) -> bool {
        self.windows
            .iter()
            .any(|w| w.window.is_visible() && w.window.is_exposed())
    }

    fn worker_active(&self) -> bool {
        self.flags.worker_running.load(Ordering::SeqCst)
            && !self.flags.should_exit.load(Ordering::SeqCst)
    }

    // ===================================================================
    // Window lifecycle
    // ===================================================================

    /// Track a shown window. No rendering side effect; that happens on
    /// expose.
    pub fn show(&mut self, window: WindowRef) {
        log::trace!("gui: show {}", window.id());
        if self.window_index(window.id()).is_some() {
            // At most one record per handle
            return;
        }
        self.windows.push(GuiWindow {
            window,
            pending_update: false,
        });
    }

    /// Stop tracking a window. Triggers obscurity handling and a resource
    /// release before the record goes away.
    pub fn hide(&mut self, window: &WindowRef) {
        log::trace!("gui: hide {}", window.id());

        if window.is_exposed() {
            self.handle_obscurity(window);
        }

        self.release_resources(window, false);

        if let Some(i) = self.window_index(window.id()) {
            self.windows.remove(i);
        }
    }

    /// Full teardown for a dying window: hide it if needed, then release
    /// with the destructor flag so its persistence no longer counts.
    pub fn window_destroyed(&mut self, window: &WindowRef) {
        log::trace!("gui: window_destroyed {}", window.id());

        if window.is_visible() {
            self.hide(window);
        }
        self.release_resources(window, true);

        log::trace!("gui:  - done with window_destroyed");
    }

    /// Platform notification that a window's surface became exposed or
    /// obscured. Untracked windows are ignored.
    pub fn exposure_changed(&mut self, window: &WindowRef) {
        log::trace!("gui: exposure_changed {}", window.id());
        if self.window_index(window.id()).is_none() {
            return;
        }

        if window.is_exposed() {
            self.handle_exposure(window);
        } else {
            self.handle_obscurity(window);
        }
    }

    fn handle_exposure(&mut self, window: &WindowRef) {
        log::trace!("gui: handle_exposure {}", window.id());

        // A graphics context will be bound to the surface; make sure it
        // exists first.
        if let Err(err) = window.realize() {
            log::warn!("gui: could not realize surface for {}: {err}", window.id());
        }

        let _ = self.comms.render_tx.send(RenderEvent::Expose {
            window: window.clone(),
            size: window.surface_size(),
        });

        self.ensure_worker_running();
        self.polish_and_sync();

        // A window is on screen again: the vsync cadence takes over from
        // the off-screen animation tick.
        if self.animation_timer_armed {
            self.timers.cancel(TimerKind::Animation);
            self.animation_timer_armed = false;
        }
    }

    fn handle_obscurity(&mut self, window: &WindowRef) {
        log::trace!("gui: handle_obscurity {}", window.id());
        if self.worker_active() {
            let _ = self
                .comms
                .render_tx
                .send(RenderEvent::Obscure { id: window.id() });
        }

        if !self.anyone_showing() && self.driver.is_running() && !self.animation_timer_armed {
            self.timers
                .arm(TimerKind::Animation, self.config.animation_interval());
            self.animation_timer_armed = true;
        }
    }

    fn ensure_worker_running(&mut self) {
        // Reap a worker that exited — or is about to, with the exit flag
        // already set by a release — so its state (scene-graph runtime
        // included) can be reused. The join is bounded: an exiting worker
        // never parks again.
        let needs_reap = match &self.worker {
            Some(WorkerSlot::Running(handle)) => {
                handle.is_finished() || self.flags.should_exit.load(Ordering::SeqCst)
            }
            _ => false,
        };
        if needs_reap {
            if let Some(WorkerSlot::Running(handle)) = self.worker.take() {
                match handle.join() {
                    Ok(worker) => self.worker = Some(WorkerSlot::Idle(worker)),
                    Err(_) => {
                        log::error!("gui: render thread panicked; loop is inert");
                    }
                }
            }
        }

        match self.worker.take() {
            Some(WorkerSlot::Idle(worker)) => {
                self.flags.should_exit.store(false, Ordering::SeqCst);
                self.flags
                    .animation_running
                    .store(self.driver.is_running(), Ordering::SeqCst);
                log::trace!("gui: starting render thread");
                self.worker = Some(WorkerSlot::Running(worker.spawn()));
            }
            other => {
                self.worker = other;
            }
        }
    }

    // ===================================================================
    // Updates and sync
    // ===================================================================

    /// Notify the loop that a window changed size. Posts the new size to
    /// the worker and synchronously polishes and syncs so the next frame
    /// is rendered at the new size.
    pub fn resize(&mut self, window: &WindowRef, size: SurfaceSize) {
        log::trace!("gui: resize {} to {}", window.id(), size);

        if !self.worker_active()
            || self.windows.is_empty()
            || !window.is_exposed()
            || self.window_index(window.id()).is_none()
        {
            return;
        }
        if size.is_degenerate() {
            return;
        }

        let _ = self.comms.render_tx.send(RenderEvent::Resize {
            id: window.id(),
            size,
        });

        self.polish_and_sync();
    }

    /// Explicit repaint request from GUI code. Render-thread callers use
    /// [`UpdateHandle::update`] instead.
    pub fn update(&mut self, window: &WindowRef) {
        log::trace!("gui: update {}", window.id());
        self.maybe_update(window);
    }

    /// Coalesce a scene change into the update timer. No-op for untracked
    /// windows, windows already pending, or while the worker is down.
    pub fn maybe_update(&mut self, window: &WindowRef) {
        log::trace!("gui: maybe_update {}", window.id());

        let Some(i) = self.window_index(window.id()) else {
            return;
        };
        if self.windows[i].pending_update || !self.worker_active() {
            return;
        }

        self.windows[i].pending_update = true;

        if self.update_timer_armed {
            return;
        }

        // Back-to-back syncs starve the render thread; while animations
        // run, hold updates back for the exhaust delay so frames coalesce.
        let delay = if self.driver.is_running() {
            self.config.exhaust_delay
        } else {
            Duration::ZERO
        };
        log::trace!("gui:  - arming update timer ({delay:?})");
        self.timers.arm(TimerKind::Update, delay);
        self.update_timer_armed = true;
    }

    /// Polish every tracked window, then block in the sync rendezvous
    /// until the worker has taken its snapshot. The single blocking point
    /// of the GUI thread.
    fn polish_and_sync(&mut self) {
        if !self.anyone_showing() {
            return;
        }
        if !self.worker_active() {
            return;
        }

        let timing = self.config.window_timing;
        let start = Instant::now();
        log::trace!("gui: polish_and_sync()");

        // Polish as the last thing before the sync so the tree the worker
        // observes is final.
        for w in &self.windows {
            w.window.polish_items();
        }
        let polish_done = Instant::now();

        for w in &mut self.windows {
            w.pending_update = false;
        }

        log::trace!("gui:  - locking for sync");
        let render_tx = self.comms.render_tx.clone();
        self.rendezvous.gui_wait(|| {
            let _ = render_tx.send(RenderEvent::RequestSync);
        });
        log::trace!("gui:  - unlocked after sync");

        if timing {
            log::debug!(
                "gui: window timing - polish={}us blocked={}us",
                polish_done.duration_since(start).as_micros(),
                polish_done.elapsed().as_micros(),
            );
        }
    }

    /// Synchronous scene capture. Runs a full polish→sync→render cycle so
    /// the image reflects every mutation made before the call; two grabs
    /// with no mutation in between produce identical images.
    pub fn grab(&mut self, window: &WindowRef) -> Option<GrabImage> {
        log::trace!("gui: grab {}", window.id());
        if !self.worker_active() {
            return None;
        }

        if let Err(err) = window.realize() {
            log::warn!("gui: could not realize surface for grab: {err}");
            return None;
        }

        window.polish_items();

        let render_tx = self.comms.render_tx.clone();
        let window = window.clone();
        let result = self.rendezvous.gui_wait(move || {
            let _ = render_tx.send(RenderEvent::Grab { window });
        });

        log::trace!("gui:  - grab complete");
        result
    }

    /// Ask the worker to drop the scene-graph runtime and graphics context
    /// if nothing needs them anymore. Blocks until the worker has decided;
    /// the rendezvous always completes even when nothing is released.
    fn release_resources(&mut self, window: &WindowRef, in_destructor: bool) {
        log::trace!("gui: release_resources ({})", window.id());
        if !self.worker_active() {
            return;
        }

        // Snapshot for the persistence decision: the GUI is blocked until
        // the handler finishes, so the list cannot change under it.
        let remaining: Vec<WindowRef> = self.windows.iter().map(|w| w.window.clone()).collect();

        let render_tx = self.comms.render_tx.clone();
        let window = window.clone();
        self.rendezvous.gui_wait(move || {
            let _ = render_tx.send(RenderEvent::TryRelease {
                window,
                in_destructor,
                remaining,
            });
        });
    }

    // ===================================================================
    // Animation driver coupling
    // ===================================================================

    /// The host's animation system started running. Publishes the state to
    /// the worker and evaluates both tick sources.
    pub fn animation_started(&mut self) {
        log::trace!("gui: animation_started()");
        self.driver.start();
        self.flags.animation_running.store(true, Ordering::SeqCst);
        // Carrier event so a parked worker wakes and re-evaluates
        let _ = self.comms.render_tx.send(RenderEvent::AnimationsStarted);

        if !self.anyone_showing() && !self.animation_timer_armed {
            self.timers
                .arm(TimerKind::Animation, self.config.animation_interval());
            self.animation_timer_armed = true;
        }
    }

    /// The host's animation system went idle.
    pub fn animation_stopped(&mut self) {
        log::trace!("gui: animation_stopped()");
        self.driver.stop();
        self.flags.animation_running.store(false, Ordering::SeqCst);
        let _ = self.comms.render_tx.send(RenderEvent::AnimationsStopped);

        if self.animation_timer_armed {
            self.timers.cancel(TimerKind::Animation);
            self.animation_timer_armed = false;
        }
    }

    // ===================================================================
    // GUI event dispatch
    // ===================================================================

    /// Drain and dispatch posted GUI events. The host calls this whenever
    /// the wakeup fd becomes readable.
    pub fn process_events(&mut self) {
        self.comms.wakeup.clear();

        while let Ok(event) = self.comms.gui_rx.try_recv() {
            match event {
                GuiEvent::UpdateLater { id } => {
                    // The window might have gone away since the post
                    if let Some(i) = self.window_index(id) {
                        let window = self.windows[i].window.clone();
                        self.maybe_update(&window);
                    }
                }

                GuiEvent::AdvanceAnimations => {
                    let _ = self.flags.animation_requests_pending.fetch_update(
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                        |v| v.checked_sub(1),
                    );
                    log::trace!("gui: advance animations (vsync)");
                    if self.driver.is_running() {
                        self.driver.advance();
                    }
                }

                GuiEvent::UpdateTimerFired => {
                    log::trace!("gui: update timer -> polish_and_sync()");
                    self.update_timer_armed = false;
                    self.polish_and_sync();
                }

                GuiEvent::AnimationTimerFired => {
                    log::trace!("gui: advance animations (off-screen)");
                    if self.driver.is_running() {
                        self.driver.advance();
                    }
                }
            }
        }
    }
}

impl Drop for ThreadedRenderLoop {
    fn drop(&mut self) {
        self.flags.should_exit.store(true, Ordering::SeqCst);
        // Wake a parked worker; the stopped-animations carrier is inert on
        // its own and the worker re-checks the exit flag right after.
        let _ = self.comms.render_tx.send(RenderEvent::AnimationsStopped);
        if let Some(WorkerSlot::Running(handle)) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// Cheap `Send + Sync` handle for requesting window updates away from the
/// coordinator — most importantly from the render thread while it syncs,
/// which is the only non-GUI thread allowed to do so.
#[derive(Clone)]
pub struct UpdateHandle {
    render_tx: Sender<RenderEvent>,
    gui_tx: Sender<GuiEvent>,
    wakeup: WakeupHandle,
    flags: Arc<RenderFlags>,
    rendezvous: Arc<Rendezvous>,
    gui_thread: ThreadId,
}

impl UpdateHandle {
    /// Explicit repaint request. On the render thread this schedules
    /// another render pass directly (keeping render-driven animations
    /// alive while the GUI is blocked); elsewhere it behaves like
    /// [`maybe_update`](Self::maybe_update).
    pub fn update(&self, id: WindowId) {
        if self.flags.on_render_thread() {
            log::trace!("gui: update for {id} called on render thread");
            let _ = self.render_tx.send(RenderEvent::RequestRepaint);
            return;
        }
        self.maybe_update(id);
    }

    /// Replay an update request on the GUI thread.
    ///
    /// # Panics
    ///
    /// Calling this from a thread that is neither the GUI thread nor the
    /// render thread inside sync is a programmer error and panics.
    pub fn maybe_update(&self, id: WindowId) {
        if self.flags.on_render_thread() {
            assert!(
                self.rendezvous.gui_is_locked(),
                "maybe_update: on the render thread this may only be called during sync"
            );
            log::trace!("gui: maybe_update for {id} on render thread, posting update later");
        } else {
            assert!(
                thread::current().id() == self.gui_thread,
                "maybe_update: must be called from the GUI thread or from the render thread during sync"
            );
        }

        if self.gui_tx.send(GuiEvent::UpdateLater { id }).is_ok() {
            self.wakeup.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_animation_interval_from_refresh_rate() {
        let config = LoopConfig {
            refresh_rate: 60.0,
            exhaust_delay: Duration::from_millis(5),
            window_timing: false,
        };
        assert_eq!(config.animation_interval(), Duration::from_millis(16));

        let config = LoopConfig {
            refresh_rate: 120.0,
            ..config
        };
        assert_eq!(config.animation_interval(), Duration::from_millis(8));
    }

    #[test]
    fn test_animation_interval_bogus_refresh_rate() {
        // Some platforms wrongfully report 0 for the refresh rate
        let config = LoopConfig {
            refresh_rate: 0.0,
            exhaust_delay: Duration::from_millis(5),
            window_timing: false,
        };
        assert_eq!(config.animation_interval(), Duration::from_millis(16));
    }

    #[test]
    fn test_config_from_env_defaults() {
        let config = LoopConfig::from_env(60.0);
        assert_eq!(config.refresh_rate, 60.0);
        assert_eq!(config.exhaust_delay, Duration::from_millis(5));
    }
}
