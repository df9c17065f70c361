//! Thread communication infrastructure for the two-thread render loop.
//!
//! Three primitives: the posted-event channels between the GUI coordinator
//! and the render worker, the wakeup pipe that tells the host's dispatch
//! loop to drain GUI events, and the mutex + condition pair behind the
//! synchronous rendezvous (sync, release, grab).

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::core::scene::WindowRef;
use crate::core::types::{GrabImage, SurfaceSize, WindowId};

/// Event posted to the render worker.
///
/// GUI→RT except `RequestRepaint`, which the worker posts to itself when
/// an update is requested from the render thread during sync. Delivery is
/// FIFO per sender and wakes a parked worker.
pub enum RenderEvent {
    /// Window is rendering on screen and should join the worker's list.
    /// The size is captured at post time.
    Expose { window: WindowRef, size: SurfaceSize },

    /// Window is obscured and should leave the worker's list.
    Obscure { id: WindowId },

    /// The GUI is locked and waiting for the worker to sync.
    RequestSync,

    /// Worker-to-self: schedule another render pass.
    RequestRepaint,

    /// Window changed size. No explicit wake; a sync follows immediately.
    Resize { id: WindowId, size: SurfaceSize },

    /// Release the scene-graph runtime and graphics context if no window
    /// still needs them. Carries the GUI's remaining-window snapshot so
    /// persistence can be evaluated without touching GUI state; the GUI is
    /// blocked for the event's whole lifetime, so the snapshot cannot go
    /// stale. Always completes the rendezvous.
    TryRelease {
        window: WindowRef,
        in_destructor: bool,
        remaining: Vec<WindowRef>,
    },

    /// Synchronous render + readback into the rendezvous result slot.
    Grab { window: WindowRef },

    /// Animation driver state changes. The flag itself travels as an
    /// atomic; these carriers exist so a parked worker wakes up.
    AnimationsStarted,
    AnimationsStopped,
}

impl fmt::Debug for RenderEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderEvent::Expose { window, size } => {
                write!(f, "Expose({}, {})", window.id(), size)
            }
            RenderEvent::Obscure { id } => write!(f, "Obscure({id})"),
            RenderEvent::RequestSync => write!(f, "RequestSync"),
            RenderEvent::RequestRepaint => write!(f, "RequestRepaint"),
            RenderEvent::Resize { id, size } => write!(f, "Resize({id}, {size})"),
            RenderEvent::TryRelease {
                window,
                in_destructor,
                ..
            } => write!(f, "TryRelease({}, in_destructor={in_destructor})", window.id()),
            RenderEvent::Grab { window } => write!(f, "Grab({})", window.id()),
            RenderEvent::AnimationsStarted => write!(f, "AnimationsStarted"),
            RenderEvent::AnimationsStopped => write!(f, "AnimationsStopped"),
        }
    }
}

/// Event posted to the GUI coordinator. RT→GUI, GUI→GUI (update replay),
/// and the timer service's expiries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuiEvent {
    /// Replay `maybe_update` for a window on the GUI thread.
    UpdateLater { id: WindowId },

    /// The worker's swap cadence says animations should advance.
    AdvanceAnimations,

    /// The coalescing update timer fired.
    UpdateTimerFired,

    /// The off-screen animation timer ticked.
    AnimationTimerFired,
}

/// Wakeup pipe for signaling the host's GUI dispatch loop.
///
/// The GUI side owns the pipe and hands cheap write-only handles to the
/// render worker and the timer service.
pub struct WakeupPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakeupPipe {
    /// Create the pipe. The read end is switched to non-blocking for its
    /// whole life: `clear()` must never stall the GUI thread, and the host
    /// only ever reads after polling readability.
    pub fn new() -> std::io::Result<Self> {
        use std::os::unix::io::IntoRawFd;
        let (read, write) = os_pipe::pipe()?;
        let read_fd = read.into_raw_fd();
        let write_fd = write.into_raw_fd();

        let rc = unsafe {
            let flags = libc::fcntl(read_fd, libc::F_GETFL);
            if flags < 0 {
                flags
            } else {
                libc::fcntl(read_fd, libc::F_SETFL, flags | libc::O_NONBLOCK)
            }
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(read_fd);
                libc::close(write_fd);
            }
            return Err(err);
        }

        Ok(Self { read_fd, write_fd })
    }

    /// The fd the host should `select()` on.
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Write-only handle for the threads that post GUI events.
    pub fn handle(&self) -> WakeupHandle {
        WakeupHandle { fd: self.write_fd }
    }

    /// Drain queued wake bytes. Called on the GUI thread before processing
    /// events; the read end is non-blocking, so this returns immediately
    /// once the pipe is empty.
    pub fn clear(&self) {
        let mut buf = [0u8; 16];
        let mut drained = 0isize;
        loop {
            let n =
                unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut _, buf.len()) };
            if n <= 0 {
                break;
            }
            drained += n;
        }
        if drained > 0 {
            log::trace!("gui: drained {drained} wake bytes");
        }
    }
}

impl Drop for WakeupPipe {
    fn drop(&mut self) {
        for fd in [self.read_fd, self.write_fd] {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// Write end of the wakeup pipe. Copyable; does not close the fd.
#[derive(Debug, Clone, Copy)]
pub struct WakeupHandle {
    fd: RawFd,
}

impl WakeupHandle {
    /// Wake the host's dispatch loop. Failures (e.g. the pipe already
    /// closed during teardown) are ignored.
    pub fn wake(&self) {
        unsafe {
            libc::write(self.fd, [1u8].as_ptr() as *const _, 1);
        }
    }
}

/// State guarded by the rendezvous mutex.
pub struct RendezvousState {
    /// Bumped once per completed rendezvous. Pairs each GUI wait with
    /// exactly one worker signal and absorbs spurious wakeups.
    generation: u64,

    /// Result slot filled by the grab handler.
    pub grab_result: Option<GrabImage>,
}

/// The mutex + condition pair behind every synchronous GUI→RT hand-off.
///
/// Protocol: the GUI acquires the mutex, marks itself locked, posts the
/// event *while holding the mutex*, then waits. The worker's handler
/// acquires the mutex at entry — which cannot happen before the GUI is
/// actually waiting — does its work, signals, and releases at exit. The
/// guard spans the whole handler body so early returns still signal.
pub struct Rendezvous {
    state: Mutex<RendezvousState>,
    cond: Condvar,
    /// True while the GUI thread is parked in the condition wait. Written
    /// under the mutex but readable without it: scene hooks running inside
    /// a handler (which holds the mutex) use it as a precondition check.
    gui_is_locked: AtomicBool,
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}

impl Rendezvous {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RendezvousState {
                generation: 0,
                grab_result: None,
            }),
            cond: Condvar::new(),
            gui_is_locked: AtomicBool::new(false),
        }
    }

    /// Acquire the rendezvous mutex. Render-side handlers hold this guard
    /// for their whole body; it doubles as the lock for render-side window
    /// list edits while the GUI may be blocked.
    pub fn lock(&self) -> MutexGuard<'_, RendezvousState> {
        self.state.lock().unwrap()
    }

    /// Whether the GUI thread is currently blocked in a rendezvous.
    pub fn gui_is_locked(&self) -> bool {
        self.gui_is_locked.load(Ordering::SeqCst)
    }

    /// GUI side: post one synchronous event and block until the worker
    /// completes it. Returns the grab result slot (empty for sync and
    /// release rendezvous).
    pub fn gui_wait(&self, post: impl FnOnce()) -> Option<GrabImage> {
        let mut state = self.state.lock().unwrap();
        self.gui_is_locked.store(true, Ordering::SeqCst);
        let generation = state.generation;
        // Post while holding the mutex: the worker must acquire it to
        // signal, so it cannot signal before we wait.
        post();
        while state.generation == generation {
            state = self.cond.wait(state).unwrap();
        }
        self.gui_is_locked.store(false, Ordering::SeqCst);
        state.grab_result.take()
    }

    /// Worker side: complete the rendezvous the GUI is waiting on. The
    /// caller still holds the guard; the actual release happens when the
    /// handler returns.
    pub fn complete(&self, state: &mut RendezvousState) {
        state.generation = state.generation.wrapping_add(1);
        self.cond.notify_one();
    }
}

/// Communication channels between the two threads, created once per loop.
///
/// Both channels are unbounded: posting never blocks the sender, and
/// events queued before the worker's first park are drained on its first
/// iteration, so nothing posted before thread start is ever lost.
pub struct ThreadComms {
    pub render_tx: Sender<RenderEvent>,
    pub render_rx: Receiver<RenderEvent>,
    pub gui_tx: Sender<GuiEvent>,
    pub gui_rx: Receiver<GuiEvent>,
    pub wakeup: WakeupPipe,
}

impl ThreadComms {
    pub fn new() -> std::io::Result<Self> {
        let (render_tx, render_rx) = unbounded();
        let (gui_tx, gui_rx) = unbounded();
        let wakeup = WakeupPipe::new()?;

        Ok(Self {
            render_tx,
            render_rx,
            gui_tx,
            gui_rx,
            wakeup,
        })
    }

    /// Split into the GUI-side and render-side handles.
    pub fn split(self) -> (GuiComms, RenderComms) {
        let wakeup_handle = self.wakeup.handle();

        let render = RenderComms {
            render_rx: self.render_rx,
            gui_tx: self.gui_tx.clone(),
            wakeup: wakeup_handle,
        };

        let gui = GuiComms {
            render_tx: self.render_tx,
            gui_tx: self.gui_tx,
            gui_rx: self.gui_rx,
            wakeup: self.wakeup,
        };

        (gui, render)
    }
}

/// GUI-side communication handle, owned by the loop coordinator.
pub struct GuiComms {
    pub render_tx: Sender<RenderEvent>,
    pub gui_tx: Sender<GuiEvent>,
    pub gui_rx: Receiver<GuiEvent>,
    pub wakeup: WakeupPipe,
}

/// Render-side communication handle, moved into the worker.
pub struct RenderComms {
    pub render_rx: Receiver<RenderEvent>,
    gui_tx: Sender<GuiEvent>,
    wakeup: WakeupHandle,
}

impl RenderComms {
    /// Post an event to the GUI and wake the host's dispatch loop.
    pub fn post_gui(&self, event: GuiEvent) {
        if self.gui_tx.send(event).is_ok() {
            self.wakeup.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    // ===================================================================
    // WakeupPipe
    // ===================================================================

    #[test]
    fn test_wakeup_pipe_wake_and_clear() {
        let pipe = WakeupPipe::new().unwrap();
        let handle = pipe.handle();

        handle.wake();
        handle.wake();
        pipe.clear();

        // After clear, a non-blocking read should find nothing
        let mut buf = [0u8; 1];
        let n = unsafe {
            let flags = libc::fcntl(pipe.read_fd(), libc::F_GETFL);
            libc::fcntl(pipe.read_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK);
            let n = libc::read(pipe.read_fd(), buf.as_mut_ptr() as *mut _, 1);
            libc::fcntl(pipe.read_fd(), libc::F_SETFL, flags);
            n
        };
        assert!(n <= 0, "pipe should be empty after clear(), read returned {}", n);
    }

    #[test]
    fn test_wakeup_pipe_clear_on_empty_is_noop() {
        let pipe = WakeupPipe::new().unwrap();
        pipe.clear();
    }

    // ===================================================================
    // Channels
    // ===================================================================

    #[test]
    fn test_render_events_preserve_order() {
        let comms = ThreadComms::new().unwrap();
        let (gui, render) = comms.split();

        gui.render_tx
            .send(RenderEvent::Resize {
                id: WindowId(1),
                size: SurfaceSize::new(800, 600),
            })
            .unwrap();
        gui.render_tx.send(RenderEvent::RequestSync).unwrap();

        match render.render_rx.recv().unwrap() {
            RenderEvent::Resize { id, size } => {
                assert_eq!(id, WindowId(1));
                assert_eq!(size, SurfaceSize::new(800, 600));
            }
            other => panic!("expected Resize first, got {:?}", other),
        }
        assert!(matches!(
            render.render_rx.recv().unwrap(),
            RenderEvent::RequestSync
        ));
    }

    #[test]
    fn test_post_gui_wakes_host() {
        let comms = ThreadComms::new().unwrap();
        let (gui, render) = comms.split();

        render.post_gui(GuiEvent::AdvanceAnimations);

        assert_eq!(
            gui.gui_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            GuiEvent::AdvanceAnimations
        );

        // The wake byte must be in the pipe
        let mut buf = [0u8; 1];
        let n = unsafe {
            let flags = libc::fcntl(gui.wakeup.read_fd(), libc::F_GETFL);
            libc::fcntl(gui.wakeup.read_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK);
            let n = libc::read(gui.wakeup.read_fd(), buf.as_mut_ptr() as *mut _, 1);
            libc::fcntl(gui.wakeup.read_fd(), libc::F_SETFL, flags);
            n
        };
        assert_eq!(n, 1, "post_gui should have written a wake byte");
    }

    // ===================================================================
    // Rendezvous
    // ===================================================================

    #[test]
    fn test_rendezvous_handshake() {
        let rdv = std::sync::Arc::new(Rendezvous::new());
        let (tx, rx) = unbounded::<u8>();

        let worker = {
            let rdv = rdv.clone();
            thread::spawn(move || {
                // Acquiring the mutex can only succeed once the GUI side is
                // parked in wait
                rx.recv().unwrap();
                let mut state = rdv.lock();
                assert!(rdv.gui_is_locked(), "GUI must be waiting when handler runs");
                rdv.complete(&mut state);
            })
        };

        let result = rdv.gui_wait(|| {
            tx.send(1).unwrap();
        });
        assert!(result.is_none(), "non-grab rendezvous carries no image");
        assert!(!rdv.gui_is_locked());
        worker.join().unwrap();
    }

    #[test]
    fn test_rendezvous_carries_grab_result() {
        let rdv = std::sync::Arc::new(Rendezvous::new());
        let (tx, rx) = unbounded::<u8>();

        let worker = {
            let rdv = rdv.clone();
            thread::spawn(move || {
                rx.recv().unwrap();
                let mut state = rdv.lock();
                state.grab_result = Some(GrabImage::new(2, 2, vec![7u8; 16]));
                rdv.complete(&mut state);
            })
        };

        let image = rdv
            .gui_wait(|| tx.send(1).unwrap())
            .expect("grab rendezvous must return the image");
        assert_eq!(image.width, 2);
        assert_eq!(image.pixels, vec![7u8; 16]);
        worker.join().unwrap();

        // The slot is drained; a later rendezvous must not see stale data
        assert!(rdv.lock().grab_result.is_none());
    }

    #[test]
    fn test_rendezvous_pairs_each_wait_with_one_signal() {
        let rdv = std::sync::Arc::new(Rendezvous::new());
        let (tx, rx) = unbounded::<u8>();

        let worker = {
            let rdv = rdv.clone();
            thread::spawn(move || {
                for _ in 0..3 {
                    rx.recv().unwrap();
                    let mut state = rdv.lock();
                    rdv.complete(&mut state);
                }
            })
        };

        for _ in 0..3 {
            rdv.gui_wait(|| tx.send(1).unwrap());
        }
        worker.join().unwrap();
    }
}
