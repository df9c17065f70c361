//! GUI-side timer service.
//!
//! The coordinator's two timers — the one-shot update coalescing timer and
//! the periodic off-screen animation timer — are armed here. Expiries are
//! posted as GUI events through the wakeup pipe, so the host's dispatch
//! loop sees them like any other posted event and no timer callback ever
//! runs off the GUI thread.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::thread_comm::{GuiEvent, WakeupHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// One-shot; fires `UpdateTimerFired`.
    Update,
    /// Periodic; fires `AnimationTimerFired` every interval.
    Animation,
}

#[derive(Debug)]
enum TimerCmd {
    Arm { kind: TimerKind, interval: Duration },
    Cancel { kind: TimerKind },
    Shutdown,
}

pub(crate) struct TimerService {
    cmd_tx: Sender<TimerCmd>,
    handle: Option<JoinHandle<()>>,
}

impl TimerService {
    pub fn spawn(gui_tx: Sender<GuiEvent>, wakeup: WakeupHandle) -> Self {
        let (cmd_tx, cmd_rx) = unbounded();
        let handle = thread::Builder::new()
            .name("vitrail-timers".into())
            .spawn(move || run_timer_loop(cmd_rx, gui_tx, wakeup))
            .expect("failed to spawn timer thread");
        Self {
            cmd_tx,
            handle: Some(handle),
        }
    }

    /// Arm a timer. Re-arming replaces the previous deadline.
    pub fn arm(&self, kind: TimerKind, interval: Duration) {
        let _ = self.cmd_tx.send(TimerCmd::Arm { kind, interval });
    }

    pub fn cancel(&self, kind: TimerKind) {
        let _ = self.cmd_tx.send(TimerCmd::Cancel { kind });
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(TimerCmd::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_timer_loop(cmd_rx: Receiver<TimerCmd>, gui_tx: Sender<GuiEvent>, wakeup: WakeupHandle) {
    let mut update_deadline: Option<Instant> = None;
    let mut animation: Option<(Instant, Duration)> = None;

    loop {
        let now = Instant::now();

        if let Some(deadline) = update_deadline {
            if deadline <= now {
                update_deadline = None;
                if gui_tx.send(GuiEvent::UpdateTimerFired).is_ok() {
                    wakeup.wake();
                }
            }
        }

        if let Some((deadline, interval)) = animation {
            if deadline <= now {
                // Schedule from the missed deadline to keep the cadence,
                // but never burst to catch up
                let mut next = deadline + interval;
                if next < now {
                    next = now + interval;
                }
                animation = Some((next, interval));
                if gui_tx.send(GuiEvent::AnimationTimerFired).is_ok() {
                    wakeup.wake();
                }
            }
        }

        let next_deadline = match (update_deadline, animation) {
            (Some(u), Some((a, _))) => Some(u.min(a)),
            (Some(u), None) => Some(u),
            (None, Some((a, _))) => Some(a),
            (None, None) => None,
        };

        let cmd = match next_deadline {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                match cmd_rx.recv_timeout(timeout) {
                    Ok(cmd) => cmd,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            None => match cmd_rx.recv() {
                Ok(cmd) => cmd,
                Err(_) => return,
            },
        };

        match cmd {
            TimerCmd::Arm { kind, interval } => {
                let deadline = Instant::now() + interval;
                match kind {
                    TimerKind::Update => update_deadline = Some(deadline),
                    TimerKind::Animation => animation = Some((deadline, interval)),
                }
            }
            TimerCmd::Cancel { kind } => match kind {
                TimerKind::Update => update_deadline = None,
                TimerKind::Animation => animation = None,
            },
            TimerCmd::Shutdown => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread_comm::WakeupPipe;

    fn service() -> (TimerService, Receiver<GuiEvent>, WakeupPipe) {
        let pipe = WakeupPipe::new().unwrap();
        let (gui_tx, gui_rx) = unbounded();
        let service = TimerService::spawn(gui_tx, pipe.handle());
        (service, gui_rx, pipe)
    }

    #[test]
    fn test_update_timer_fires_once() {
        let (service, gui_rx, _pipe) = service();

        service.arm(TimerKind::Update, Duration::from_millis(5));
        assert_eq!(
            gui_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            GuiEvent::UpdateTimerFired
        );

        // One-shot: no second expiry
        assert!(gui_rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_zero_interval_fires_immediately() {
        let (service, gui_rx, _pipe) = service();

        service.arm(TimerKind::Update, Duration::ZERO);
        assert_eq!(
            gui_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            GuiEvent::UpdateTimerFired
        );
    }

    #[test]
    fn test_cancel_suppresses_expiry() {
        let (service, gui_rx, _pipe) = service();

        service.arm(TimerKind::Update, Duration::from_millis(40));
        service.cancel(TimerKind::Update);
        assert!(
            gui_rx.recv_timeout(Duration::from_millis(100)).is_err(),
            "cancelled timer must not fire"
        );
    }

    #[test]
    fn test_animation_timer_repeats() {
        let (service, gui_rx, _pipe) = service();

        service.arm(TimerKind::Animation, Duration::from_millis(5));
        for _ in 0..3 {
            assert_eq!(
                gui_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
                GuiEvent::AnimationTimerFired
            );
        }

        service.cancel(TimerKind::Animation);
        // Drain anything in flight, then expect silence
        while gui_rx.recv_timeout(Duration::from_millis(30)).is_ok() {}
        assert!(gui_rx.recv_timeout(Duration::from_millis(50)).is_err());
    }
}
