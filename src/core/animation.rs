//! Animation driver for the render loop's two tick sources.
//!
//! While a window is on screen the driver is advanced from the render
//! thread's swap cadence (AdvanceAnimations events); while everything is
//! obscured it is advanced from the off-screen timer. The loop guarantees
//! the two sources are never active at the same time.

use std::time::{Duration, Instant};

/// Clock behind the toolkit's animation system.
///
/// The driver itself is a plain GUI-thread object; cross-thread
/// coordination (the render thread's `animation_running` flag, the
/// off-screen timer) is handled by the loop coordinator when the host
/// calls `animation_started` / `animation_stopped`.
#[derive(Debug)]
pub struct AnimationDriver {
    running: bool,
    started_at: Option<Instant>,
    accumulated: Duration,
    advance_count: u64,
}

impl Default for AnimationDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl AnimationDriver {
    pub fn new() -> Self {
        Self {
            running: false,
            started_at: None,
            accumulated: Duration::ZERO,
            advance_count: 0,
        }
    }

    pub fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        self.started_at = Some(Instant::now());
    }

    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        if let Some(started) = self.started_at.take() {
            self.accumulated += started.elapsed();
        }
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Advance the animation clock one tick. No-op while stopped.
    pub fn advance(&mut self) {
        if !self.running {
            return;
        }
        self.advance_count += 1;
    }

    /// Total time the driver has spent running.
    pub fn elapsed(&self) -> Duration {
        match self.started_at {
            Some(started) => self.accumulated + started.elapsed(),
            None => self.accumulated,
        }
    }

    /// Number of ticks delivered since creation. Useful for pacing checks.
    pub fn advance_count(&self) -> u64 {
        self.advance_count
    }
}
