//! Vitrail Display — the threaded render loop behind the Vitrail
//! scene-graph UI toolkit.
//!
//! # Architecture
//!
//! ```text
//! GUI thread (coordinator)          Render thread (worker)
//!   items ──► polish ──► sync ◄─────── scene graph ──► GPU
//!                 │    rendezvous           │
//!                 └──── posted events ──────┘
//! ```
//!
//! The GUI thread mutates the declarative scene and blocks at exactly one
//! point — the sync rendezvous — while the render thread takes a
//! consistent snapshot. The render thread owns the graphics context and
//! keeps animations advancing even while the GUI is busy.

pub mod backend;
pub mod core;
pub mod render_loop;
pub mod render_thread;
pub mod thread_comm;

mod timer;

pub use crate::backend::{ContextFactory, GraphicsContext, SceneRuntime};
pub use crate::core::*;
pub use crate::render_loop::{LoopConfig, ThreadedRenderLoop, UpdateHandle};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Integer environment knob with fallback, `VITRAIL_*` style.
pub(crate) fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(value) => match value.trim().parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                log::warn!("{name}={value}: not an integer, using {default}");
                default
            }
        },
        Err(_) => default,
    }
}

/// Initialize logging for the display loop.
pub fn init() {
    let _ = env_logger::try_init();
    log::info!("vitrail display v{} (threaded render loop)", VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_env_u64_default_and_parse() {
        assert_eq!(env_u64("VITRAIL_TEST_KNOB_UNSET", 5), 5);

        std::env::set_var("VITRAIL_TEST_KNOB_SET", "12");
        assert_eq!(env_u64("VITRAIL_TEST_KNOB_SET", 5), 12);

        std::env::set_var("VITRAIL_TEST_KNOB_BAD", "wat");
        assert_eq!(env_u64("VITRAIL_TEST_KNOB_BAD", 5), 5);
    }
}
