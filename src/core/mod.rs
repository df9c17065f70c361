//! Core types and data structures for the render loop.

pub mod animation;
pub mod error;
pub mod scene;
pub mod types;

pub use animation::*;
pub use error::*;
pub use scene::*;
pub use types::*;
