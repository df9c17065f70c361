//! Core value types shared by both sides of the render loop.

use std::fmt;

/// Identity of a window tracked by the render loop.
///
/// The loop never dereferences platform window handles itself; windows are
/// compared and looked up by this id only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(pub u64);

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "window#{}", self.0)
    }
}

/// Surface size in physical pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SurfaceSize {
    pub width: u32,
    pub height: u32,
}

impl SurfaceSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A window with zero width or height is kept in the record lists but
    /// skipped by sync and render.
    pub fn is_degenerate(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for SurfaceSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Framebuffer readback produced by a window grab.
///
/// Tightly packed RGBA8, `width * height * 4` bytes, top-left origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrabImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl GrabImage {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degenerate_sizes() {
        assert!(SurfaceSize::new(0, 600).is_degenerate());
        assert!(SurfaceSize::new(800, 0).is_degenerate());
        assert!(SurfaceSize::new(0, 0).is_degenerate());
        assert!(!SurfaceSize::new(800, 600).is_degenerate());
    }

    #[test]
    fn test_window_id_display() {
        assert_eq!(WindowId(7).to_string(), "window#7");
    }

    #[test]
    fn test_grab_image_empty() {
        let img = GrabImage::new(0, 0, Vec::new());
        assert!(img.is_empty());

        let img = GrabImage::new(1, 1, vec![0, 0, 0, 255]);
        assert!(!img.is_empty());
    }
}
