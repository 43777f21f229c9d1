//! Canvas geometry: size limits, fragment validation and clipping.
//!
//! Canvas space has its origin at the top-left pixel, `x` growing right and `y` growing down.
//! A [`Fragment`] is positioned in canvas space and may extend past any edge; its own local
//! space has `(0, 0)` at the fragment's top-left corner.

use std::fmt;

use crate::foundation::error::{StoreError, StoreResult};

pub const MAX_CANVAS_WIDTH: u32 = 20_000;
pub const MAX_CANVAS_HEIGHT: u32 = 50_000;
/// Largest side accepted by fragment reads.
pub const MAX_READ_SIDE: u32 = 5_000;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct CanvasId(pub u64);

impl fmt::Display for CanvasId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CanvasSize {
    pub width: u32,
    pub height: u32,
}

impl CanvasSize {
    /// Validate requested canvas dimensions against the engine limits.
    pub fn new(width: i64, height: i64) -> StoreResult<Self> {
        if width < 1 || width > i64::from(MAX_CANVAS_WIDTH) {
            return Err(StoreError::parameter(format!(
                "canvas width must be in 1..={MAX_CANVAS_WIDTH}, got {width}"
            )));
        }
        if height < 1 || height > i64::from(MAX_CANVAS_HEIGHT) {
            return Err(StoreError::parameter(format!(
                "canvas height must be in 1..={MAX_CANVAS_HEIGHT}, got {height}"
            )));
        }
        Ok(Self {
            width: width as u32,
            height: height as u32,
        })
    }

    pub fn pixel_count(self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn contains(self, x: i64, y: i64) -> bool {
        (0..i64::from(self.width)).contains(&x) && (0..i64::from(self.height)).contains(&y)
    }

    pub fn full_rect(self) -> PixelRect {
        PixelRect {
            x: 0,
            y: 0,
            width: self.width,
            height: self.height,
        }
    }
}

/// A requested rectangle in canvas space. The offset may be negative.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Fragment {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

impl Fragment {
    /// Fragment geometry for updates: any positive size is accepted.
    pub fn new(x: i64, y: i64, width: i64, height: i64) -> StoreResult<Self> {
        let width = positive_side("width", width)?;
        let height = positive_side("height", height)?;
        Ok(Self {
            x,
            y,
            width,
            height,
        })
    }

    /// Fragment geometry for reads: each side is capped at [`MAX_READ_SIDE`].
    pub fn for_read(x: i64, y: i64, width: i64, height: i64) -> StoreResult<Self> {
        let frag = Self::new(x, y, width, height)?;
        if frag.width > MAX_READ_SIDE || frag.height > MAX_READ_SIDE {
            return Err(StoreError::parameter(format!(
                "read fragment sides must be at most {MAX_READ_SIDE}, got {}x{}",
                frag.width, frag.height
            )));
        }
        Ok(frag)
    }

    /// Canvas-space coordinate of local pixel `(i, j)`, or `None` if it falls outside `size`.
    pub fn map_local(self, size: CanvasSize, i: u32, j: u32) -> Option<(u32, u32)> {
        let cx = self.x.checked_add(i64::from(i))?;
        let cy = self.y.checked_add(i64::from(j))?;
        size.contains(cx, cy).then_some((cx as u32, cy as u32))
    }

    /// Clipped overlap with a canvas, or `None` if the fragment misses the canvas entirely.
    pub fn clip(self, size: CanvasSize) -> Option<Clip> {
        let (x0, x1) = clip_axis(self.x, self.width, size.width)?;
        let (y0, y1) = clip_axis(self.y, self.height, size.height)?;
        Some(Clip {
            canvas: PixelRect {
                x: x0,
                y: y0,
                width: x1 - x0,
                height: y1 - y0,
            },
            local_x: (i64::from(x0) - self.x) as u32,
            local_y: (i64::from(y0) - self.y) as u32,
        })
    }

    /// Like [`Fragment::clip`], but a total miss is a parameter error.
    pub fn require_overlap(self, size: CanvasSize) -> StoreResult<Clip> {
        self.clip(size).ok_or_else(|| {
            StoreError::parameter(format!(
                "fragment {}x{} at ({}, {}) lies entirely outside the {}x{} canvas",
                self.width, self.height, self.x, self.y, size.width, size.height
            ))
        })
    }
}

/// A non-empty rectangle of canvas pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn right(self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(self) -> u32 {
        self.y + self.height
    }
}

/// The part of a fragment that overlaps the canvas.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Clip {
    /// Intersection in canvas space.
    pub canvas: PixelRect,
    /// Offset of `canvas.x` within the fragment's local space.
    pub local_x: u32,
    /// Offset of `canvas.y` within the fragment's local space.
    pub local_y: u32,
}

fn positive_side(name: &str, v: i64) -> StoreResult<u32> {
    if v < 1 {
        return Err(StoreError::parameter(format!(
            "fragment {name} must be positive, got {v}"
        )));
    }
    u32::try_from(v)
        .map_err(|_| StoreError::parameter(format!("fragment {name} {v} is too large")))
}

// Half-open overlap of [start, start + len) with [0, limit).
fn clip_axis(start: i64, len: u32, limit: u32) -> Option<(u32, u32)> {
    let lo = start.max(0);
    let hi = start.saturating_add(i64::from(len)).min(i64::from(limit));
    (lo < hi).then(|| (lo as u32, hi as u32))
}
