//! Chartographer is a storage engine for very large bitmap canvases.
//!
//! Canvases (up to 20000×50000 pixels) live on disk, one bitmap file each, and are never held
//! in memory as a whole unless they are small. Clients create a canvas, then write and read
//! axis-aligned fragments that may hang over any edge:
//!
//! - **Update** overwrites only the in-bounds part of a fragment.
//! - **Read** returns the fragment with opaque black wherever it leaves the canvas.
//! - A fragment that misses the canvas entirely is a parameter error.
//!
//! # Layers
//!
//! 1. [`raster::codec`]: the on-disk bitmap layout and offset-addressed pixel I/O.
//! 2. [`foundation::geom`]: size limits, fragment validation and clipping.
//! 3. [`copier`]: splits pixel copies into disjoint chunks run on a rayon pool.
//! 4. [`store`]: the per-canvas lock discipline and the id registry.
//! 5. [`protocol`]: transport-neutral requests and responses.
#![forbid(unsafe_code)]

pub mod copier;
pub mod foundation;
pub mod protocol;
pub mod raster;
pub mod store;

pub use crate::copier::ParallelCopier;
pub use crate::foundation::error::{ErrorKind, StoreError, StoreResult};
pub use crate::foundation::geom::{
    CanvasId, CanvasSize, Clip, Fragment, MAX_CANVAS_HEIGHT, MAX_CANVAS_WIDTH, MAX_READ_SIDE,
    PixelRect,
};
pub use crate::protocol::{Request, Response, Service};
pub use crate::store::canvas::{Canvas, UpdateStrategy};
pub use crate::store::config::StoreConfig;
pub use crate::store::registry::Registry;
