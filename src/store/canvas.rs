use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use anyhow::Context as _;
use image::RgbaImage;

use crate::{
    copier::ParallelCopier,
    foundation::{
        error::{StoreError, StoreResult},
        geom::{CanvasId, CanvasSize, Clip, Fragment},
    },
    raster::codec::{self, BLACK, BYTES_PER_PIXEL},
    store::discard,
};

/// How an update reaches the backing file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateStrategy {
    /// Decode the whole canvas, patch it in memory, write a temp file and rename it over the
    /// canvas file. Readers never observe a half-written canvas.
    WholeBuffer,
    /// Write only the clipped rows in place through offset-addressed spans.
    InPlace,
}

impl UpdateStrategy {
    pub fn for_size(size: CanvasSize, whole_buffer_limit: u64) -> Self {
        if codec::pixel_data_len(size) <= whole_buffer_limit {
            Self::WholeBuffer
        } else {
            Self::InPlace
        }
    }
}

/// One canvas and its backing file.
///
/// Every operation holds `state` for its whole duration, so operations on the same canvas are
/// strictly one at a time while different canvases never contend.
#[derive(Debug)]
pub struct Canvas {
    id: CanvasId,
    size: CanvasSize,
    path: PathBuf,
    state: Mutex<CanvasState>,
}

#[derive(Debug)]
struct CanvasState {
    exists: bool,
}

impl Canvas {
    pub(crate) fn new(id: CanvasId, size: CanvasSize, path: PathBuf) -> Self {
        Self {
            id,
            size,
            path,
            state: Mutex::new(CanvasState { exists: true }),
        }
    }

    pub fn id(&self) -> CanvasId {
        self.id
    }

    pub fn size(&self) -> CanvasSize {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.state().exists
    }

    // The guarded state is a single flag; a panic elsewhere cannot leave it inconsistent.
    fn state(&self) -> MutexGuard<'_, CanvasState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_live(&self) -> StoreResult<MutexGuard<'_, CanvasState>> {
        let guard = self.state();
        if !guard.exists {
            return Err(StoreError::NotFound(self.id));
        }
        Ok(guard)
    }

    #[tracing::instrument(level = "debug", skip(self, copier, src), fields(id = %self.id))]
    pub(crate) fn update(
        &self,
        copier: &ParallelCopier,
        strategy: UpdateStrategy,
        frag: Fragment,
        src: &RgbaImage,
    ) -> StoreResult<()> {
        if src.dimensions() != (frag.width, frag.height) {
            return Err(StoreError::parameter(format!(
                "payload is {}x{}, fragment declares {}x{}",
                src.width(),
                src.height(),
                frag.width,
                frag.height
            )));
        }
        let clip = frag.require_overlap(self.size)?;

        let _guard = self.lock_live()?;
        tracing::debug!(?strategy, ?clip, "updating canvas");
        match strategy {
            UpdateStrategy::WholeBuffer => self.update_whole(copier, clip, src),
            UpdateStrategy::InPlace => self.update_in_place(copier, clip, src),
        }
    }

    fn update_whole(&self, copier: &ParallelCopier, clip: Clip, src: &RgbaImage) -> StoreResult<()> {
        let mut pixels = {
            let mut file = self.open_read()?;
            codec::decode_region(&mut file, self.size, self.size.full_rect())?
        };

        let canvas_row = self.size.width as usize * BYTES_PER_PIXEL;
        let first = clip.canvas.y as usize * canvas_row;
        let last = clip.canvas.bottom() as usize * canvas_row;
        let buf: &mut [u8] = &mut pixels;
        copier.for_each_band(&mut buf[first..last], canvas_row, |rows, band| {
            for (k, dst_row) in band.chunks_exact_mut(canvas_row).enumerate() {
                let src_y = clip.local_y + rows.start + k as u32;
                let dst = &mut dst_row[clip.canvas.x as usize * BYTES_PER_PIXEL..]
                    [..clip.canvas.width as usize * BYTES_PER_PIXEL];
                copy_opaque(dst, source_span(src, clip, src_y, 0..clip.canvas.width));
            }
            Ok(())
        })?;

        let tmp = self.path.with_extension("bmp.tmp");
        let written = codec::write_canvas(&tmp, &pixels).and_then(|()| {
            std::fs::rename(&tmp, &self.path)
                .with_context(|| format!("replace canvas '{}'", self.path.display()))
                .map_err(StoreError::from)
        });
        if written.is_err() {
            discard(&tmp);
        }
        written
    }

    fn update_in_place(
        &self,
        copier: &ParallelCopier,
        clip: Clip,
        src: &RgbaImage,
    ) -> StoreResult<()> {
        drop(self.open_read()?);

        // Column chunks: each worker owns a disjoint x range of every clipped row.
        copier.for_each_chunk(clip.canvas.width, |cols| {
            let mut file = OpenOptions::new()
                .write(true)
                .open(&self.path)
                .with_context(|| format!("open canvas '{}' for writing", self.path.display()))?;
            for j in 0..clip.canvas.height {
                codec::write_span(
                    &mut file,
                    self.size,
                    clip.canvas.x + cols.start,
                    clip.canvas.y + j,
                    source_span(src, clip, clip.local_y + j, cols.clone()),
                )?;
            }
            file.sync_data()
                .with_context(|| format!("sync canvas '{}'", self.path.display()))?;
            Ok(())
        })
    }

    #[tracing::instrument(level = "debug", skip(self, copier), fields(id = %self.id))]
    pub(crate) fn read(&self, copier: &ParallelCopier, frag: Fragment) -> StoreResult<RgbaImage> {
        let clip = frag.require_overlap(self.size)?;

        let _guard = self.lock_live()?;
        drop(self.open_read()?);

        let mut out = RgbaImage::from_pixel(frag.width, frag.height, BLACK);
        let out_row = frag.width as usize * BYTES_PER_PIXEL;
        let first = clip.local_y as usize * out_row;
        let last = (clip.local_y + clip.canvas.height) as usize * out_row;
        let buf: &mut [u8] = &mut out;
        copier.for_each_band(&mut buf[first..last], out_row, |rows, band| {
            let mut file = self.open_raw()?;
            for (k, row) in band.chunks_exact_mut(out_row).enumerate() {
                let dst = &mut row[clip.local_x as usize * BYTES_PER_PIXEL..]
                    [..clip.canvas.width as usize * BYTES_PER_PIXEL];
                let y = clip.canvas.y + rows.start + k as u32;
                codec::read_span(&mut file, self.size, clip.canvas.x, y, dst)?;
            }
            Ok(())
        })?;
        Ok(out)
    }

    /// Remove the backing file and mark the canvas gone. Fails with `NotFound` once deleted.
    ///
    /// A backing file that has already vanished counts as removed.
    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.id))]
    pub(crate) fn delete(&self) -> StoreResult<()> {
        let mut guard = self.lock_live()?;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %self.path.display(), "canvas file was already missing");
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("remove canvas '{}'", self.path.display()))
                    .into());
            }
        }
        guard.exists = false;
        Ok(())
    }

    fn open_raw(&self) -> StoreResult<File> {
        Ok(File::open(&self.path)
            .with_context(|| format!("open canvas '{}'", self.path.display()))?)
    }

    // Open for reading and check the header still describes this canvas.
    fn open_read(&self) -> StoreResult<File> {
        let mut file = self.open_raw()?;
        let found = codec::read_header(&mut file)?;
        if found != self.size {
            return Err(StoreError::storage(format!(
                "canvas '{}' is {}x{} on disk, expected {}x{}",
                self.path.display(),
                found.width,
                found.height,
                self.size.width,
                self.size.height
            )));
        }
        Ok(file)
    }
}

// Source bytes for fragment row `src_y`, restricted to clip-relative columns `cols`.
fn source_span(src: &RgbaImage, clip: Clip, src_y: u32, cols: std::ops::Range<u32>) -> &[u8] {
    let row = src.width() as usize * BYTES_PER_PIXEL;
    let start = src_y as usize * row + (clip.local_x + cols.start) as usize * BYTES_PER_PIXEL;
    &src.as_raw()[start..start + cols.len() * BYTES_PER_PIXEL]
}

fn copy_opaque(dst: &mut [u8], src: &[u8]) {
    dst.copy_from_slice(src);
    for px in dst.chunks_exact_mut(BYTES_PER_PIXEL) {
        px[3] = 0xFF;
    }
}
