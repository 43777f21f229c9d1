use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Context as _;
use image::RgbaImage;

use crate::{
    copier::ParallelCopier,
    foundation::{
        error::{StoreError, StoreResult},
        geom::{CanvasId, CanvasSize, Fragment},
    },
    raster::codec,
    store::{
        canvas::{Canvas, UpdateStrategy},
        config::StoreConfig,
        discard,
    },
};

const CANVAS_EXT: &str = "bmp";
const PENDING_PREFIX: &str = ".pending-";

/// Owns id allocation and the id → canvas mapping for one storage root.
///
/// Construct once and share (`Arc<Registry>`); every method takes `&self`.
#[derive(Debug)]
pub struct Registry {
    config: StoreConfig,
    copier: ParallelCopier,
    state: Mutex<RegistryState>,
    pending: AtomicU64,
}

#[derive(Debug, Default)]
struct RegistryState {
    next_id: u64,
    canvases: HashMap<CanvasId, Arc<Canvas>>,
}

impl Registry {
    /// Validate `config`, create the storage root and clear leftovers of interrupted writes.
    ///
    /// Canvas files left by an earlier run are registered again under their ids, and new ids
    /// continue after the largest id found on disk.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.storage_root).with_context(|| {
            format!(
                "create storage root '{}'",
                config.storage_root.display()
            )
        })?;
        remove_stale_temporaries(&config.storage_root)?;
        let state = recover_canvases(&config.storage_root)?;

        let copier = ParallelCopier::new(config.copy_workers, config.threads)?;
        tracing::debug!(
            root = %config.storage_root.display(),
            live = state.canvases.len(),
            next_id = state.next_id,
            ?copier,
            "opened canvas registry"
        );
        Ok(Self {
            config,
            copier,
            state: Mutex::new(state),
            pending: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn canvas_path(&self, id: CanvasId) -> PathBuf {
        self.config
            .storage_root
            .join(format!("{id}.{CANVAS_EXT}"))
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a blank canvas and return its id.
    ///
    /// The blank file is written under a temporary name before an id is taken, so a failed
    /// write consumes no id and the canvas becomes visible only once fully on disk.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn create(&self, width: i64, height: i64) -> StoreResult<CanvasId> {
        let size = CanvasSize::new(width, height)?;

        let tmp = self.config.storage_root.join(format!(
            "{PENDING_PREFIX}{}.{CANVAS_EXT}",
            self.pending.fetch_add(1, Ordering::Relaxed)
        ));
        if let Err(e) = codec::write_blank_canvas(&tmp, size) {
            discard(&tmp);
            return Err(e);
        }

        let id = {
            let mut st = self.state();
            let id = CanvasId(st.next_id);
            st.next_id += 1;
            id
        };
        let path = self.canvas_path(id);
        if let Err(e) = std::fs::rename(&tmp, &path) {
            discard(&tmp);
            return Err(anyhow::Error::new(e)
                .context(format!("move new canvas into '{}'", path.display()))
                .into());
        }

        let canvas = Arc::new(Canvas::new(id, size, path));
        self.state().canvases.insert(id, canvas);
        tracing::debug!(%id, width = size.width, height = size.height, "created canvas");
        Ok(id)
    }

    /// Resolve a live canvas.
    pub fn get(&self, id: CanvasId) -> StoreResult<Arc<Canvas>> {
        self.state()
            .canvases
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    /// Ids of all live canvases, ascending.
    pub fn live_ids(&self) -> Vec<CanvasId> {
        let mut ids: Vec<_> = self.state().canvases.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Overwrite the in-bounds part of a fragment with an encoded bitmap payload.
    pub fn update_fragment(
        &self,
        id: CanvasId,
        x: i64,
        y: i64,
        width: i64,
        height: i64,
        payload: &[u8],
    ) -> StoreResult<()> {
        let frag = Fragment::new(x, y, width, height)?;
        let canvas = self.get(id)?;
        frag.require_overlap(canvas.size())?;
        let src = codec::decode_image(payload)?;
        self.apply_update(&canvas, frag, &src)
    }

    /// Like [`Registry::update_fragment`], with already decoded source pixels.
    pub fn update_fragment_pixels(
        &self,
        id: CanvasId,
        frag: Fragment,
        src: &RgbaImage,
    ) -> StoreResult<()> {
        let canvas = self.get(id)?;
        self.apply_update(&canvas, frag, src)
    }

    fn apply_update(&self, canvas: &Canvas, frag: Fragment, src: &RgbaImage) -> StoreResult<()> {
        let strategy = UpdateStrategy::for_size(canvas.size(), self.config.whole_buffer_limit);
        canvas.update(&self.copier, strategy, frag, src)
    }

    /// Read a fragment and encode it as a bitmap. Out-of-bounds pixels are opaque black.
    pub fn read_fragment(
        &self,
        id: CanvasId,
        x: i64,
        y: i64,
        width: i64,
        height: i64,
    ) -> StoreResult<Vec<u8>> {
        let pixels = self.read_fragment_pixels(id, x, y, width, height)?;
        Ok(codec::encode_image(&pixels))
    }

    pub fn read_fragment_pixels(
        &self,
        id: CanvasId,
        x: i64,
        y: i64,
        width: i64,
        height: i64,
    ) -> StoreResult<RgbaImage> {
        let frag = Fragment::for_read(x, y, width, height)?;
        let canvas = self.get(id)?;
        canvas.read(&self.copier, frag)
    }

    /// Delete a canvas and its file. The id is never handed out again.
    pub fn delete(&self, id: CanvasId) -> StoreResult<()> {
        let canvas = self.get(id)?;
        canvas.delete()?;
        self.state().canvases.remove(&id);
        tracing::debug!(%id, "deleted canvas");
        Ok(())
    }
}

fn remove_stale_temporaries(root: &Path) -> StoreResult<()> {
    let entries =
        std::fs::read_dir(root).with_context(|| format!("list storage root '{}'", root.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("list storage root '{}'", root.display()))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(PENDING_PREFIX) || name.ends_with(".bmp.tmp") {
            tracing::debug!(file = %name, "removing stale temporary canvas");
            discard(&entry.path());
        }
    }
    Ok(())
}

// Re-register `<id>.bmp` files. Files whose header does not check out stay on disk untouched
// but are not served; their ids are still never handed out again.
fn recover_canvases(root: &Path) -> StoreResult<RegistryState> {
    let mut state = RegistryState::default();
    let entries =
        std::fs::read_dir(root).with_context(|| format!("list storage root '{}'", root.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("list storage root '{}'", root.display()))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(CANVAS_EXT) {
            continue;
        }
        // Only canonical names: "007.bmp" is not canvas 7.
        let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok().filter(|n| n.to_string() == s))
            .map(CanvasId)
        else {
            continue;
        };
        state.next_id = state.next_id.max(id.0.saturating_add(1));

        let size = std::fs::File::open(&path)
            .with_context(|| format!("open canvas '{}'", path.display()))
            .map_err(StoreError::from)
            .and_then(|mut file| codec::read_header(&mut file));
        match size {
            Ok(size) => {
                tracing::debug!(%id, width = size.width, height = size.height, "recovered canvas");
                state.canvases.insert(id, Arc::new(Canvas::new(id, size, path)));
            }
            Err(err) => {
                tracing::warn!(%id, path = %path.display(), %err, "skipping unreadable canvas file");
            }
        }
    }
    Ok(state)
}
