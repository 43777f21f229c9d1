use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use anyhow::Context as _;

use crate::{
    copier::DEFAULT_CHUNKS,
    foundation::error::{StoreError, StoreResult},
};

/// Engine configuration, loadable from JSON.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Directory holding one `<id>.bmp` file per live canvas.
    pub storage_root: PathBuf,
    /// Number of chunks each pixel copy is split into.
    pub copy_workers: usize,
    /// Size of the copier's rayon pool. `None` uses rayon's default.
    pub threads: Option<usize>,
    /// Canvases with at most this many pixel bytes are rewritten whole and swapped in
    /// atomically on update; larger canvases are patched in place.
    pub whole_buffer_limit: u64,
    /// Requests the line service executes at once. `1` keeps strict arrival order.
    pub request_workers: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("data"),
            copy_workers: DEFAULT_CHUNKS,
            threads: None,
            whole_buffer_limit: 64 * 1024 * 1024,
            request_workers: 1,
        }
    }
}

impl StoreConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: root.into(),
            ..Self::default()
        }
    }

    pub fn from_path(path: &Path) -> StoreResult<Self> {
        let f = File::open(path).with_context(|| format!("open config '{}'", path.display()))?;
        let cfg: Self = serde_json::from_reader(BufReader::new(f))
            .map_err(|e| StoreError::parameter(format!("parse config '{}': {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.storage_root.as_os_str().is_empty() {
            return Err(StoreError::parameter("storage_root must not be empty"));
        }
        if self.copy_workers == 0 {
            return Err(StoreError::parameter("copy_workers must be >= 1"));
        }
        if self.request_workers == 0 {
            return Err(StoreError::parameter("request_workers must be >= 1"));
        }
        if self.threads == Some(0) {
            return Err(StoreError::parameter("threads must be >= 1 when set"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg: StoreConfig = serde_json::from_str(r#"{"storage_root":"/srv/charts"}"#).unwrap();
        assert_eq!(cfg.storage_root, PathBuf::from("/srv/charts"));
        assert_eq!(cfg.copy_workers, 10);
        assert_eq!(cfg.threads, None);
        assert_eq!(cfg.request_workers, 1);
        cfg.validate().unwrap();
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<StoreConfig>(r#"{"port":8080}"#).is_err());
    }

    #[test]
    fn validate_rejects_zero_workers_and_threads() {
        let mut cfg = StoreConfig::with_root("x");
        cfg.copy_workers = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = StoreConfig::with_root("x");
        cfg.threads = Some(0);
        assert!(cfg.validate().is_err());

        let mut cfg = StoreConfig::with_root("x");
        cfg.request_workers = 0;
        assert!(cfg.validate().is_err());

        assert!(StoreConfig::with_root("").validate().is_err());
    }

    #[test]
    fn from_path_reads_json_file() {
        let path = std::env::temp_dir().join(format!(
            "chartographer_config_{}_{}.json",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::write(
            &path,
            r#"{"storage_root":"charts","copy_workers":4,"threads":2}"#,
        )
        .unwrap();

        let cfg = StoreConfig::from_path(&path).unwrap();
        assert_eq!(cfg.copy_workers, 4);
        assert_eq!(cfg.threads, Some(2));
        assert_eq!(cfg.whole_buffer_limit, StoreConfig::default().whole_buffer_limit);

        std::fs::remove_file(&path).ok();
        assert!(matches!(
            StoreConfig::from_path(&path),
            Err(StoreError::Storage(_))
        ));
    }
}
