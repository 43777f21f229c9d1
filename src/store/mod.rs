pub mod canvas;
pub mod config;
pub mod registry;

use std::path::Path;

// Best-effort removal of a temporary file; a missing file is not worth reporting.
fn discard(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove temporary file");
    }
}
