use crate::foundation::geom::CanvasId;

pub type StoreResult<T> = Result<T, StoreError>;

/// Error taxonomy surfaced by every engine operation.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Caller-supplied dimensions or fragment geometry are invalid. Always raised before any I/O.
    #[error("parameter error: {0}")]
    Parameter(String),

    /// The canvas id was never issued or has been deleted.
    #[error("canvas {0} not found")]
    NotFound(CanvasId),

    /// Underlying file I/O failed or a canvas file is corrupt.
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Stable discriminant of a [`StoreError`], for transports that map errors to status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Parameter,
    NotFound,
    Storage,
}

impl StoreError {
    pub fn parameter(msg: impl Into<String>) -> Self {
        Self::Parameter(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(anyhow::anyhow!(msg.into()))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parameter(_) => ErrorKind::Parameter,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(anyhow::Error::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_are_stable() {
        assert!(
            StoreError::parameter("x")
                .to_string()
                .contains("parameter error:")
        );
        assert_eq!(
            StoreError::NotFound(CanvasId(7)).to_string(),
            "canvas 7 not found"
        );
        assert!(
            StoreError::storage("x")
                .to_string()
                .contains("storage error:")
        );
    }

    #[test]
    fn storage_preserves_io_source_and_context() {
        use anyhow::Context as _;

        let base = std::io::Error::other("disk on fire");
        let err: StoreError = Err::<(), _>(base)
            .context("write canvas '3.bmp'")
            .unwrap_err()
            .into();
        let msg = err.to_string();
        assert!(msg.contains("write canvas '3.bmp'"));
        assert!(msg.contains("disk on fire"));
        assert_eq!(err.kind(), ErrorKind::Storage);
    }

    #[test]
    fn kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::NotFound).unwrap(),
            "\"not_found\""
        );
        assert_eq!(
            StoreError::parameter("bad").kind(),
            ErrorKind::Parameter
        );
    }
}
