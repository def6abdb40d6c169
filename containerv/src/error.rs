//! Error types for containerv operations.

/// Alias for `Result<T, containerv::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by container engine operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A supplied path contained a `..` segment or was otherwise unusable.
    #[error("invalid path '{0}'")]
    InvalidPath(String),

    /// The layer vector was rejected before any filesystem work.
    #[error("invalid layer: {0}")]
    InvalidLayer(String),

    /// Spawn option validation failed.
    #[error("invalid spawn options: {0}")]
    InvalidSpawn(String),

    /// An unknown policy plugin name was supplied.
    #[error("unknown policy plugin '{0}'")]
    UnknownPlugin(String),

    /// An OS-level call failed during container setup or teardown.
    #[error("{op}: {source}")]
    Os {
        /// The operation that failed.
        op: &'static str,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The shared BPF map is out of entries for a new container.
    #[error("bpf map exhausted ({capacity} containers)")]
    BpfExhausted {
        /// Total map capacity, in containers.
        capacity: usize,
    },

    /// The container backend reported an unusable handle or protocol state.
    #[error("backend: {0}")]
    Backend(String),

    /// An I/O error outside a specific OS call.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// `config.json` synthesis or argument parsing failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wraps an OS error with the name of the failing operation.
    pub fn os(op: &'static str, source: impl Into<std::io::Error>) -> Self {
        Self::Os {
            op,
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn os_accepts_an_errno_without_annotation() {
        let err = Error::os("fork", nix::errno::Errno::EAGAIN);
        assert!(matches!(err, Error::Os { op: "fork", .. }));
    }

    #[test]
    fn os_accepts_an_io_error() {
        let err = Error::os("open", std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(err.to_string(), "open: entity not found");
    }
}
