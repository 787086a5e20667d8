//! Error types for the link pipeline

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
/// Error type for hard failures during a link. Recoverable conditions are
/// reported through [`crate::diag::DiagnosticEngine`] instead; an `Error`
/// aborts the current phase.
pub enum Error {
    #[error("An I/O error occurred on {path}: {kind}")]
    /// Reading an input or writing the image failed
    Io {
        /// Path of the file being read or written
        path: String,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
    },
    #[error("{path}: {reason}")]
    /// An input file is missing, truncated, or of the wrong format
    Input {
        /// Path of the offending input
        path: String,
        /// What was wrong with it
        reason: String,
    },
    #[error("Invalid configuration: {reason}")]
    /// The configuration is internally inconsistent with the inputs or script
    Config {
        /// Description of the inconsistency
        reason: String,
    },
    #[error("Cannot resolve symbol {symbol}: {reason}")]
    /// Symbol resolution failed in a way the override rules cannot express
    Resolution {
        /// The symbol name
        symbol: String,
        /// Why the old and new symbols are incompatible
        reason: String,
    },
    #[error("Relocation {name} against {symbol}: {reason}")]
    /// A relocation could not be scanned or applied
    Relocation {
        /// Target-specific relocation name
        name: String,
        /// Name of the referenced symbol
        symbol: String,
        /// What went wrong
        reason: String,
    },
    #[error("Layout failed: {reason}")]
    /// Section layout or address assignment failed
    Layout {
        /// Description of the failure
        reason: String,
    },
    #[error("Link aborted: {errors} error(s) reported")]
    /// The diagnostic engine accumulated errors; the driver refuses to write
    Aborted {
        /// Number of errors reported before the abort
        errors: usize,
    },
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build an [`Error::Io`] from a path and a raw I/O error
    pub fn io(path: impl Into<String>, err: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            kind: err.kind(),
        }
    }

    /// Build an [`Error::Input`] from a path and a reason
    pub fn input(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Input {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
