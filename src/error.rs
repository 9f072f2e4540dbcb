//! Error taxonomy shared by every component of the crate.

use std::io;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type WalbResult<T> = Result<T, WalbError>;

/// Errors produced by the walb core.
///
/// Variants map directly onto the taxonomy of the on-disk format and
/// snapshot engine: each one names the layer that rejected the operation
/// rather than the underlying syscall or parse failure, so callers can match
/// on it without inspecting a message string.
#[derive(Debug, Error)]
pub enum WalbError {
    /// Sector type mismatch, version mismatch, or an invariant violation in
    /// a header or record field (block sizes, lsid ordering, flag
    /// combinations).
    #[error("format error: {0}")]
    Format(String),

    /// A salted checksum that was required to be zero was not.
    #[error("checksum error: {0}")]
    Checksum(String),

    /// The underlying log or data device failed a read or write.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An lsid range violates `lo < hi ≤ MAX_LSID + 1`, or a snapshot name
    /// fails its length/character-class rule.
    #[error("range error: {0}")]
    Range(String),

    /// A snapshot name or id does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A snapshot name is already in use.
    #[error("name in use: {0}")]
    NameInUse(String),

    /// The snapshot metadata region is full (every sector's bitmap is
    /// saturated).
    #[error("no space for new snapshot record")]
    NoSpace,

    /// A precondition the caller was responsible for upholding was violated
    /// (e.g. evicting a dirty sector). This is a programming error, not a
    /// recoverable condition.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl WalbError {
    /// Short machine-stable tag for the error kind, used in CLI diagnostics
    /// (`walbctl: <op>: <kind>: <message>`).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Format(_) => "format",
            Self::Checksum(_) => "checksum",
            Self::Io(_) => "io",
            Self::Range(_) => "range",
            Self::NotFound(_) => "not-found",
            Self::NameInUse(_) => "name-in-use",
            Self::NoSpace => "no-space",
            Self::InvariantViolation(_) => "invariant",
        }
    }
}
