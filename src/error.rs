use std::fmt;

/// Error kinds shared across the crate, matching the vocabulary every
/// component reports against. Individual components return their own
/// narrower enum and convert into this one at the public boundary, the
/// same layering `pmtorrent`'s `FileError -> RepoError` used.
#[derive(Debug)]
pub enum Error {
    InvalidArg(String),
    OutOfRange(String),
    Io(std::io::Error),
    CorruptFooter(String),
    VersionMismatch { found: u32, expected: u32 },
    GeometryMismatch(String),
    RefTreeMissing,
    VerifyFailed { chunk_index: u32 },
    DownloadFailed { start: u64, end: u64 },
    NotIntact { chunk_index: u32 },
    UseAfterRelease,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArg(msg) => write!(f, "invalid argument: {msg}"),
            Error::OutOfRange(msg) => write!(f, "out of range: {msg}"),
            Error::Io(e) => write!(f, "io error: {e}"),
            Error::CorruptFooter(msg) => write!(f, "corrupt footer: {msg}"),
            Error::VersionMismatch { found, expected } => {
                write!(f, "version mismatch: found {found}, expected {expected}")
            }
            Error::GeometryMismatch(msg) => write!(f, "geometry mismatch: {msg}"),
            Error::RefTreeMissing => write!(f, "reference tree is missing"),
            Error::VerifyFailed { chunk_index } => {
                write!(f, "chunk {chunk_index} failed verification")
            }
            Error::DownloadFailed { start, end } => {
                write!(f, "download failed for range [{start}, {end})")
            }
            Error::NotIntact { chunk_index } => write!(f, "chunk {chunk_index} is not intact"),
            Error::UseAfterRelease => write!(f, "use of a pool object after its scope released it"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Errors returned by [`crate::geometry`]. Pure, programmer-facing: these
/// are never recovered from, only propagated.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum GeometryError {
    InvalidArg(String),
    OutOfRange(String),
}

impl fmt::Display for GeometryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeometryError::InvalidArg(msg) => write!(f, "invalid argument: {msg}"),
            GeometryError::OutOfRange(msg) => write!(f, "out of range: {msg}"),
        }
    }
}

impl std::error::Error for GeometryError {}

impl From<GeometryError> for Error {
    fn from(e: GeometryError) -> Self {
        match e {
            GeometryError::InvalidArg(m) => Error::InvalidArg(m),
            GeometryError::OutOfRange(m) => Error::OutOfRange(m),
        }
    }
}

/// Errors returned by [`crate::merkle`].
#[derive(Debug)]
pub enum MerkleError {
    InvalidArg(String),
    OutOfRange(String),
    Io(std::io::Error),
    CorruptFooter(String),
    VersionMismatch { found: u32, expected: u32 },
}

impl fmt::Display for MerkleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MerkleError::InvalidArg(msg) => write!(f, "invalid argument: {msg}"),
            MerkleError::OutOfRange(msg) => write!(f, "out of range: {msg}"),
            MerkleError::Io(e) => write!(f, "io error: {e}"),
            MerkleError::CorruptFooter(msg) => write!(f, "corrupt footer: {msg}"),
            MerkleError::VersionMismatch { found, expected } => {
                write!(f, "version mismatch: found {found}, expected {expected}")
            }
        }
    }
}

impl std::error::Error for MerkleError {}

impl From<std::io::Error> for MerkleError {
    fn from(e: std::io::Error) -> Self {
        MerkleError::Io(e)
    }
}

impl From<GeometryError> for MerkleError {
    fn from(e: GeometryError) -> Self {
        match e {
            GeometryError::InvalidArg(m) => MerkleError::InvalidArg(m),
            GeometryError::OutOfRange(m) => MerkleError::OutOfRange(m),
        }
    }
}

impl From<MerkleError> for Error {
    fn from(e: MerkleError) -> Self {
        match e {
            MerkleError::InvalidArg(m) => Error::InvalidArg(m),
            MerkleError::OutOfRange(m) => Error::OutOfRange(m),
            MerkleError::Io(e) => Error::Io(e),
            MerkleError::CorruptFooter(m) => Error::CorruptFooter(m),
            MerkleError::VersionMismatch { found, expected } => {
                Error::VersionMismatch { found, expected }
            }
        }
    }
}

/// Errors returned by [`crate::pane`].
#[derive(Debug)]
pub enum PaneError {
    Merkle(MerkleError),
    Io(std::io::Error),
    GeometryMismatch(String),
    RefTreeMissing,
    VerifyFailed { chunk_index: u32 },
    NotIntact { chunk_index: u32 },
    InvalidArg(String),
}

impl fmt::Display for PaneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaneError::Merkle(e) => write!(f, "{e}"),
            PaneError::Io(e) => write!(f, "io error: {e}"),
            PaneError::GeometryMismatch(msg) => write!(f, "geometry mismatch: {msg}"),
            PaneError::RefTreeMissing => write!(f, "reference tree is missing"),
            PaneError::VerifyFailed { chunk_index } => {
                write!(f, "chunk {chunk_index} failed verification")
            }
            PaneError::NotIntact { chunk_index } => write!(f, "chunk {chunk_index} is not intact"),
            PaneError::InvalidArg(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

impl std::error::Error for PaneError {}

impl From<MerkleError> for PaneError {
    fn from(e: MerkleError) -> Self {
        match e {
            MerkleError::Io(e) => PaneError::Io(e),
            other => PaneError::Merkle(other),
        }
    }
}

impl From<std::io::Error> for PaneError {
    fn from(e: std::io::Error) -> Self {
        PaneError::Io(e)
    }
}

impl From<GeometryError> for PaneError {
    fn from(e: GeometryError) -> Self {
        match e {
            GeometryError::InvalidArg(m) => PaneError::InvalidArg(m),
            GeometryError::OutOfRange(m) => PaneError::InvalidArg(m),
        }
    }
}

impl From<PaneError> for Error {
    fn from(e: PaneError) -> Self {
        match e {
            PaneError::Merkle(e) => e.into(),
            PaneError::Io(e) => Error::Io(e),
            PaneError::GeometryMismatch(m) => Error::GeometryMismatch(m),
            PaneError::RefTreeMissing => Error::RefTreeMissing,
            PaneError::VerifyFailed { chunk_index } => Error::VerifyFailed { chunk_index },
            PaneError::NotIntact { chunk_index } => Error::NotIntact { chunk_index },
            PaneError::InvalidArg(m) => Error::InvalidArg(m),
        }
    }
}

/// Errors returned by [`crate::pool`].
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum PoolError {
    InvalidArg(String),
    UseAfterRelease,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::InvalidArg(msg) => write!(f, "invalid argument: {msg}"),
            PoolError::UseAfterRelease => write!(f, "use of a pool object after its scope released it"),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<PoolError> for Error {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::InvalidArg(m) => Error::InvalidArg(m),
            PoolError::UseAfterRelease => Error::UseAfterRelease,
        }
    }
}

/// Errors surfaced by [`crate::painter`]. `VerifyFailed` and
/// `DownloadFailed` are per-chunk/per-run and recorded in the
/// [`crate::painter::PaintReport`] rather than aborting the paint future;
/// only `Io` is fatal to the future itself, per the propagation policy.
#[derive(Debug)]
pub enum PaintError {
    Pane(PaneError),
    Io(std::io::Error),
}

impl fmt::Display for PaintError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaintError::Pane(e) => write!(f, "{e}"),
            PaintError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for PaintError {}

impl From<PaneError> for PaintError {
    fn from(e: PaneError) -> Self {
        match e {
            PaneError::Io(e) => PaintError::Io(e),
            other => PaintError::Pane(other),
        }
    }
}

impl From<PaintError> for Error {
    fn from(e: PaintError) -> Self {
        match e {
            PaintError::Pane(e) => e.into(),
            PaintError::Io(e) => Error::Io(e),
        }
    }
}
