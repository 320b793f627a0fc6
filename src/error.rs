use std::io;
use std::sync::PoisonError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    InvalidHeader,
    Decode(&'static str, io::Error),
    Encode(&'static str, io::Error),
    CorruptedWal(String),
    ChecksumMismatch,
    InvalidWalMagic,
    UnsupportedVersion(u32),
    MutexPoisoned,
    ReadError(&'static str, io::Error),
    WriteError(&'static str, io::Error),
    IndexCorruption(String),
    InvalidData(String),
    LockError(io::Error),
    Compression(String),
    InvalidState(String),
    InvalidOperation(String),
    InvalidInput(String),
    SchemaMismatch(String),
    Conflict(String),
    Malfunction(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl Error {
    /// Errors that leave on-disk state in doubt and must take the engine down.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            Error::IoError(_) | Error::ReadError(..) | Error::WriteError(..)
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::InvalidHeader => write!(f, "Invalid header"),
            Error::Decode(field, err) => write!(f, "Failed to decode {}: {}", field, err),
            Error::Encode(field, err) => write!(f, "Failed to encode {}: {}", field, err),
            Error::CorruptedWal(msg) => write!(f, "Corrupted WAL: {}", msg),
            Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Error::InvalidWalMagic => write!(f, "Invalid WAL magic"),
            Error::UnsupportedVersion(v) => write!(f, "Unsupported storage version: {}", v),
            Error::MutexPoisoned => write!(f, "Mutex was poisoned"),
            Error::ReadError(context, err) => write!(f, "Failed to read {}: {}", context, err),
            Error::WriteError(context, err) => write!(f, "Failed to write {}: {}", context, err),
            Error::IndexCorruption(msg) => write!(f, "Index corruption: {}", msg),
            Error::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
            Error::LockError(err) => write!(f, "Lock error: {}", err),
            Error::Compression(msg) => write!(f, "Compression error: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Error::SchemaMismatch(msg) => write!(f, "Schema mismatch: {}", msg),
            Error::Conflict(msg) => write!(f, "Transaction conflict: {}", msg),
            Error::Malfunction(msg) => write!(f, "Engine malfunction: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
