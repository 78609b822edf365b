//! Crate-wide error type.
//!
//! The formats in this crate never retry and never log; every fallible
//! operation returns one of these kinds through [`OxError`] and the caller
//! decides what to do. See `spec.md` §7 for the kind-by-kind contract this
//! enum mirrors.

use thiserror::Error;

/// Errors raised anywhere in the container engine or its format codecs.
#[derive(Debug, Error)]
pub enum OxError {
    /// Caller-supplied value out of its declared domain (bad enum, bad flag
    /// combination, bad settings mismatch on combine).
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A declared offset/length exceeds the buffer or a format limit.
    #[error("out of bounds: {0}")]
    OutOfBounds(String),

    /// On-disk bytes contradict themselves (dangling index, child before
    /// parent, leftover bytes where none are allowed).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Missing key when encryption is declared, AEAD tag mismatch, or a
    /// header CRC32C/SHA-256 mismatch.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Archive path collision, duplicate uniform name, duplicate entrypoint.
    #[error("already defined: {0}")]
    AlreadyDefined(String),

    /// Archive lookup miss.
    #[error("not found: {0}")]
    NotFound(String),

    /// Mutation required on a read-only buffer (in-place decrypt).
    #[error("const data: {0}")]
    ConstData(String),

    /// Arithmetic during size accounting exceeds the 48-bit buffer ceiling.
    #[error("overflow: {0}")]
    Overflow(String),

    /// Reserved flag set (compression, AES chunks), or unknown magic/version.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Wraps the underlying I/O error for CLI-level file access.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type OxResult<T> = Result<T, OxError>;
