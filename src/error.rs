//! Error taxonomy for the patching pipeline.
//!
//! Every fatal condition surfaces as one of these kinds; nothing is retried
//! internally and a partial destination file is never produced.

use std::fmt;
use std::io;

/// Errors that can occur while detecting, patching or saving a PE image.
#[derive(Debug)]
pub enum PatchError {
    /// The input lacks a valid DOS/NT signature or a required header
    /// structure is truncated or malformed.
    Format(String),
    /// The optional-header magic matches neither PE32 nor PE32+.
    UnsupportedArch(u16),
    /// The requested new-section name collides with an existing section.
    /// The image is left untouched when this is returned.
    DuplicateSection(String),
    /// The redirect-stub instruction text could not be encoded for the
    /// bound architecture.
    Assembly(String),
    /// The source file is unreadable or the destination is unwritable.
    Io(io::Error),
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchError::Format(msg) => write!(f, "malformed PE image: {msg}"),
            PatchError::UnsupportedArch(magic) => {
                write!(f, "unsupported optional-header magic: 0x{magic:04X}")
            }
            PatchError::DuplicateSection(name) => {
                write!(f, "section '{name}' already exists")
            }
            PatchError::Assembly(msg) => write!(f, "cannot assemble stub: {msg}"),
            PatchError::Io(err) => write!(f, "i/o error: {err}"),
        }
    }
}

impl std::error::Error for PatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PatchError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for PatchError {
    fn from(err: io::Error) -> Self {
        PatchError::Io(err)
    }
}
