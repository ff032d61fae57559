//! Architecture detection.
//!
//! Classifies a PE file as 32-bit, 64-bit or unrecognized by reading only
//! the DOS header and the first few bytes of the NT headers.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::PatchError;
use crate::image::{DOS_MAGIC, PE32PLUS_MAGIC, PE32_MAGIC, PE_SIGNATURE};

/// The closed set of architecture variants the patcher knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeArch {
    /// PE32, 32-bit optional header.
    X86,
    /// PE32+, 64-bit optional header.
    X64,
    /// Not a PE, or an optional-header shape we do not support.
    Unknown,
}

impl std::fmt::Display for PeArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeArch::X86 => write!(f, "x86"),
            PeArch::X64 => write!(f, "x64"),
            PeArch::Unknown => write!(f, "unknown"),
        }
    }
}

/// Classify the file at `path`.
///
/// An unreadable path is an [`PatchError::Io`]; a file that is too short,
/// lacks the `MZ`/`PE\0\0` signatures, or carries an unrecognized
/// optional-header magic yields [`PeArch::Unknown`] rather than an error.
/// Callers treat `Unknown` as unsupported and abort.
pub fn detect_arch<P: AsRef<Path>>(path: P) -> Result<PeArch, PatchError> {
    let mut file = File::open(path)?;

    let mut dos = [0u8; 0x40];
    if file.read_exact(&mut dos).is_err() {
        return Ok(PeArch::Unknown);
    }
    if u16::from_le_bytes([dos[0], dos[1]]) != DOS_MAGIC {
        return Ok(PeArch::Unknown);
    }
    let e_lfanew = u32::from_le_bytes([dos[0x3C], dos[0x3D], dos[0x3E], dos[0x3F]]);

    file.seek(SeekFrom::Start(e_lfanew as u64))?;
    // Signature (4) + COFF header (20) + optional-header magic (2).
    let mut nt = [0u8; 26];
    if file.read_exact(&mut nt).is_err() {
        return Ok(PeArch::Unknown);
    }
    if u32::from_le_bytes([nt[0], nt[1], nt[2], nt[3]]) != PE_SIGNATURE {
        return Ok(PeArch::Unknown);
    }

    let magic = u16::from_le_bytes([nt[24], nt[25]]);
    Ok(match magic {
        PE32_MAGIC => PeArch::X86,
        PE32PLUS_MAGIC => PeArch::X64,
        _ => PeArch::Unknown,
    })
}
