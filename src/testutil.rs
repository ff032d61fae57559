//! Synthetic minimal PE images for tests.
//!
//! The builders produce structurally valid PE32/PE32+ buffers with a single
//! `.text` section; just enough for the detector and patch engine to chew on.

use crate::image::{DOS_MAGIC, PE32PLUS_MAGIC, PE32_MAGIC, PE_SIGNATURE};

/// Recognisable first bytes of the synthetic `.text` section
/// (`push ebp; mov ebp, esp; ret`).
pub const TEXT_PATTERN: &[u8] = &[0x55, 0x8B, 0xEC, 0xC3];

const NUM_DATA_DIRS: u16 = 16;

fn put16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Build a minimal image: DOS header at 0, NT headers at `lfanew`, one
/// `.text` section whose raw data sits at `size_of_headers`.
///
/// Entry point RVA is 0x1000; image base is 0x140000000 (PE32+) or 0x400000
/// (PE32); section/file alignment are 0x1000/0x200; SizeOfImage is 0x2000.
fn build_pe(is64: bool, lfanew: usize, size_of_headers: u32) -> Vec<u8> {
    let coff = lfanew + 4;
    let opt = coff + 20;
    let opt_fixed: u16 = if is64 { 112 } else { 96 };
    let opt_size: u16 = opt_fixed + NUM_DATA_DIRS * 8;
    let table = opt + opt_size as usize;

    let text_raw_ptr = size_of_headers;
    let text_raw_size: u32 = 0x200;
    let mut buf = vec![0u8; (text_raw_ptr + text_raw_size) as usize];

    // DOS header
    put16(&mut buf, 0, DOS_MAGIC);
    put32(&mut buf, 0x3C, lfanew as u32);

    // NT signature + COFF header
    put32(&mut buf, lfanew, PE_SIGNATURE);
    put16(&mut buf, coff, if is64 { 0x8664 } else { 0x014C });
    put16(&mut buf, coff + 2, 1); // NumberOfSections
    put16(&mut buf, coff + 16, opt_size);
    put16(&mut buf, coff + 18, if is64 { 0x0022 } else { 0x0102 });

    // Optional header
    put16(&mut buf, opt, if is64 { PE32PLUS_MAGIC } else { PE32_MAGIC });
    put32(&mut buf, opt + 16, 0x1000); // AddressOfEntryPoint
    if is64 {
        put64(&mut buf, opt + 24, 0x0001_4000_0000); // ImageBase
    } else {
        put32(&mut buf, opt + 28, 0x0040_0000);
    }
    put32(&mut buf, opt + 32, 0x1000); // SectionAlignment
    put32(&mut buf, opt + 36, 0x200); // FileAlignment
    put32(&mut buf, opt + 56, 0x2000); // SizeOfImage
    put32(&mut buf, opt + 60, size_of_headers);
    let nrva_off = opt + if is64 { 108 } else { 92 };
    put32(&mut buf, nrva_off, NUM_DATA_DIRS as u32);

    // Section table: .text
    buf[table..table + 5].copy_from_slice(b".text");
    put32(&mut buf, table + 8, 0x180); // VirtualSize
    put32(&mut buf, table + 12, 0x1000); // VirtualAddress
    put32(&mut buf, table + 16, text_raw_size);
    put32(&mut buf, table + 20, text_raw_ptr);
    put32(&mut buf, table + 36, 0x6000_0020); // CODE | EXECUTE | READ

    let start = text_raw_ptr as usize;
    buf[start..start + TEXT_PATTERN.len()].copy_from_slice(TEXT_PATTERN);
    buf
}

/// Minimal PE32+ image with a roomy header region.
pub fn build_pe64() -> Vec<u8> {
    build_pe(true, 0x100, 0x400)
}

/// Minimal PE32+ image whose header region holds the current section table
/// but has no room for another entry, forcing the engine to shift raw data.
/// The table ends at 0x1E0, so a second 40-byte entry would cross the
/// 0x200-byte header region.
pub fn build_pe64_tight_headers() -> Vec<u8> {
    build_pe(true, 0xB0, 0x200)
}

/// Minimal PE32 image.
pub fn build_pe32() -> Vec<u8> {
    build_pe(false, 0x100, 0x400)
}
