//! Generic PE patch engine.
//!
//! [`PeImage`] owns the entire executable as one contiguous byte buffer and
//! mutates it in place: header fields and the section table are rewritten
//! through little-endian accessors, and a new section is appended by growing
//! the buffer.  Header offsets are recomputed from the buffer on every
//! access rather than cached, so a structural change (such as relocating the
//! header region) can never leave a stale offset behind.

use std::fs;
use std::path::Path;

use crate::arch::PeArch;
use crate::error::PatchError;

// ---------------------------------------------------------------------------
// Well-known constants
// ---------------------------------------------------------------------------

/// `MZ` -- DOS header magic.
pub const DOS_MAGIC: u16 = 0x5A4D;
/// `PE\0\0` -- NT signature.
pub const PE_SIGNATURE: u32 = 0x0000_4550;

/// Optional-header magic for PE32 (32-bit).
pub const PE32_MAGIC: u16 = 0x010B;
/// Optional-header magic for PE32+ (64-bit).
pub const PE32PLUS_MAGIC: u16 = 0x020B;

/// IMAGE_SCN_CNT_CODE
pub const SCN_CNT_CODE: u32 = 0x0000_0020;
/// IMAGE_SCN_MEM_EXECUTE
pub const SCN_MEM_EXECUTE: u32 = 0x2000_0000;
/// IMAGE_SCN_MEM_READ
pub const SCN_MEM_READ: u32 = 0x4000_0000;

/// Size of one section-table entry.
const SECTION_HEADER_SIZE: usize = 40;
/// Fixed (pre-data-directory) optional header size for each shape.
const OPT_FIXED_PE32: usize = 96;
const OPT_FIXED_PE32PLUS: usize = 112;

// ---------------------------------------------------------------------------
// Little-endian buffer accessors
// ---------------------------------------------------------------------------

fn get_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn get_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn get_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn put_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Round `value` up to the next multiple of `alignment` (a power of two).
/// An alignment of zero leaves the value unchanged; `None` means the rounded
/// value does not fit in 32 bits.
fn align_up(value: u32, alignment: u32) -> Option<u32> {
    if alignment == 0 {
        return Some(value);
    }
    value.checked_add(alignment - 1).map(|v| v & !(alignment - 1))
}

fn arithmetic_overflow(what: &str) -> PatchError {
    PatchError::Format(format!("{what} overflows a 32-bit field"))
}

// ---------------------------------------------------------------------------
// Section descriptor
// ---------------------------------------------------------------------------

/// One decoded entry of the section table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    /// Raw 8-byte name, NUL-padded.
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub characteristics: u32,
}

impl Section {
    /// The section name with trailing NULs stripped.  Names are ASCII in
    /// practice; anything that is not valid UTF-8 renders as `"<invalid>"`.
    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(8);
        std::str::from_utf8(&self.name[..end]).unwrap_or("<invalid>")
    }
}

// ---------------------------------------------------------------------------
// PeImage
// ---------------------------------------------------------------------------

/// Raw file range reserved for the redirect stub by [`PeImage::add_section`].
#[derive(Debug, Clone, Copy)]
struct CodeSlot {
    offset: usize,
    size: usize,
}

/// A loaded PE image, owned for the duration of one patch operation.
#[derive(Debug)]
pub struct PeImage {
    data: Vec<u8>,
    arch: PeArch,
    /// File offset of the `PE\0\0` signature (`e_lfanew`), fixed for the
    /// lifetime of the image.
    pe_offset: usize,
    code_slot: Option<CodeSlot>,
}

impl PeImage {
    /// Read the file at `path` into memory and parse its headers.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<PeImage, PatchError> {
        let data = fs::read(path)?;
        PeImage::from_bytes(data)
    }

    /// Validate the DOS/NT headers of `data` and take ownership of it.
    ///
    /// Fails fast with [`PatchError::Format`] when either signature is
    /// missing or a required structure does not fit in the buffer, and with
    /// [`PatchError::UnsupportedArch`] when the optional-header magic is
    /// neither PE32 nor PE32+.
    pub fn from_bytes(data: Vec<u8>) -> Result<PeImage, PatchError> {
        if data.len() < 0x40 {
            return Err(PatchError::Format(
                "file too small to hold a DOS header".into(),
            ));
        }
        if get_u16(&data, 0) != DOS_MAGIC {
            return Err(PatchError::Format("missing DOS signature (MZ)".into()));
        }

        let pe_offset = get_u32(&data, 0x3C) as usize;
        // Signature + COFF header + optional-header magic must be in range.
        if pe_offset
            .checked_add(4 + 20 + 2)
            .map_or(true, |end| end > data.len())
        {
            return Err(PatchError::Format("NT header lies outside the file".into()));
        }
        if get_u32(&data, pe_offset) != PE_SIGNATURE {
            return Err(PatchError::Format("missing PE signature".into()));
        }

        let coff_offset = pe_offset + 4;
        let opt_offset = coff_offset + 20;
        let magic = get_u16(&data, opt_offset);
        let (arch, opt_fixed) = match magic {
            PE32_MAGIC => (PeArch::X86, OPT_FIXED_PE32),
            PE32PLUS_MAGIC => (PeArch::X64, OPT_FIXED_PE32PLUS),
            other => return Err(PatchError::UnsupportedArch(other)),
        };

        let opt_size = get_u16(&data, coff_offset + 16) as usize;
        if opt_size < opt_fixed || opt_offset + opt_fixed > data.len() {
            return Err(PatchError::Format("optional header is truncated".into()));
        }

        let num_sections = get_u16(&data, coff_offset + 2) as usize;
        let table_offset = opt_offset + opt_size;
        let table_end = table_offset + num_sections * SECTION_HEADER_SIZE;
        if table_end > data.len() {
            return Err(PatchError::Format("section table is truncated".into()));
        }
        // The whole declared header region must be on disk; mutation relies
        // on SizeOfHeaders never pointing past the buffer.
        if get_u32(&data, opt_offset + 60) as usize > data.len() {
            return Err(PatchError::Format(
                "SizeOfHeaders extends past the end of the file".into(),
            ));
        }

        Ok(PeImage {
            data,
            arch,
            pe_offset,
            code_slot: None,
        })
    }

    // -- header geometry ----------------------------------------------------

    fn coff_offset(&self) -> usize {
        self.pe_offset + 4
    }

    fn opt_offset(&self) -> usize {
        self.coff_offset() + 20
    }

    fn section_table_offset(&self) -> usize {
        self.opt_offset() + get_u16(&self.data, self.coff_offset() + 16) as usize
    }

    // -- field accessors (always read from the buffer) -----------------------

    /// The detected architecture variant this image is bound to.
    pub fn arch(&self) -> PeArch {
        self.arch
    }

    /// AddressOfEntryPoint RVA.  Before any mutation this is the original
    /// entry point; after [`add_section`](Self::add_section) it is the RVA
    /// of the injected section.
    pub fn entry_point(&self) -> u32 {
        get_u32(&self.data, self.opt_offset() + 16)
    }

    /// ImageBase, zero-extended to 64 bits for PE32.
    pub fn image_base(&self) -> u64 {
        match self.arch {
            PeArch::X86 => get_u32(&self.data, self.opt_offset() + 28) as u64,
            PeArch::X64 => get_u64(&self.data, self.opt_offset() + 24),
            PeArch::Unknown => unreachable!("PeImage is never constructed for Unknown"),
        }
    }

    pub fn section_alignment(&self) -> u32 {
        get_u32(&self.data, self.opt_offset() + 32)
    }

    pub fn file_alignment(&self) -> u32 {
        get_u32(&self.data, self.opt_offset() + 36)
    }

    pub fn size_of_image(&self) -> u32 {
        get_u32(&self.data, self.opt_offset() + 56)
    }

    pub fn size_of_headers(&self) -> u32 {
        get_u32(&self.data, self.opt_offset() + 60)
    }

    pub fn number_of_sections(&self) -> u16 {
        get_u16(&self.data, self.coff_offset() + 2)
    }

    /// The raw image bytes in their current (possibly mutated) state.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    // -- section table ------------------------------------------------------

    fn section_at(&self, index: usize) -> Section {
        let base = self.section_table_offset() + index * SECTION_HEADER_SIZE;
        let mut name = [0u8; 8];
        name.copy_from_slice(&self.data[base..base + 8]);
        Section {
            name,
            virtual_size: get_u32(&self.data, base + 8),
            virtual_address: get_u32(&self.data, base + 12),
            size_of_raw_data: get_u32(&self.data, base + 16),
            pointer_to_raw_data: get_u32(&self.data, base + 20),
            characteristics: get_u32(&self.data, base + 36),
        }
    }

    /// Decode the whole section table.
    pub fn sections(&self) -> Vec<Section> {
        (0..self.number_of_sections() as usize)
            .map(|i| self.section_at(i))
            .collect()
    }

    /// Linear scan of the section table for an exact name match.
    pub fn has_section(&self, name: &str) -> bool {
        (0..self.number_of_sections() as usize)
            .any(|i| self.section_at(i).name_str() == name)
    }

    // -- mutation -----------------------------------------------------------

    /// Append a new section sized for `size` bytes of raw content and
    /// redirect the entry point to it.
    ///
    /// The new section's virtual address is SizeOfImage rounded up to the
    /// section alignment; its raw data is placed after all existing raw data
    /// (and any overlay), rounded up to the file alignment.  VirtualSize is
    /// `size` rounded to the section alignment and SizeOfRawData is at least
    /// that, so the stub is always fully present on disk.  NumberOfSections,
    /// SizeOfImage and AddressOfEntryPoint are updated in place.
    ///
    /// A name collision returns [`PatchError::DuplicateSection`] and leaves
    /// the image byte-identical.  When the grown section table would run
    /// into the first section's raw data, the header region is extended to
    /// the next file-alignment boundary and every raw pointer is rebased.
    pub fn add_section(
        &mut self,
        name: &str,
        size: u32,
        characteristics: u32,
    ) -> Result<Section, PatchError> {
        if name.is_empty() || name.len() > 8 {
            return Err(PatchError::Format(format!(
                "section name '{name}' must be 1 to 8 bytes"
            )));
        }
        if size == 0 {
            return Err(PatchError::Format("section size must be non-zero".into()));
        }
        if self.has_section(name) {
            return Err(PatchError::DuplicateSection(name.to_string()));
        }

        let file_alignment = self.file_alignment();
        let section_alignment = self.section_alignment();
        let index = self.number_of_sections() as usize;

        // Virtual placement first: it is independent of the header shift, so
        // an overflowing header field errors out before any mutation.
        let virtual_address = align_up(self.size_of_image(), section_alignment)
            .ok_or_else(|| arithmetic_overflow("SizeOfImage"))?;
        let virtual_size = align_up(size, section_alignment)
            .ok_or_else(|| arithmetic_overflow("section size"))?;
        let raw_size = align_up(virtual_size, file_alignment)
            .ok_or_else(|| arithmetic_overflow("raw section size"))?
            .max(virtual_size);
        let new_size_of_image = virtual_address
            .checked_add(virtual_size)
            .and_then(|end| align_up(end, section_alignment))
            .ok_or_else(|| arithmetic_overflow("new SizeOfImage"))?;

        // Make room in the header region for one more table entry.
        self.reserve_table_slot(index, file_alignment)?;

        // Raw placement: after every existing section's raw data and after
        // the end of the file, so an appended overlay is never clobbered.
        let mut raw_end = self.data.len() as u32;
        for i in 0..index {
            let s = self.section_at(i);
            raw_end = raw_end.max(s.pointer_to_raw_data.saturating_add(s.size_of_raw_data));
        }
        let raw_offset = align_up(raw_end, file_alignment)
            .ok_or_else(|| arithmetic_overflow("raw data placement"))?;

        let mut name_bytes = [0u8; 8];
        name_bytes[..name.len()].copy_from_slice(name.as_bytes());

        let section = Section {
            name: name_bytes,
            virtual_size,
            virtual_address,
            size_of_raw_data: raw_size,
            pointer_to_raw_data: raw_offset,
            characteristics,
        };

        // Write the descriptor into its table slot.
        let base = self.section_table_offset() + index * SECTION_HEADER_SIZE;
        self.data[base..base + 8].copy_from_slice(&section.name);
        put_u32(&mut self.data, base + 8, section.virtual_size);
        put_u32(&mut self.data, base + 12, section.virtual_address);
        put_u32(&mut self.data, base + 16, section.size_of_raw_data);
        put_u32(&mut self.data, base + 20, section.pointer_to_raw_data);
        // Relocation/line-number fields stay zero for an appended section.
        self.data[base + 24..base + 36].fill(0);
        put_u32(&mut self.data, base + 36, section.characteristics);

        let coff_offset = self.coff_offset();
        put_u16(&mut self.data, coff_offset + 2, (index + 1) as u16);
        let opt_offset = self.opt_offset();
        put_u32(&mut self.data, opt_offset + 56, new_size_of_image);
        // Entry redirection: execution now starts in the injected section.
        put_u32(&mut self.data, opt_offset + 16, virtual_address);

        // Reserve the zero-filled raw range the stub will be written into.
        let end = raw_offset as usize + raw_size as usize;
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.code_slot = Some(CodeSlot {
            offset: raw_offset as usize,
            size: raw_size as usize,
        });

        Ok(section)
    }

    /// Ensure the section table can hold `index + 1` entries inside the
    /// header region.  If it cannot, grow SizeOfHeaders to the next
    /// file-alignment boundary, shift all raw data up by the delta and
    /// rebase every nonzero raw pointer.
    fn reserve_table_slot(&mut self, index: usize, file_alignment: u32) -> Result<(), PatchError> {
        let table_offset = self.section_table_offset();
        let needed = table_offset + (index + 1) * SECTION_HEADER_SIZE;
        let headers = self.size_of_headers() as usize;
        if needed <= headers {
            return Ok(());
        }
        if headers > self.data.len() || headers < table_offset {
            return Err(PatchError::Format(
                "SizeOfHeaders is inconsistent with the section table".into(),
            ));
        }

        let new_headers = align_up(needed as u32, file_alignment)
            .ok_or_else(|| arithmetic_overflow("SizeOfHeaders"))?
            .max(needed as u32);
        let shift = new_headers as usize - headers;

        let old_len = self.data.len();
        self.data.resize(old_len + shift, 0);
        // Everything past the header region moves up as one block; the
        // vacated gap becomes header padding.
        self.data.copy_within(headers..old_len, headers + shift);
        self.data[headers..headers + shift].fill(0);

        for i in 0..index {
            let entry = self.section_table_offset() + i * SECTION_HEADER_SIZE;
            let ptr = get_u32(&self.data, entry + 20);
            // Uninitialized-data sections keep a zero raw pointer.
            if ptr != 0 {
                put_u32(&mut self.data, entry + 20, ptr + shift as u32);
            }
        }

        let opt_offset = self.opt_offset();
        put_u32(&mut self.data, opt_offset + 60, new_headers);
        Ok(())
    }

    /// Write the image to `path`, placing `code` at the raw offset reserved
    /// by [`add_section`](Self::add_section).  The buffer is fully assembled
    /// in memory first, so a failed write never leaves a partial file that
    /// this process created.
    pub fn save<P: AsRef<Path>>(&mut self, path: P, code: &[u8]) -> Result<(), PatchError> {
        match self.code_slot {
            Some(slot) => {
                if code.len() > slot.size {
                    return Err(PatchError::Format(format!(
                        "stub of {} bytes exceeds the {}-byte section",
                        code.len(),
                        slot.size
                    )));
                }
                self.data[slot.offset..slot.offset + code.len()].copy_from_slice(code);
                // Padding out to the raw size is already zero.
            }
            // No section was added; write the image through unchanged.
            None => {}
        }
        fs::write(path, &self.data)?;
        Ok(())
    }
}
