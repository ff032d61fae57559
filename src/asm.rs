//! Redirect-stub assembly.
//!
//! The stub's only job is to transfer control to the original entry point:
//! load the absolute target address into a general-purpose register sized to
//! the architecture, then jump through that register.  [`assemble`] encodes
//! the textual template (and nothing fancier): `mov <reg>, <imm>` and
//! `jmp <reg>` over the 32- and 64-bit general-purpose registers.

use crate::arch::PeArch;
use crate::error::PatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    W32,
    W64,
}

/// A general-purpose register with its x86 encoding (0-15).
#[derive(Debug, Clone, Copy)]
struct GpReg {
    enc: u8,
    width: Width,
}

impl GpReg {
    /// R8-R15 need a REX prefix bit.
    fn is_extended(self) -> bool {
        self.enc >= 8
    }
}

const REGS_32: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
const REGS_64: [&str; 8] = ["rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi"];

fn parse_reg(token: &str) -> Option<GpReg> {
    if let Some(enc) = REGS_32.iter().position(|&r| r == token) {
        return Some(GpReg {
            enc: enc as u8,
            width: Width::W32,
        });
    }
    if let Some(enc) = REGS_64.iter().position(|&r| r == token) {
        return Some(GpReg {
            enc: enc as u8,
            width: Width::W64,
        });
    }
    // r8..r15
    if let Some(num) = token.strip_prefix('r') {
        if let Ok(n) = num.parse::<u8>() {
            if (8..=15).contains(&n) {
                return Some(GpReg {
                    enc: n,
                    width: Width::W64,
                });
            }
        }
    }
    None
}

fn parse_imm(token: &str) -> Result<u128, PatchError> {
    let parsed = if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        u128::from_str_radix(hex, 16)
    } else {
        token.parse::<u128>()
    };
    parsed.map_err(|_| PatchError::Assembly(format!("invalid immediate '{token}'")))
}

fn register_width(arch: PeArch) -> Result<Width, PatchError> {
    match arch {
        PeArch::X86 => Ok(Width::W32),
        PeArch::X64 => Ok(Width::W64),
        PeArch::Unknown => Err(PatchError::Assembly(
            "no encoder for an unknown architecture".into(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Instruction text that resumes execution at `ImageBase + oep_rva`.
///
/// The absolute target is recomputed here from the two header fields; it is
/// never hardcoded by callers.  For x86 the sum must fit in 32 bits.
pub fn entry_redirect(arch: PeArch, image_base: u64, oep_rva: u32) -> Result<String, PatchError> {
    let target = image_base
        .checked_add(oep_rva as u64)
        .ok_or_else(|| PatchError::Assembly("target address overflows 64 bits".into()))?;
    match arch {
        PeArch::X86 => {
            let target = u32::try_from(target).map_err(|_| {
                PatchError::Assembly(format!("target 0x{target:X} does not fit in 32 bits"))
            })?;
            Ok(format!("mov eax, {target:#010x}\njmp eax"))
        }
        PeArch::X64 => Ok(format!("mov rax, {target:#018x}\njmp rax")),
        PeArch::Unknown => Err(PatchError::Assembly(
            "no redirect template for an unknown architecture".into(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------------------

/// Encode a textual instruction sequence (newline- or `;`-separated) for the
/// bound architecture.
pub fn assemble(arch: PeArch, text: &str) -> Result<Vec<u8>, PatchError> {
    let width = register_width(arch)?;
    let mut code = Vec::new();
    for raw_line in text.split(['\n', ';']) {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        encode_line(width, line, &mut code)?;
    }
    if code.is_empty() {
        return Err(PatchError::Assembly("empty instruction sequence".into()));
    }
    Ok(code)
}

fn encode_line(width: Width, line: &str, code: &mut Vec<u8>) -> Result<(), PatchError> {
    let (mnemonic, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let operands: Vec<&str> = rest
        .split(',')
        .map(str::trim)
        .filter(|op| !op.is_empty())
        .collect();

    match mnemonic {
        "mov" => match operands.as_slice() {
            &[reg_tok, imm_tok] => {
                let reg = reg_of(reg_tok, width)?;
                let imm = parse_imm(imm_tok)?;
                encode_mov_imm(reg, imm, code)
            }
            _ => Err(PatchError::Assembly(format!(
                "mov expects 'mov reg, imm' in '{line}'"
            ))),
        },
        "jmp" => match operands.as_slice() {
            &[reg_tok] => {
                let reg = reg_of(reg_tok, width)?;
                encode_jmp_reg(reg, code);
                Ok(())
            }
            _ => Err(PatchError::Assembly(format!(
                "jmp expects 'jmp reg' in '{line}'"
            ))),
        },
        other => Err(PatchError::Assembly(format!("unknown mnemonic '{other}'"))),
    }
}

fn reg_of(token: &str, width: Width) -> Result<GpReg, PatchError> {
    let reg = parse_reg(token)
        .ok_or_else(|| PatchError::Assembly(format!("unknown register '{token}'")))?;
    if reg.width != width {
        return Err(PatchError::Assembly(format!(
            "register '{token}' does not match the target architecture"
        )));
    }
    Ok(reg)
}

/// `mov r32, imm32` is B8+rd id; `mov r64, imm64` is REX.W B8+rd io.
fn encode_mov_imm(reg: GpReg, imm: u128, code: &mut Vec<u8>) -> Result<(), PatchError> {
    match reg.width {
        Width::W32 => {
            let imm = u32::try_from(imm).map_err(|_| {
                PatchError::Assembly(format!("immediate 0x{imm:X} does not fit in 32 bits"))
            })?;
            code.push(0xB8 + reg.enc);
            code.extend_from_slice(&imm.to_le_bytes());
        }
        Width::W64 => {
            let imm = u64::try_from(imm).map_err(|_| {
                PatchError::Assembly(format!("immediate 0x{imm:X} does not fit in 64 bits"))
            })?;
            let rex = 0x48 | u8::from(reg.is_extended());
            code.push(rex);
            code.push(0xB8 + (reg.enc & 7));
            code.extend_from_slice(&imm.to_le_bytes());
        }
    }
    Ok(())
}

/// `jmp reg` is FF /4, with a REX.B prefix for r8-r15.
fn encode_jmp_reg(reg: GpReg, code: &mut Vec<u8>) {
    if reg.is_extended() {
        code.push(0x41);
    }
    code.push(0xFF);
    code.push(0xE0 | (reg.enc & 7));
}
