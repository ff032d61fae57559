mod arch;
mod asm;
mod error;
mod image;
#[cfg(test)]
mod testutil;

use std::path::PathBuf;
use std::process;

use clap::Parser;

use crate::arch::{detect_arch, PeArch};
use crate::error::PatchError;
use crate::image::{PeImage, SCN_CNT_CODE, SCN_MEM_EXECUTE, SCN_MEM_READ};

#[derive(Parser, Debug)]
#[command(
    name = "pe-ep-intercept",
    version,
    about = "Run an injected PE section before the original entry point"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Append a redirect section and point the entry point at it
    Patch {
        /// Input PE file path
        input: PathBuf,
        /// Output PE file path
        #[arg(short, long)]
        output: PathBuf,
        /// Name of the injected section
        #[arg(short, long, default_value = ".code")]
        section: String,
    },
    /// Print the header and section-table summary of a PE file
    Analyze {
        /// Input PE file path
        input: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Patch {
            input,
            output,
            section,
        } => cmd_patch(input, output, section),
        Command::Analyze { input } => cmd_analyze(input),
    }
}

fn fail(err: &PatchError) -> ! {
    eprintln!("Error: {err}");
    process::exit(1);
}

// ─── patch ───────────────────────────────────────────────────

fn cmd_patch(input: PathBuf, output: PathBuf, section: String) {
    if section.is_empty() || section.len() > 8 || !section.is_ascii() {
        eprintln!("Error: section name must be 1 to 8 ASCII bytes");
        process::exit(1);
    }

    let arch = detect_arch(&input).unwrap_or_else(|e| fail(&e));
    if arch == PeArch::Unknown {
        eprintln!(
            "Error: '{}' is not a supported PE image (x86 and x64 only)",
            input.display()
        );
        process::exit(1);
    }

    let mut img = PeImage::load(&input).unwrap_or_else(|e| fail(&e));
    let oep = img.entry_point();
    let base = img.image_base();
    println!("[*] {arch} image, entry point 0x{oep:08X}, image base 0x{base:X}");

    let text = asm::entry_redirect(arch, base, oep).unwrap_or_else(|e| fail(&e));
    let code = asm::assemble(arch, &text).unwrap_or_else(|e| fail(&e));

    if img.has_section(&section) {
        // Explicit no-op: report it and pass the image through unchanged.
        println!("[!] section '{section}' already exists; entry point left untouched");
        img.save(&output, &[]).unwrap_or_else(|e| fail(&e));
        println!("[*] wrote unmodified image to {}", output.display());
        return;
    }

    let sec = img
        .add_section(
            &section,
            code.len() as u32,
            SCN_CNT_CODE | SCN_MEM_EXECUTE | SCN_MEM_READ,
        )
        .unwrap_or_else(|e| fail(&e));
    img.save(&output, &code).unwrap_or_else(|e| fail(&e));

    println!(
        "[*] added section '{}' at RVA 0x{:08X} ({} raw bytes)",
        sec.name_str(),
        sec.virtual_address,
        sec.size_of_raw_data
    );
    println!(
        "[*] entry point redirected: 0x{oep:08X} -> 0x{:08X}",
        sec.virtual_address
    );
    println!("[*] stub:");
    print_stub(arch, &code, base + sec.virtual_address as u64);
    println!("[*] wrote {}", output.display());
}

/// Disassemble the stub at its mapped address for the status output.
fn print_stub(arch: PeArch, code: &[u8], va: u64) {
    use iced_x86::{Decoder, DecoderOptions, Formatter, IntelFormatter};

    let bitness = if arch == PeArch::X86 { 32 } else { 64 };
    let mut decoder = Decoder::with_ip(bitness, code, va, DecoderOptions::NONE);
    let mut formatter = IntelFormatter::new();
    let mut line = String::new();
    while decoder.can_decode() {
        let instr = decoder.decode();
        line.clear();
        formatter.format(&instr, &mut line);
        println!("      0x{:016X}  {line}", instr.ip());
    }
}

// ─── analyze ─────────────────────────────────────────────────

fn cmd_analyze(input: PathBuf) {
    let img = PeImage::load(&input).unwrap_or_else(|e| fail(&e));

    println!("PE summary: {}", input.display());
    println!("════════════════════════════════════════");
    println!("Architecture:    {}", img.arch());
    println!("Entry point:     0x{:08X}", img.entry_point());
    println!("Image base:      0x{:016X}", img.image_base());
    println!("Section align:   0x{:X}", img.section_alignment());
    println!("File align:      0x{:X}", img.file_alignment());
    println!("Size of image:   0x{:08X}", img.size_of_image());
    println!("Size of headers: 0x{:08X}", img.size_of_headers());
    println!();
    println!(
        "  {:<8}  {:>10}  {:>10}  {:>10}  {:>10}  {:>10}",
        "Name", "VirtSize", "VirtAddr", "RawSize", "RawPtr", "Flags"
    );
    for section in img.sections() {
        println!(
            "  {:<8}  0x{:08X}  0x{:08X}  0x{:08X}  0x{:08X}  0x{:08X}",
            section.name_str(),
            section.virtual_size,
            section.virtual_address,
            section.size_of_raw_data,
            section.pointer_to_raw_data,
            section.characteristics,
        );
    }
}
