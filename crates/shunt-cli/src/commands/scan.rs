//! Scan command: match thunk patterns against raw bytes.
//!
//! The bytes are treated as if loaded at `base`, so relative targets resolve
//! to real addresses and indirect targets are followed when the pointer they
//! go through lies inside the buffer.

use anyhow::{Result, bail};
use owo_colors::OwoColorize;
use shunt_core::pattern::{BytePatternCollection, load_signatures};
use shunt_core::{
    ArchitectureKind, Error as CoreError, ReadMemory, create_architecture, create_current_system,
};
use std::fs;
use std::path::Path;

use super::hex_utils::{format_hex_bytes, parse_hex_address, parse_hex_bytes};

/// Bytes standing in for memory at a fixed base address
pub struct BufferMemory<'a> {
    base: usize,
    data: &'a [u8],
}

impl<'a> BufferMemory<'a> {
    pub fn new(base: usize, data: &'a [u8]) -> Self {
        Self { base, data }
    }
}

impl ReadMemory for BufferMemory<'_> {
    fn read_into(&self, address: usize, buffer: &mut [u8]) -> shunt_core::Result<()> {
        let start = address
            .checked_sub(self.base)
            .filter(|start| start + buffer.len() <= self.data.len())
            .ok_or_else(|| CoreError::MemoryReadFailed {
                address,
                message: "outside the scanned bytes".to_string(),
            })?;
        buffer.copy_from_slice(&self.data[start..start + buffer.len()]);
        Ok(())
    }
}

/// One pattern hit with its resolved target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanHit {
    pub pattern: String,
    pub offset: usize,
    pub length: usize,
    /// Address the captured bytes decode to, before any dereference
    pub decoded: usize,
    /// Final target; `None` when an indirect pointer lies outside the buffer
    pub target: Option<usize>,
    pub precode_fixup: bool,
}

pub fn scan_bytes(
    patterns: &BytePatternCollection,
    base: usize,
    data: &[u8],
    search: bool,
) -> Result<Option<ScanHit>> {
    let found = if search {
        patterns.try_find_match(data)
    } else {
        patterns.try_match_at(data)
    };
    let Some(found) = found else {
        return Ok(None);
    };

    let memory = BufferMemory::new(base, data);
    let meaning = found.pattern.address_meaning();
    let mut direct = meaning;
    direct.kind.indirect = false;
    let decoded = direct.process_address(base, found.offset, found.address, &memory)?;
    let target = if meaning.kind.indirect {
        memory.read_pointer(decoded).ok()
    } else {
        Some(decoded)
    };

    Ok(Some(ScanHit {
        pattern: found.pattern.name().to_string(),
        offset: found.offset,
        length: found.length,
        decoded,
        target,
        precode_fixup: meaning.kind.precode_fixup,
    }))
}

pub fn run(
    arch: ArchitectureKind,
    hex: Option<&str>,
    file: Option<&Path>,
    base: &str,
    signatures: Option<&Path>,
    search: bool,
) -> Result<()> {
    let data = match (hex, file) {
        (Some(hex), _) => parse_hex_bytes(hex)?,
        (None, Some(path)) => fs::read(path)?,
        (None, None) => bail!("Either --hex or --file is required"),
    };
    let base = parse_hex_address(base)?;

    let loaded;
    let architecture;
    let patterns = match signatures {
        Some(path) => {
            loaded = load_signatures(path)?.to_collection()?;
            &loaded
        }
        None => {
            architecture = create_architecture(arch, create_current_system()?)?;
            architecture.known_method_thunks()
        }
    };

    println!(
        "Scanning {} bytes at 0x{:X} against {} patterns",
        data.len(),
        base,
        patterns.len()
    );

    let Some(hit) = scan_bytes(patterns, base, &data, search)? else {
        println!("{}", "No thunk pattern matched".yellow());
        return Ok(());
    };

    let matched = &data[hit.offset..hit.offset + hit.length];
    println!("{} {}", "Matched".green(), hit.pattern.bold());
    println!("  At:      0x{:X} (+{})", base + hit.offset, hit.offset);
    println!("  Bytes:   {}", format_hex_bytes(matched));
    match hit.target {
        Some(target) if target != hit.decoded => {
            println!("  Target:  0x{:X} (through [0x{:X}])", target, hit.decoded)
        }
        Some(target) => println!("  Target:  0x{:X}", target),
        None => println!(
            "  Target:  [0x{:X}] {}",
            hit.decoded,
            "(pointer outside scanned bytes)".dimmed()
        ),
    }
    if hit.precode_fixup {
        println!("  {}", "Jumps into a precode fixup routine".yellow());
    }

    Ok(())
}
