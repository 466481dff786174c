//! Encode command: show the bytes a detour would write.

use anyhow::Result;
use owo_colors::OwoColorize;
use shunt_core::arch::MAX_DETOUR_SIZE;
use shunt_core::{ArchitectureKind, create_architecture, create_current_system};

use super::hex_utils::{format_hex_bytes, parse_hex_address};

pub fn run(arch: ArchitectureKind, from: &str, to: &str, max_size: Option<usize>) -> Result<()> {
    let from = parse_hex_address(from)?;
    let to = parse_hex_address(to)?;

    let architecture = create_architecture(arch, create_current_system()?)?;
    let info = architecture.compute_detour_info(from, to, max_size)?;

    let mut bytes = [0u8; MAX_DETOUR_SIZE];
    let (size, stub) = architecture.get_detour_bytes(&info, &mut bytes)?;

    println!("Detour 0x{:X} -> 0x{:X} on {}", from, to, arch.bold());
    println!("  Kind:  {}", info.kind.green());
    println!("  Size:  {} bytes", size);
    println!("  Bytes: {}", format_hex_bytes(&bytes[..size]));
    if let Some(stub) = stub {
        println!(
            "  Stub:  {} {}",
            stub.range(),
            "(allocated in this process for illustration)".dimmed()
        );
    }

    Ok(())
}
