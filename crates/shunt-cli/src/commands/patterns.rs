//! Patterns command: list or export the thunk patterns of an architecture.

use anyhow::Result;
use owo_colors::OwoColorize;
use shunt_core::pattern::{ThunkSignatureSet, save_signatures};
use shunt_core::{ArchitectureKind, create_architecture, create_current_system};
use std::path::Path;
use tracing::info;

pub fn run(arch: ArchitectureKind, export: Option<&Path>) -> Result<()> {
    let system = create_current_system()?;
    let architecture = create_architecture(arch, system)?;
    let set = ThunkSignatureSet::from_collection(arch.to_string(), architecture.known_method_thunks());

    if let Some(path) = export {
        save_signatures(path, &set)?;
        info!("Exported {} patterns to {:?}", set.signatures.len(), path);
        return Ok(());
    }

    println!("{} thunk patterns for {}", set.signatures.len(), arch.bold());
    for sig in &set.signatures {
        let kind = &sig.address.kind;
        let mut flags = vec![format!("{:?}", kind.encoding)];
        if kind.indirect {
            flags.push("indirect".to_string());
        }
        if kind.precode_fixup {
            flags.push("precode".to_string());
        }
        if sig.must_match_at_start {
            flags.push("anchored".to_string());
        }

        println!();
        println!("  {}", sig.name.green());
        println!("    {}", sig.pattern);
        println!(
            "    {} (relative to +{})",
            flags.join(", ").dimmed(),
            sig.address.relative_to_offset
        );
    }

    Ok(())
}
