//! Info command: describe the host platform triple.

use anyhow::Result;
use owo_colors::OwoColorize;
use shunt_core::{EngineConfig, PlatformTriple};
use std::path::Path;
use tracing::info;

pub fn run(config: Option<&Path>) -> Result<()> {
    let config = match config {
        Some(path) => {
            info!("Loading engine config from {:?}", path);
            EngineConfig::load(path)?
        }
        None => EngineConfig::from_env()?,
    };

    let triple = PlatformTriple::create_with_config(config)?;
    let (arch, os, runtime) = triple.host_triple();
    let system = triple.system();

    println!("{}", "Platform triple".bold());
    println!("  Architecture: {}", arch.green());
    println!("  System:       {}", os.green());
    println!("  Runtime:      {}", runtime.green());
    println!("  Features:     {}", triple.features());
    println!();

    let abi = triple.abi();
    let order: Vec<String> = abi.argument_order.iter().map(|k| k.to_string()).collect();
    println!("{}", "Calling convention".bold());
    println!("  Argument order:   {}", order.join(", "));
    println!("  Classifier:       {}", abi.classifier);
    println!("  Returns buffer:   {}", abi.returns_return_buffer);
    println!();

    println!("{}", "Memory".bold());
    println!(
        "  Max allocation:   0x{:X} bytes",
        system.max_allocation_size()
    );
    match system.control_flow_guard() {
        Some(cfg) => println!(
            "  Control Flow Guard: {} (alignment {})",
            "enabled".yellow(),
            cfg.target_alignment_requirement()
        ),
        None => println!("  Control Flow Guard: {}", "disabled".dimmed()),
    }
    println!();

    let arch = triple.architecture();
    println!("{}", "Detours".bold());
    println!(
        "  Known thunks:     {}",
        arch.known_method_thunks().len()
    );
    println!(
        "  Alternate entry:  {}",
        arch.alt_entry_factory().is_some()
    );
    match arch.vtable_proxy_stub() {
        Some(stub) => println!("  Vtable proxy stub: {} bytes", stub.template.len()),
        None => println!("  Vtable proxy stub: {}", "unavailable".dimmed()),
    }

    let config = triple.config();
    println!();
    println!("{}", "Engine config".bold());
    println!("  Walk limit:       {}", config.walk_iteration_limit);
    println!("  Create alt entry: {}", config.create_alt_entry);
    if let Some(limit) = config.thunk_read_limit {
        println!("  Thunk read limit: {}", limit);
    }

    Ok(())
}
