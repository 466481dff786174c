use anyhow::Result;
use clap::{Parser, Subcommand};
use shunt_core::ArchitectureKind;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "shunt")]
#[command(author, version, about = "Inspect the detour engine on this host")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the host platform triple and its capabilities
    Info {
        /// Engine configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List the thunk patterns an architecture recognizes
    Patterns {
        /// Target architecture (x86, x86_64, aarch64)
        #[arg(short, long, default_value_t = ArchitectureKind::current())]
        arch: ArchitectureKind,

        /// Write the patterns to this JSON file instead of printing them
        #[arg(short, long)]
        export: Option<PathBuf>,
    },

    /// Match thunk patterns against a byte sequence
    Scan {
        /// Target architecture (x86, x86_64, aarch64)
        #[arg(short, long, default_value_t = ArchitectureKind::current())]
        arch: ArchitectureKind,

        /// Bytes to scan, as hex (e.g. "E9 FB 0F 00 00")
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        hex: Option<String>,

        /// Read the bytes to scan from this file
        #[arg(long)]
        file: Option<PathBuf>,

        /// Address the first byte is loaded at
        #[arg(short, long, default_value = "0x0")]
        base: String,

        /// Use patterns from this JSON file instead of the built-in set
        #[arg(short, long)]
        signatures: Option<PathBuf>,

        /// Search the whole buffer instead of matching at its start only
        #[arg(long)]
        search: bool,
    },

    /// Show how a detour between two addresses would be encoded
    Encode {
        /// Target architecture (x86, x86_64, aarch64)
        #[arg(short, long, default_value_t = ArchitectureKind::current())]
        arch: ArchitectureKind,

        /// Address being redirected
        #[arg(long)]
        from: String,

        /// Address to redirect to
        #[arg(long)]
        to: String,

        /// Maximum number of bytes the detour may overwrite
        #[arg(long)]
        max_size: Option<usize>,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("shunt=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Info { config } => commands::info::run(config.as_deref()),
        Commands::Patterns { arch, export } => commands::patterns::run(arch, export.as_deref()),
        Commands::Scan {
            arch,
            hex,
            file,
            base,
            signatures,
            search,
        } => commands::scan::run(
            arch,
            hex.as_deref(),
            file.as_deref(),
            &base,
            signatures.as_deref(),
            search,
        ),
        Commands::Encode {
            arch,
            from,
            to,
            max_size,
        } => commands::encode::run(arch, &from, &to, max_size),
    }
}
