//! Instruction-set specific detour encoding

mod aarch64;
mod x86;
mod x86_64;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::{Display, EnumString, IntoStaticStr};

pub use aarch64::Aarch64Arch;
pub use x86::X86Arch;
pub use x86_64::X86_64Arch;

use crate::error::{Error, Result};
use crate::features::ArchitectureFeature;
use crate::memory::{AllocatedMemory, System};
use crate::pattern::BytePatternCollection;

/// Largest detour any architecture emits; sizes scratch buffers
pub const MAX_DETOUR_SIZE: usize = 16;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize,
)]
#[strum(ascii_case_insensitive)]
pub enum ArchitectureKind {
    #[strum(serialize = "x86")]
    X86,
    #[strum(to_string = "x86_64", serialize = "amd64", serialize = "x64")]
    X86_64,
    #[strum(serialize = "arm")]
    Arm,
    #[strum(to_string = "aarch64", serialize = "arm64")]
    Aarch64,
}

impl ArchitectureKind {
    pub fn current() -> Self {
        if cfg!(target_arch = "x86_64") {
            ArchitectureKind::X86_64
        } else if cfg!(target_arch = "x86") {
            ArchitectureKind::X86
        } else if cfg!(target_arch = "aarch64") {
            ArchitectureKind::Aarch64
        } else {
            ArchitectureKind::Arm
        }
    }

    pub fn pointer_size(&self) -> usize {
        match self {
            ArchitectureKind::X86 | ArchitectureKind::Arm => 4,
            ArchitectureKind::X86_64 | ArchitectureKind::Aarch64 => 8,
        }
    }
}

/// Encoding chosen for one detour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum DetourKind {
    /// `jmp rel32`
    Rel32,
    /// `jmp [rip+0]` followed by the absolute target
    Abs64Indirect,
    /// `jmp rel32` to an allocated stub holding an absolute jump
    Rel32ViaStub,
    /// AArch64 `b imm26`
    Branch26,
    /// AArch64 `ldr x17, #8; br x17` followed by the absolute target
    LiteralBranch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DetourInfo {
    pub from: usize,
    pub to: usize,
    pub size: usize,
    pub kind: DetourKind,
}

/// Relocates the bytes a detour clobbers so the original code stays reachable
pub trait AltEntryFactory: Send + Sync {
    /// Copy at least `min_length` bytes of whole instructions from `entry` into
    /// fresh executable memory, followed by a jump back to the rest of the body.
    fn create_alternate_entrypoint(
        &self,
        entry: usize,
        min_length: usize,
    ) -> Result<(usize, AllocatedMemory)>;
}

/// Template of a stub that forwards a call through slot `index` of a wrapped object's vtable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VtableProxyStub {
    pub template: Vec<u8>,
    /// Offset of the little-endian `u32` index field inside the template
    pub index_offset: usize,
    /// The index field holds a byte offset (`index * pointer size`)
    pub premultiplied: bool,
}

pub trait Architecture: Send + Sync {
    fn target(&self) -> ArchitectureKind;

    fn features(&self) -> ArchitectureFeature;

    /// Thunk shapes the entry point walk knows how to see through
    fn known_method_thunks(&self) -> &BytePatternCollection;

    /// Pick an encoding that redirects `from` to `to` in at most `max_size` bytes.
    fn compute_detour_info(
        &self,
        from: usize,
        to: usize,
        max_size: Option<usize>,
    ) -> Result<DetourInfo>;

    /// Write the detour bytes for `info` into `buffer`.
    ///
    /// Returns the number of bytes written and any auxiliary allocation the
    /// detour jumps through; it must outlive the detour.
    fn get_detour_bytes(
        &self,
        info: &DetourInfo,
        buffer: &mut [u8],
    ) -> Result<(usize, Option<AllocatedMemory>)>;

    fn alt_entry_factory(&self) -> Option<&dyn AltEntryFactory> {
        None
    }

    fn vtable_proxy_stub(&self) -> Option<&VtableProxyStub> {
        None
    }
}

pub fn create_architecture(
    kind: ArchitectureKind,
    system: Arc<dyn System>,
) -> Result<Arc<dyn Architecture>> {
    Ok(match kind {
        ArchitectureKind::X86_64 => Arc::new(X86_64Arch::new(system)?),
        ArchitectureKind::X86 => Arc::new(X86Arch::new(system)?),
        ArchitectureKind::Aarch64 => Arc::new(Aarch64Arch::new(system)?),
        ArchitectureKind::Arm => {
            return Err(Error::PlatformNotSupported(format!(
                "no detour encoder for {}",
                kind
            )));
        }
    })
}

/// Create the [`Architecture`] for the host CPU
pub fn create_current_architecture(system: Arc<dyn System>) -> Result<Arc<dyn Architecture>> {
    create_architecture(ArchitectureKind::current(), system)
}

pub(crate) fn check_buffer(info: &DetourInfo, buffer: &[u8]) -> Result<()> {
    if buffer.len() < info.size {
        return Err(Error::InvalidArgument(format!(
            "detour needs {} bytes, buffer holds {}",
            info.size,
            buffer.len()
        )));
    }
    Ok(())
}

pub(crate) fn check_max_size(from: usize, to: usize, size: usize, max_size: Option<usize>) -> Result<()> {
    match max_size {
        Some(max_size) if size > max_size => Err(Error::NoDetourEncoding { from, to, max_size }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MockSystemBuilder;

    #[test]
    fn test_architecture_kind_parse() {
        assert_eq!("amd64".parse::<ArchitectureKind>().unwrap(), ArchitectureKind::X86_64);
        assert_eq!("ARM64".parse::<ArchitectureKind>().unwrap(), ArchitectureKind::Aarch64);
        assert_eq!(ArchitectureKind::X86_64.to_string(), "x86_64");
        assert_eq!(ArchitectureKind::X86.pointer_size(), 4);
    }

    #[test]
    fn test_create_architecture() {
        let system: Arc<dyn System> = Arc::new(MockSystemBuilder::new().build());
        let arch = create_architecture(ArchitectureKind::X86_64, system.clone()).unwrap();
        assert_eq!(arch.target(), ArchitectureKind::X86_64);
        assert!(!arch.known_method_thunks().is_empty());

        let err = create_architecture(ArchitectureKind::Arm, system).err().unwrap();
        assert!(err.is_unsupported());
    }
}
