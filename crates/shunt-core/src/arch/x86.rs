use std::sync::Arc;
use tracing::trace;

use super::{
    Architecture, ArchitectureKind, DetourInfo, DetourKind, VtableProxyStub, check_buffer,
    check_max_size,
};
use crate::error::{Error, Result};
use crate::features::ArchitectureFeature;
use crate::memory::{AllocatedMemory, System};
use crate::pattern::{
    AddressEncoding, AddressKind, AddressMeaning, BytePattern, BytePatternCollection,
};

const JMP_REL32_SIZE: usize = 5;

/// 32-bit x86. Every address is reachable with `jmp rel32` modulo 2^32.
pub struct X86Arch {
    thunks: BytePatternCollection,
    proxy_stub: VtableProxyStub,
}

impl X86Arch {
    pub fn new(_system: Arc<dyn System>) -> Result<Self> {
        let rel32 = AddressKind::new(AddressEncoding::Rel32);
        let abs32 = AddressKind::new(AddressEncoding::Abs32);

        let thunks = BytePatternCollection::new(vec![
            BytePattern::parse(
                "jmp rel32",
                AddressMeaning::relative_to(rel32, 5),
                true,
                "E9 %% %% %% %%",
            )?,
            BytePattern::parse(
                "jmp [abs32]",
                AddressMeaning::new(abs32.indirect()),
                true,
                "FF 25 %% %% %% %%",
            )?,
            BytePattern::parse(
                "mov eax, imm32; jmp eax",
                AddressMeaning::new(abs32),
                true,
                "B8 %% %% %% %% FF E0",
            )?,
        ]);

        // mov ecx, [ecx+4]; mov eax, [ecx]; jmp [eax+disp32]
        let mut template = vec![0x8B, 0x49, 0x04, 0x8B, 0x01, 0xFF, 0xA0];
        let index_offset = template.len();
        template.extend_from_slice(&[0, 0, 0, 0]);
        template.resize(16, 0xCC);

        Ok(Self {
            thunks,
            proxy_stub: VtableProxyStub {
                template,
                index_offset,
                premultiplied: true,
            },
        })
    }
}

impl Architecture for X86Arch {
    fn target(&self) -> ArchitectureKind {
        ArchitectureKind::X86
    }

    fn features(&self) -> ArchitectureFeature {
        ArchitectureFeature::empty()
    }

    fn known_method_thunks(&self) -> &BytePatternCollection {
        &self.thunks
    }

    fn compute_detour_info(
        &self,
        from: usize,
        to: usize,
        max_size: Option<usize>,
    ) -> Result<DetourInfo> {
        check_max_size(from, to, JMP_REL32_SIZE, max_size)?;
        trace!("Detour 0x{:X} -> 0x{:X}: rel32", from, to);
        Ok(DetourInfo {
            from,
            to,
            size: JMP_REL32_SIZE,
            kind: DetourKind::Rel32,
        })
    }

    fn get_detour_bytes(
        &self,
        info: &DetourInfo,
        buffer: &mut [u8],
    ) -> Result<(usize, Option<AllocatedMemory>)> {
        check_buffer(info, buffer)?;
        if info.kind != DetourKind::Rel32 {
            return Err(Error::InvalidArgument(format!(
                "{} is not an x86 detour",
                info.kind
            )));
        }

        let disp = (info.to as u32).wrapping_sub((info.from as u32).wrapping_add(5));
        buffer[0] = 0xE9;
        buffer[1..5].copy_from_slice(&disp.to_le_bytes());
        Ok((JMP_REL32_SIZE, None))
    }

    fn vtable_proxy_stub(&self) -> Option<&VtableProxyStub> {
        Some(&self.proxy_stub)
    }
}
