use std::sync::Arc;
use tracing::trace;

use super::{
    Architecture, ArchitectureKind, DetourInfo, DetourKind, check_buffer, check_max_size,
};
use crate::error::{Error, Result};
use crate::features::ArchitectureFeature;
use crate::memory::{AllocatedMemory, System};
use crate::pattern::{
    AddressEncoding, AddressKind, AddressMeaning, BytePattern, BytePatternCollection,
};

const BRANCH_SIZE: usize = 4;
const LITERAL_BRANCH_SIZE: usize = 16;

/// Reach of `b imm26`
const BRANCH_RANGE: i64 = 128 * 1024 * 1024;

const B_OPCODE: u32 = 0x1400_0000;
/// `ldr x17, #8`
const LDR_X17_LITERAL: u32 = 0x5800_0051;
/// `br x17`
const BR_X17: u32 = 0xD61F_0220;

fn branch_displacement(from: usize, to: usize) -> Option<i64> {
    let disp = (to as i64).wrapping_sub(from as i64);
    (disp % 4 == 0 && (-BRANCH_RANGE..BRANCH_RANGE).contains(&disp)).then_some(disp)
}

pub struct Aarch64Arch {
    thunks: BytePatternCollection,
}

impl Aarch64Arch {
    pub fn new(_system: Arc<dyn System>) -> Result<Self> {
        let abs64 = AddressMeaning::new(AddressKind::new(AddressEncoding::Abs64));

        let thunks = BytePatternCollection::new(vec![
            BytePattern::parse(
                "ldr x16, #8; br x16",
                abs64,
                true,
                "50 00 00 58 00 02 1F D6 %% %% %% %% %% %% %% %%",
            )?,
            BytePattern::parse(
                "ldr x17, #8; br x17",
                abs64,
                true,
                "51 00 00 58 20 02 1F D6 %% %% %% %% %% %% %% %%",
            )?,
        ]);

        Ok(Self { thunks })
    }
}

impl Architecture for Aarch64Arch {
    fn target(&self) -> ArchitectureKind {
        ArchitectureKind::Aarch64
    }

    fn features(&self) -> ArchitectureFeature {
        ArchitectureFeature::FIXED_INSTRUCTION_SIZE | ArchitectureFeature::ABSOLUTE_64BIT_JUMP
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
        check_max_size(from, to, BRANCH_SIZE, max_size)?;

        let (kind, size) = if branch_displacement(from, to).is_some() {
            (DetourKind::Branch26, BRANCH_SIZE)
        } else {
            check_max_size(from, to, LITERAL_BRANCH_SIZE, max_size)?;
            (DetourKind::LiteralBranch, LITERAL_BRANCH_SIZE)
        };

        trace!("Detour 0x{:X} -> 0x{:X}: {}", from, to, kind);
        Ok(DetourInfo {
            from,
            to,
            size,
            kind,
        })
    }

    fn get_detour_bytes(
        &self,
        info: &DetourInfo,
        buffer: &mut [u8],
    ) -> Result<(usize, Option<AllocatedMemory>)> {
        check_buffer(info, buffer)?;

        match info.kind {
            DetourKind::Branch26 => {
                let disp = branch_displacement(info.from, info.to).ok_or(
                    Error::NoDetourEncoding {
                        from: info.from,
                        to: info.to,
                        max_size: info.size,
                    },
                )?;
                let insn = B_OPCODE | (((disp >> 2) as u32) & 0x03FF_FFFF);
                buffer[..4].copy_from_slice(&insn.to_le_bytes());
                Ok((BRANCH_SIZE, None))
            }
            DetourKind::LiteralBranch => {
                buffer[..4].copy_from_slice(&LDR_X17_LITERAL.to_le_bytes());
                buffer[4..8].copy_from_slice(&BR_X17.to_le_bytes());
                buffer[8..16].copy_from_slice(&(info.to as u64).to_le_bytes());
                Ok((LITERAL_BRANCH_SIZE, None))
            }
            other => Err(Error::InvalidArgument(format!(
                "{} is not an aarch64 detour",
                other
            ))),
        }
    }
}
