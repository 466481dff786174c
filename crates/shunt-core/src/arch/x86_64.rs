//! x86-64 detours, thunk signatures and prologue relocation

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Code, Decoder, DecoderOptions, Instruction,
    InstructionBlock,
};
use std::sync::Arc;
use tracing::{debug, trace};

use super::{
    AltEntryFactory, Architecture, ArchitectureKind, DetourInfo, DetourKind, VtableProxyStub,
    check_buffer, check_max_size,
};
use crate::error::{Error, Result};
use crate::features::ArchitectureFeature;
use crate::memory::{
    AllocatedMemory, AllocationRequest, OsKind, PatchTargetKind, ReadMemory, System,
};
use crate::pattern::{
    AddressEncoding, AddressKind, AddressMeaning, BytePattern, BytePatternCollection,
};

const JMP_REL32_SIZE: usize = 5;
const JMP_ABS64_SIZE: usize = 14;

/// `jmp qword ptr [rip+0]`; the target follows the instruction
const JMP_RIP_INDIRECT: [u8; 6] = [0xFF, 0x25, 0x00, 0x00, 0x00, 0x00];

/// Distance within which stubs are placed so `rel32` operands reach them
const NEAR_REACH: usize = 0x7FF0_0000;

/// Longest x86 instruction
const MAX_INSTRUCTION_LEN: usize = 15;

fn rel32_displacement(from: usize, to: usize) -> Option<i32> {
    let next = from.wrapping_add(JMP_REL32_SIZE) as i64;
    i32::try_from((to as i64).wrapping_sub(next)).ok()
}

fn write_jmp_rel32(buffer: &mut [u8], disp: i32) {
    buffer[0] = 0xE9;
    buffer[1..5].copy_from_slice(&disp.to_le_bytes());
}

fn write_jmp_abs64(buffer: &mut [u8], to: usize) {
    buffer[..6].copy_from_slice(&JMP_RIP_INDIRECT);
    buffer[6..14].copy_from_slice(&(to as u64).to_le_bytes());
}

fn known_thunks() -> Result<BytePatternCollection> {
    let rel32 = AddressKind::new(AddressEncoding::Rel32);
    let abs64 = AddressKind::new(AddressEncoding::Abs64);

    // Longer shapes go first so they win over their own prefixes. A fixup
    // precode's first slot holds the body once compiled, otherwise it points
    // back at the tail that calls the fixup routine.
    let patterns = vec![
        BytePattern::parse(
            "fixup precode (jmp [rip]; mov r10; jmp [rip])",
            AddressMeaning::relative_to(rel32.indirect(), 6),
            true,
            "FF 25 %% %% %% %% 4C 8B 15 ?? ?? ?? ?? FF 25 ?? ?? ?? ??",
        )?,
        BytePattern::parse(
            "fixup precode tail (mov r10, [rip]; jmp [rip])",
            AddressMeaning::relative_to(rel32.indirect().precode_fixup(), 13),
            true,
            "4C 8B 15 ?? ?? ?? ?? FF 25 %% %% %% %%",
        )?,
        BytePattern::parse(
            "fixup precode (call rel32; pop rsi)",
            AddressMeaning::relative_to(rel32.precode_fixup(), 5),
            true,
            "E8 %% %% %% %% 5E",
        )?,
        BytePattern::parse(
            "stub precode (mov r10, imm64; jmp rel32)",
            AddressMeaning::relative_to(rel32, 15),
            true,
            "49 BA ?? ?? ?? ?? ?? ?? ?? ?? E9 %% %% %% %%",
        )?,
        BytePattern::parse(
            "mov rax, imm64; jmp rax",
            AddressMeaning::new(abs64),
            true,
            "48 B8 %% %% %% %% %% %% %% %% FF E0",
        )?,
        BytePattern::parse(
            "jmp [rip+disp32]",
            AddressMeaning::relative_to(rel32.indirect(), 6),
            true,
            "FF 25 %% %% %% %%",
        )?,
        BytePattern::parse(
            "jmp rel32",
            AddressMeaning::relative_to(rel32, 5),
            true,
            "E9 %% %% %% %%",
        )?,
    ];

    Ok(BytePatternCollection::new(patterns))
}

/// Forward `this` to the wrapped object at `this+8` and jump through its vtable
fn vtable_proxy_stub(os: OsKind) -> VtableProxyStub {
    let mut template = if os == OsKind::Windows {
        // mov rcx, [rcx+8]; mov rax, [rcx]; jmp [rax+disp32]
        vec![0x48, 0x8B, 0x49, 0x08, 0x48, 0x8B, 0x01, 0xFF, 0xA0]
    } else {
        // mov rdi, [rdi+8]; mov rax, [rdi]; jmp [rax+disp32]
        vec![0x48, 0x8B, 0x7F, 0x08, 0x48, 0x8B, 0x07, 0xFF, 0xA0]
    };
    let index_offset = template.len();
    template.extend_from_slice(&[0, 0, 0, 0]);
    template.resize(16, 0xCC);

    VtableProxyStub {
        template,
        index_offset,
        premultiplied: true,
    }
}

pub struct X86_64Arch {
    system: Arc<dyn System>,
    thunks: BytePatternCollection,
    proxy_stub: VtableProxyStub,
    alt_entry: X86_64AltEntry,
}

impl X86_64Arch {
    pub fn new(system: Arc<dyn System>) -> Result<Self> {
        Ok(Self {
            thunks: known_thunks()?,
            proxy_stub: vtable_proxy_stub(system.target()),
            alt_entry: X86_64AltEntry {
                system: system.clone(),
            },
            system,
        })
    }

    /// Put an absolute jump to `to` in executable memory within `rel32` reach of `from`
    fn allocate_near_jump(&self, from: usize, to: usize) -> Result<AllocatedMemory> {
        let alignment = self
            .system
            .control_flow_guard()
            .map_or(16, |cfg| cfg.target_alignment_requirement().max(16));
        let request = AllocationRequest::new(JMP_ABS64_SIZE)
            .alignment(alignment)
            .executable(true)
            .near(from, NEAR_REACH);

        let stub = self.system.try_allocate(&request)?;
        let mut bytes = [0u8; JMP_ABS64_SIZE];
        write_jmp_abs64(&mut bytes, to);
        self.system
            .patch_data(PatchTargetKind::Executable, stub.base(), &bytes, None)?;

        debug!("Placed jump stub to 0x{:X} at 0x{:X}", to, stub.base());
        Ok(stub)
    }
}

impl Architecture for X86_64Arch {
    fn target(&self) -> ArchitectureKind {
        ArchitectureKind::X86_64
    }

    fn features(&self) -> ArchitectureFeature {
        ArchitectureFeature::ABSOLUTE_64BIT_JUMP | ArchitectureFeature::CREATE_ALT_ENTRY_POINT
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

        let (kind, size) = if rel32_displacement(from, to).is_some() {
            (DetourKind::Rel32, JMP_REL32_SIZE)
        } else if max_size.is_none_or(|max| max >= JMP_ABS64_SIZE) {
            (DetourKind::Abs64Indirect, JMP_ABS64_SIZE)
        } else {
            (DetourKind::Rel32ViaStub, JMP_REL32_SIZE)
        };

        trace!(
            "Detour 0x{:X} -> 0x{:X}: {} ({} bytes)",
            from, to, kind, size
        );
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
            DetourKind::Rel32 => {
                let disp = rel32_displacement(info.from, info.to).ok_or(Error::NoDetourEncoding {
                    from: info.from,
                    to: info.to,
                    max_size: info.size,
                })?;
                write_jmp_rel32(buffer, disp);
                Ok((JMP_REL32_SIZE, None))
            }
            DetourKind::Abs64Indirect => {
                write_jmp_abs64(buffer, info.to);
                Ok((JMP_ABS64_SIZE, None))
            }
            DetourKind::Rel32ViaStub => {
                let stub = self.allocate_near_jump(info.from, info.to)?;
                let disp = rel32_displacement(info.from, stub.base()).ok_or(
                    Error::AllocationFailed {
                        size: JMP_ABS64_SIZE,
                        alignment: 16,
                        message: "jump stub landed out of rel32 reach".to_string(),
                    },
                )?;
                write_jmp_rel32(buffer, disp);
                Ok((JMP_REL32_SIZE, Some(stub)))
            }
            other => Err(Error::InvalidArgument(format!(
                "{} is not an x86-64 detour",
                other
            ))),
        }
    }

    fn alt_entry_factory(&self) -> Option<&dyn AltEntryFactory> {
        Some(&self.alt_entry)
    }

    fn vtable_proxy_stub(&self) -> Option<&VtableProxyStub> {
        Some(&self.proxy_stub)
    }
}

struct X86_64AltEntry {
    system: Arc<dyn System>,
}

impl X86_64AltEntry {
    fn relocate(&self, entry: usize, min_length: usize) -> Result<Vec<Instruction>> {
        let readable = self
            .system
            .size_of_readable_memory(entry, min_length + MAX_INSTRUCTION_LEN);
        if readable < min_length {
            return Err(Error::AltEntryFailed(format!(
                "only {} bytes readable at 0x{:X}",
                readable, entry
            )));
        }
        let code = self.system.read_bytes(entry, readable)?;

        let mut decoder = Decoder::with_ip(64, &code, entry as u64, DecoderOptions::NONE);
        let mut instructions = Vec::new();
        let mut consumed = 0;

        while consumed < min_length {
            if !decoder.can_decode() {
                return Err(Error::AltEntryFailed(format!(
                    "ran out of bytes decoding 0x{:X}",
                    entry + consumed
                )));
            }
            let instruction = decoder.decode();
            if instruction.is_invalid() {
                return Err(Error::AltEntryFailed(format!(
                    "invalid instruction at 0x{:X}",
                    entry + consumed
                )));
            }
            consumed += instruction.len();
            instructions.push(instruction);
        }

        let back = Instruction::with_branch(Code::Jmp_rel32_64, (entry + consumed) as u64)
            .map_err(|e| Error::AltEntryFailed(e.to_string()))?;
        instructions.push(back);
        Ok(instructions)
    }
}

impl AltEntryFactory for X86_64AltEntry {
    fn create_alternate_entrypoint(
        &self,
        entry: usize,
        min_length: usize,
    ) -> Result<(usize, AllocatedMemory)> {
        let instructions = self.relocate(entry, min_length)?;

        // Relocated branches can grow from rel8 to rel32 forms
        let capacity = (min_length + MAX_INSTRUCTION_LEN) * 2 + JMP_ABS64_SIZE;
        let cfg = self.system.control_flow_guard();
        let alignment = cfg.map_or(16, |cfg| cfg.target_alignment_requirement().max(16));
        let request = AllocationRequest::new(capacity)
            .alignment(alignment)
            .executable(true);
        let memory = match self.system.try_allocate(&request.near(entry, NEAR_REACH)) {
            Ok(memory) => memory,
            Err(e) => {
                debug!("No memory near 0x{:X} for alternate entry: {}", entry, e);
                self.system.try_allocate(&request)?
            }
        };

        let block = InstructionBlock::new(&instructions, memory.base() as u64);
        let encoded = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)
            .map_err(|e| Error::AltEntryFailed(e.to_string()))?;
        if encoded.code_buffer.len() > memory.size() {
            return Err(Error::AltEntryFailed(format!(
                "relocated prologue needs {} bytes",
                encoded.code_buffer.len()
            )));
        }

        self.system.patch_data(
            PatchTargetKind::Executable,
            memory.base(),
            &encoded.code_buffer,
            None,
        )?;

        if let Some(cfg) = cfg {
            cfg.register_valid_indirect_call_targets(memory.base(), memory.size(), &[0])?;
        }

        debug!(
            "Relocated {} instructions from 0x{:X} to 0x{:X}",
            instructions.len() - 1,
            entry,
            memory.base()
        );
        Ok((memory.base(), memory))
    }
}
