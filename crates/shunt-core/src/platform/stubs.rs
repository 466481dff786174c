//! Executable stub pages
//!
//! A vtable of `N` slots is backed by `N` copies of one stub template, each
//! with its own slot index written into the template's index field. Copies are
//! packed into as few allocations as the system's maximum allocation size
//! allows. Under Control Flow Guard every stub is padded to the guard's target
//! alignment and registered as a call target once its code is in place.

use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::{
    AllocatedMemory, AllocationRequest, PatchTargetKind, ScratchBuffer, System, align_up,
};

const INDEX_FIELD_SIZE: usize = size_of::<u32>();

/// Copy `bytes` into a fresh executable allocation
pub fn create_single_executable_stub(system: &dyn System, bytes: &[u8]) -> Result<AllocatedMemory> {
    let cfg = system.control_flow_guard();
    let alignment = cfg.map_or(1, |cfg| cfg.target_alignment_requirement());

    let memory = system.try_allocate(
        &AllocationRequest::new(bytes.len())
            .alignment(alignment)
            .executable(true),
    )?;
    system.patch_data(PatchTargetKind::Executable, memory.base(), bytes, None)?;

    if let Some(cfg) = cfg {
        cfg.register_valid_indirect_call_targets(memory.base(), memory.size(), &[0])?;
    }

    debug!(
        "Created {} byte stub at 0x{:X}",
        bytes.len(),
        memory.base()
    );
    Ok(memory)
}

/// Fill `vtable` with pointers to per-slot copies of `template`.
///
/// The little-endian `u32` at `index_offset` in each copy receives the slot
/// index, multiplied by the pointer size when `premultiply` is set. `vtable`
/// is only written once every allocation has succeeded.
pub fn create_vtable_stubs(
    system: &dyn System,
    vtable: &mut [usize],
    template: &[u8],
    index_offset: usize,
    premultiply: bool,
) -> Result<Vec<AllocatedMemory>> {
    if template.is_empty() || index_offset + INDEX_FIELD_SIZE > template.len() {
        return Err(Error::InvalidArgument(format!(
            "index field at {} does not fit a {} byte stub template",
            index_offset,
            template.len()
        )));
    }
    if vtable.is_empty() {
        return Ok(Vec::new());
    }
    if u32::try_from(slot_index_value(vtable.len() - 1, premultiply)).is_err() {
        return Err(Error::InvalidArgument(format!(
            "{} slots overflow the stub index field",
            vtable.len()
        )));
    }

    let cfg = system.control_flow_guard();
    let mut stub_size = template.len();
    if let Some(cfg) = cfg {
        stub_size = align_up(stub_size, cfg.target_alignment_requirement());
    }

    let per_alloc = system.max_allocation_size() / stub_size;
    if per_alloc == 0 {
        return Err(Error::AllocationFailed {
            size: stub_size,
            alignment: 1,
            message: format!(
                "stub is larger than the maximum allocation of {} bytes",
                system.max_allocation_size()
            ),
        });
    }

    let mut page = ScratchBuffer::rent(per_alloc.min(vtable.len()) * stub_size);
    for stub in page.chunks_exact_mut(stub_size) {
        stub[..template.len()].copy_from_slice(template);
    }

    let alignment = cfg.map_or(size_of::<usize>(), |cfg| cfg.target_alignment_requirement());
    let mut slots = vec![0usize; vtable.len()];
    let mut allocations = Vec::with_capacity(vtable.len().div_ceil(per_alloc));

    for (chunk_index, chunk) in slots.chunks_mut(per_alloc).enumerate() {
        let first_slot = chunk_index * per_alloc;
        let size = chunk.len() * stub_size;
        let memory = system.try_allocate(
            &AllocationRequest::new(size)
                .alignment(alignment)
                .executable(true),
        )?;

        let mut offsets = Vec::with_capacity(chunk.len());
        for (i, slot) in chunk.iter_mut().enumerate() {
            let offset = i * stub_size;
            let field = offset + index_offset;
            let index = slot_index_value(first_slot + i, premultiply) as u32;
            page[field..field + INDEX_FIELD_SIZE].copy_from_slice(&index.to_le_bytes());

            *slot = memory.base() + offset;
            offsets.push(offset);
        }

        system.patch_data(
            PatchTargetKind::Executable,
            memory.base(),
            &page[..size],
            None,
        )?;
        if let Some(cfg) = cfg {
            cfg.register_valid_indirect_call_targets(memory.base(), memory.size(), &offsets)?;
        }
        allocations.push(memory);
    }

    vtable.copy_from_slice(&slots);
    debug!(
        "Created {} vtable stubs of {} bytes in {} allocations",
        vtable.len(),
        stub_size,
        allocations.len()
    );
    Ok(allocations)
}

fn slot_index_value(index: usize, premultiply: bool) -> usize {
    if premultiply {
        index.saturating_mul(size_of::<usize>())
    } else {
        index
    }
}

/// A vtable whose every slot forwards to the same slot of a wrapped object
pub struct VtableProxy {
    table: Box<[usize]>,
    allocations: Vec<AllocatedMemory>,
}

impl VtableProxy {
    pub(crate) fn new(table: Box<[usize]>, allocations: Vec<AllocatedMemory>) -> Self {
        Self { table, allocations }
    }

    /// Address of the first slot; stable for the proxy's lifetime
    pub fn table_address(&self) -> usize {
        self.table.as_ptr() as usize
    }

    pub fn slots(&self) -> &[usize] {
        &self.table
    }

    pub fn slot_count(&self) -> usize {
        self.table.len()
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }
}
