//! In-memory address space for tests
//!
//! Regions are plain byte vectors keyed by base address. Allocations, frees,
//! patches and call target registrations are recorded as [`MockEvent`]s so tests
//! can assert on ordering.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::check_cfg_alignment;
use super::reader::ReadMemory;
use super::system::{
    AddressRange, AllocatedMemory, AllocationRequest, ControlFlowGuard, OsKind, PatchTargetKind,
    System, align_up, check_backup,
};
use crate::abi::Abi;
use crate::error::{Error, Result};
use crate::features::SystemFeature;

const DEFAULT_ALLOCATION_BASE: usize = 0x7000_0000;
const ALLOCATION_GAP: usize = 0x1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Allocate(AddressRange),
    Free(AddressRange),
    Patch { address: usize, len: usize },
    RegisterTargets { base: usize, offsets: Vec<usize> },
}

#[derive(Debug, Default)]
struct MockState {
    regions: BTreeMap<usize, Vec<u8>>,
    next_allocation: usize,
    events: Vec<MockEvent>,
}

impl MockState {
    fn region_for(&self, address: usize, len: usize) -> Option<(usize, &Vec<u8>)> {
        let (&base, data) = self.regions.range(..=address).next_back()?;
        (address + len <= base + data.len()).then_some((base, data))
    }

    fn read(&self, address: usize, buffer: &mut [u8]) -> Result<()> {
        let (base, data) = self
            .region_for(address, buffer.len())
            .ok_or_else(|| Error::MemoryReadFailed {
                address,
                message: format!("{} bytes not mapped", buffer.len()),
            })?;
        let start = address - base;
        buffer.copy_from_slice(&data[start..start + buffer.len()]);
        Ok(())
    }

    fn write(&mut self, address: usize, bytes: &[u8]) -> Result<()> {
        let base = self
            .region_for(address, bytes.len())
            .map(|(base, _)| base)
            .ok_or_else(|| Error::MemoryProtectFailed {
                address,
                message: format!("{} bytes not mapped", bytes.len()),
            })?;
        let start = address - base;
        if let Some(data) = self.regions.get_mut(&base) {
            data[start..start + bytes.len()].copy_from_slice(bytes);
        }
        Ok(())
    }

    fn overlaps(&self, range: &AddressRange) -> bool {
        self.regions
            .iter()
            .any(|(&base, data)| base < range.end() && range.base < base + data.len())
    }
}

pub struct MockSystemBuilder {
    regions: Vec<(usize, Vec<u8>)>,
    max_allocation_size: usize,
    cfg_alignment: Option<usize>,
    allocation_base: usize,
    allocation_limit: Option<usize>,
    os: OsKind,
    abi: Option<Abi>,
}

impl Default for MockSystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSystemBuilder {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
            max_allocation_size: 0x10000,
            cfg_alignment: None,
            allocation_base: DEFAULT_ALLOCATION_BASE,
            allocation_limit: None,
            os: OsKind::Linux,
            abi: Some(Abi::system_v_x86_64()),
        }
    }

    pub fn with_region(mut self, base: usize, data: Vec<u8>) -> Self {
        self.regions.push((base, data));
        self
    }

    pub fn max_allocation_size(mut self, size: usize) -> Self {
        self.max_allocation_size = size;
        self
    }

    pub fn control_flow_guard(mut self, alignment: usize) -> Self {
        self.cfg_alignment = Some(alignment);
        self
    }

    pub fn allocation_base(mut self, base: usize) -> Self {
        self.allocation_base = base;
        self
    }

    /// Fail every allocation after the first `count`
    pub fn allocation_limit(mut self, count: usize) -> Self {
        self.allocation_limit = Some(count);
        self
    }

    pub fn os(mut self, os: OsKind, abi: Option<Abi>) -> Self {
        self.os = os;
        self.abi = abi;
        self
    }

    pub fn build(self) -> MockSystem {
        let mut state = MockState {
            next_allocation: self.allocation_base,
            ..Default::default()
        };
        for (base, data) in self.regions {
            state.regions.insert(base, data);
        }
        let state = Arc::new(Mutex::new(state));

        MockSystem {
            cfg: self.cfg_alignment.map(|alignment| MockCfg {
                alignment,
                state: state.clone(),
            }),
            state,
            max_allocation_size: self.max_allocation_size,
            allocation_limit: self.allocation_limit,
            os: self.os,
            abi: self.abi,
        }
    }
}

struct MockCfg {
    alignment: usize,
    state: Arc<Mutex<MockState>>,
}

impl ControlFlowGuard for MockCfg {
    fn target_alignment_requirement(&self) -> usize {
        self.alignment
    }

    fn register_valid_indirect_call_targets(
        &self,
        base: usize,
        len: usize,
        offsets: &[usize],
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.region_for(base, len).is_none() {
            return Err(Error::InvalidArgument(format!(
                "call targets registered for unmapped range 0x{:X}",
                base
            )));
        }
        state.events.push(MockEvent::RegisterTargets {
            base,
            offsets: offsets.to_vec(),
        });
        Ok(())
    }
}

pub struct MockSystem {
    state: Arc<Mutex<MockState>>,
    cfg: Option<MockCfg>,
    max_allocation_size: usize,
    allocation_limit: Option<usize>,
    os: OsKind,
    abi: Option<Abi>,
}

impl MockSystem {
    pub fn bytes_at(&self, address: usize, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.state
            .lock()
            .read(address, &mut buf)
            .map(|_| buf)
            .unwrap_or_default()
    }

    /// Write without recording a patch event
    pub fn poke(&self, address: usize, bytes: &[u8]) {
        let _ = self.state.lock().write(address, bytes);
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    pub fn allocation_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, MockEvent::Allocate(_)))
            .count()
    }

    pub fn live_allocations(&self) -> usize {
        let events = self.events();
        let allocated = events
            .iter()
            .filter(|e| matches!(e, MockEvent::Allocate(_)))
            .count();
        let freed = events
            .iter()
            .filter(|e| matches!(e, MockEvent::Free(_)))
            .count();
        allocated - freed
    }

    pub fn patch_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, MockEvent::Patch { .. }))
            .count()
    }
}

impl ReadMemory for MockSystem {
    fn read_into(&self, address: usize, buffer: &mut [u8]) -> Result<()> {
        self.state.lock().read(address, buffer)
    }
}

impl System for MockSystem {
    fn target(&self) -> OsKind {
        self.os
    }

    fn features(&self) -> SystemFeature {
        let mut features = SystemFeature::RWX_PAGES | SystemFeature::RX_PAGES;
        if self.cfg.is_some() {
            features |= SystemFeature::CONTROL_FLOW_GUARD;
        }
        features
    }

    fn default_abi(&self) -> Option<Abi> {
        self.abi.clone()
    }

    fn max_allocation_size(&self) -> usize {
        self.max_allocation_size
    }

    fn try_allocate(&self, request: &AllocationRequest) -> Result<AllocatedMemory> {
        check_cfg_alignment(self, request)?;
        request.validate()?;
        let fail = |message: &str| Error::AllocationFailed {
            size: request.size,
            alignment: request.alignment,
            message: message.to_string(),
        };

        if request.size > self.max_allocation_size {
            return Err(fail("larger than the maximum allocation size"));
        }

        if self
            .allocation_limit
            .is_some_and(|limit| self.allocation_count() >= limit)
        {
            return Err(fail("allocation limit reached"));
        }

        let mut state = self.state.lock();
        let window = request.low_bound..request.high_bound;
        let start = if window.contains(&state.next_allocation) {
            state.next_allocation
        } else {
            request.low_bound.max(ALLOCATION_GAP)
        };
        let mut base = align_up(start, request.alignment);
        loop {
            let range = AddressRange::new(base, request.size);
            if !request.accepts(&range) {
                return Err(fail("no free range inside the placement window"));
            }
            if !state.overlaps(&range) {
                break;
            }
            base = align_up(base + ALLOCATION_GAP, request.alignment);
        }

        let range = AddressRange::new(base, request.size);
        state.regions.insert(base, vec![0u8; request.size]);
        state.events.push(MockEvent::Allocate(range));
        if base >= state.next_allocation {
            state.next_allocation = align_up(range.end(), ALLOCATION_GAP);
        }

        let shared = self.state.clone();
        Ok(AllocatedMemory::new(range, move |range| {
            let mut state = shared.lock();
            state.regions.remove(&range.base);
            state.events.push(MockEvent::Free(range));
        }))
    }

    fn patch_data(
        &self,
        _kind: PatchTargetKind,
        address: usize,
        data: &[u8],
        backup: Option<&mut [u8]>,
    ) -> Result<()> {
        check_backup(&backup, data.len())?;
        let mut state = self.state.lock();
        if let Some(backup) = backup {
            state.read(address, &mut backup[..data.len()])?;
        }
        state.write(address, data)?;
        state.events.push(MockEvent::Patch {
            address,
            len: data.len(),
        });
        Ok(())
    }

    fn size_of_readable_memory(&self, address: usize, max_probe: usize) -> usize {
        let state = self.state.lock();
        let Some((base, data)) = state.region_for(address, 0) else {
            return 0;
        };

        let mut end = base + data.len();
        while end - address < max_probe {
            match state.regions.get(&end) {
                Some(next) if !next.is_empty() => end += next.len(),
                _ => break,
            }
        }
        (end - address).min(max_probe)
    }

    fn control_flow_guard(&self) -> Option<&dyn ControlFlowGuard> {
        self.cfg.as_ref().map(|cfg| cfg as &dyn ControlFlowGuard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_read_and_patch() {
        let system = MockSystemBuilder::new()
            .with_region(0x1000, vec![1, 2, 3, 4, 5, 6])
            .build();

        let mut backup = [0u8; 2];
        system
            .patch_data(PatchTargetKind::Executable, 0x1002, &[9, 9], Some(&mut backup))
            .unwrap();

        assert_eq!(backup, [3, 4]);
        assert_eq!(system.bytes_at(0x1000, 6), vec![1, 2, 9, 9, 5, 6]);
        assert!(system.read_bytes(0x1004, 4).is_err());
    }

    #[test]
    fn test_mock_readable_size_spans_adjacent_regions() {
        let system = MockSystemBuilder::new()
            .with_region(0x1000, vec![0; 0x10])
            .with_region(0x1010, vec![0; 0x10])
            .with_region(0x1030, vec![0; 0x10])
            .build();

        assert_eq!(system.size_of_readable_memory(0x1008, 0x100), 0x18);
        assert_eq!(system.size_of_readable_memory(0x1008, 4), 4);
        assert_eq!(system.size_of_readable_memory(0x1020, 4), 0);
    }

    #[test]
    fn test_mock_allocation_lifecycle() {
        let system = MockSystemBuilder::new().max_allocation_size(0x100).build();
        let request = AllocationRequest::new(0x40).alignment(0x20).executable(true);

        let mem = system.try_allocate(&request).unwrap();
        assert_eq!(mem.base() % 0x20, 0);
        assert_eq!(system.live_allocations(), 1);
        drop(mem);
        assert_eq!(system.live_allocations(), 0);

        assert!(matches!(
            system.try_allocate(&AllocationRequest::new(0x200)),
            Err(Error::AllocationFailed { .. })
        ));
    }

    #[test]
    fn test_mock_bounded_allocation() {
        let system = MockSystemBuilder::new().build();
        let request = AllocationRequest::new(0x10).near(0x4000_0000, 0x1000);
        let mem = system.try_allocate(&request).unwrap();
        assert!(request.accepts(&mem.range()));

        let unreachable = AllocationRequest::new(0x10).near(0x100, 0x10);
        assert!(system.try_allocate(&unreachable).is_err());
    }

    #[test]
    fn test_cfg_rejects_weakly_aligned_code() {
        let system = MockSystemBuilder::new().control_flow_guard(16).build();

        let weak = AllocationRequest::new(8).alignment(8).executable(true);
        assert!(matches!(
            system.try_allocate(&weak),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(system.live_allocations(), 0);

        let aligned = system
            .try_allocate(&AllocationRequest::new(8).alignment(16).executable(true))
            .unwrap();
        assert_eq!(aligned.base() % 16, 0);

        // Data allocations are not call targets
        assert!(system.try_allocate(&AllocationRequest::new(8).alignment(8)).is_ok());
    }
}
