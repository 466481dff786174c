//! Entry point resolution through runtime thunks
//!
//! Runtimes that compile lazily hand out entry points that are really small
//! stubs: precode that jumps to a fixup routine until the method is compiled,
//! indirections through a slot, or the shared prestub. The walk reads the
//! bytes at the reported entry, matches them against the architecture's known
//! thunk shapes and follows the decoded address until nothing matches.

use tracing::{debug, error, trace, warn};

use super::PlatformTriple;
use crate::error::{Error, Result};
use crate::features::RuntimeFeature;
use crate::memory::ReadMemory;
use crate::runtime::MethodRef;

/// Cached when the prestub could not be identified; never a real entry point
pub const NO_PRESTUB: usize = usize::MAX;

impl PlatformTriple {
    /// Address of the machine code `method` currently runs
    pub fn native_method_body(&self, method: &MethodRef) -> Result<usize> {
        if self
            .features()
            .has_runtime(RuntimeFeature::REQUIRES_BODY_THUNK_WALKING)
        {
            self.walk_method_body(method, true)
        } else {
            self.runtime().method_entry_point(method)
        }
    }

    /// Follow thunks from `method`'s reported entry point.
    ///
    /// With `reload` set, hitting a not-yet-compiled thunk compiles the method
    /// and restarts from its new entry point. Without it the walk only follows
    /// addresses, which is what the prestub probe needs.
    fn walk_method_body(&self, method: &MethodRef, reload: bool) -> Result<usize> {
        let thunks = self.architecture().known_method_thunks();
        let window = match self.config().thunk_read_limit {
            Some(limit) => thunks.max_min_length().min(limit),
            None => thunks.max_min_length(),
        };
        let limit = self.config().walk_iteration_limit;

        let mut iterations = 0;
        let mut prepared_last = false;
        let mut prev_entry = None;

        trace!("Walking method body of {}", method.full_name());

        'reload: loop {
            let mut entry = self.runtime().method_entry_point(method)?;
            trace!("Starting entry point = 0x{:X}", entry);

            loop {
                iterations += 1;
                if iterations > limit {
                    error!(
                        "Could not get entry point for {} (tried {} times) entry: 0x{:X}",
                        method.full_name(),
                        limit,
                        entry
                    );
                    return Err(Error::EntryPointUnstable {
                        method: method.full_name(),
                        iterations: limit,
                    });
                }

                if !prepared_last && prev_entry == Some(entry) {
                    if reload {
                        error!(
                            "Thunk walk for {} looped at 0x{:X}",
                            method.full_name(),
                            entry
                        );
                        return Err(Error::ThunkLoop {
                            method: method.full_name(),
                            entry,
                        });
                    }
                    return Ok(entry);
                }
                prev_entry = Some(entry);

                let readable = self.system().size_of_readable_memory(entry, window);
                if readable == 0 {
                    warn!("Got zero readable length at 0x{:X}", entry);
                    return Ok(entry);
                }
                let code = self.system().read_bytes(entry, readable.min(window))?;

                let Some(found) = thunks.try_find_match(&code) else {
                    return Ok(entry);
                };
                prepared_last = false;

                let meaning = found.pattern.address_meaning();
                trace!(
                    "Matched thunk '{}' at 0x{:X} (addr: 0x{:X}, offset: {})",
                    found.pattern.name(),
                    entry,
                    found.address,
                    found.offset
                );

                let next = meaning.process_address(
                    entry,
                    found.offset,
                    found.address,
                    self.system().as_ref(),
                )?;

                if meaning.kind.is_precode_fixup() && reload {
                    trace!("Method thunk reset; regenerating (fixup: 0x{:X})", next);
                    self.compile(method)?;
                    prepared_last = true;
                    continue 'reload;
                }

                trace!("Got next entry point 0x{:X}", next);
                if reload && next == self.prestub() {
                    trace!("Matched the prestub at 0x{:X}", next);
                    self.compile(method)?;
                    prepared_last = true;
                    continue 'reload;
                }
                entry = next;
            }
        }
    }

    /// Shared prestub address, found once by probing the runtime's candidates
    fn prestub(&self) -> usize {
        *self.prestub.get_or_init(|| self.probe_prestub())
    }

    /// Several methods that are not compiled yet resolve to the same stub; the
    /// first address reached by more than one candidate is taken as the prestub.
    fn probe_prestub(&self) -> usize {
        let mut seen: Vec<(usize, usize)> = Vec::new();

        for candidate in self.runtime().prestub_probe_candidates() {
            match self.walk_method_body(&candidate, false) {
                Ok(address) => match seen.iter_mut().find(|(a, _)| *a == address) {
                    Some((_, count)) => *count += 1,
                    None => seen.push((address, 1)),
                },
                Err(e) => debug!("Skipping prestub candidate {}: {}", candidate.full_name(), e),
            }
        }

        let prestub = seen
            .iter()
            .find(|(_, count)| *count > 1)
            .map_or(NO_PRESTUB, |(address, _)| *address);
        trace!("Prestub: 0x{:X}", prestub);
        prestub
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::Abi;
    use crate::arch::X86_64Arch;
    use crate::config::EngineConfig;
    use crate::memory::{MockSystem, MockSystemBuilder};
    use crate::runtime::{MethodDesc, MockRuntime};
    use std::sync::Arc;

    const BODY: [u8; 8] = [0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20];

    /// `jmp rel32` at `from` landing on `to`, padded with int3
    fn jmp(from: usize, to: usize) -> Vec<u8> {
        let disp = (to as i64 - (from as i64 + 5)) as i32;
        let mut code = vec![0xE9];
        code.extend_from_slice(&disp.to_le_bytes());
        code.resize(24, 0xCC);
        code
    }

    fn body() -> Vec<u8> {
        let mut code = BODY.to_vec();
        code.resize(24, 0xCC);
        code
    }

    fn triple_with(
        system: MockSystem,
        runtime: MockRuntime,
        config: EngineConfig,
    ) -> (Arc<MockRuntime>, PlatformTriple) {
        let system = Arc::new(system);
        let runtime = Arc::new(runtime);
        let arch = Arc::new(X86_64Arch::new(system.clone()).unwrap());
        let triple = PlatformTriple::with_config(arch, system, runtime.clone(), config);
        (runtime, triple)
    }

    fn walker() -> MockRuntime {
        MockRuntime::new(
            RuntimeFeature::REQUIRES_BODY_THUNK_WALKING,
            Abi::system_v_x86_64(),
        )
    }

    #[test]
    fn test_direct_resolution_without_walking() {
        let system = MockSystemBuilder::new()
            .with_region(0x1000, jmp(0x1000, 0x2000))
            .build();
        let runtime = MockRuntime::new(RuntimeFeature::empty(), Abi::system_v_x86_64());
        let (_, triple) = triple_with(system, runtime, EngineConfig::default());

        let method = MethodDesc::new("Run", 0x1000).into_ref();
        assert_eq!(triple.native_method_body(&method).unwrap(), 0x1000);
    }

    #[test]
    fn test_follows_jump_chain() {
        let system = MockSystemBuilder::new()
            .with_region(0x1000, jmp(0x1000, 0x2000))
            .with_region(0x2000, jmp(0x2000, 0x3000))
            .with_region(0x3000, body())
            .build();
        let (_, triple) = triple_with(system, walker(), EngineConfig::default());

        let method = MethodDesc::new("Run", 0x1000).into_ref();
        assert_eq!(triple.native_method_body(&method).unwrap(), 0x3000);
        // no intervening change, same answer
        assert_eq!(triple.native_method_body(&method).unwrap(), 0x3000);
    }

    #[test]
    fn test_follows_indirect_slot() {
        // jmp [rip+0x0FFA] -> slot at 0x2000
        let mut thunk = vec![0xFF, 0x25, 0xFA, 0x0F, 0x00, 0x00];
        thunk.resize(24, 0xCC);
        let system = MockSystemBuilder::new()
            .with_region(0x1000, thunk)
            .with_region(0x2000, 0x3000usize.to_le_bytes().to_vec())
            .with_region(0x3000, body())
            .build();
        let (_, triple) = triple_with(system, walker(), EngineConfig::default());

        let method = MethodDesc::new("Run", 0x1000).into_ref();
        assert_eq!(triple.native_method_body(&method).unwrap(), 0x3000);
    }

    #[test]
    fn test_precode_fixup_triggers_compile() {
        // call rel32 to a fixup routine; pop rsi
        let mut precode = vec![0xE8, 0xFB, 0x7F, 0x00, 0x00, 0x5E];
        precode.resize(24, 0xCC);
        let system = MockSystemBuilder::new()
            .with_region(0x1000, precode)
            .with_region(0x3000, body())
            .build();
        let runtime = walker().with_compiled_entry(0x1000, 0x3000);
        let (runtime, triple) = triple_with(system, runtime, EngineConfig::default());

        let method = MethodDesc::new("Run", 0x1000).into_ref();
        assert_eq!(triple.native_method_body(&method).unwrap(), 0x3000);
        assert_eq!(runtime.compile_count(), 1);
    }

    /// Fixup precode at 0x1000 with its data slots at 0x2000, 0x2008 and 0x2010
    fn fixup_precode() -> Vec<u8> {
        let mut precode = vec![
            0xFF, 0x25, 0xFA, 0x0F, 0x00, 0x00, // jmp [rip+0x0FFA] -> 0x2000
            0x4C, 0x8B, 0x15, 0xFB, 0x0F, 0x00, 0x00, // mov r10, [rip+0x0FFB] -> 0x2008
            0xFF, 0x25, 0xFD, 0x0F, 0x00, 0x00, // jmp [rip+0x0FFD] -> 0x2010
        ];
        precode.resize(24, 0xCC);
        precode
    }

    fn precode_slots(target: usize, fixup: usize) -> Vec<u8> {
        let mut slots = target.to_le_bytes().to_vec();
        slots.extend_from_slice(&0x1000usize.to_le_bytes());
        slots.extend_from_slice(&fixup.to_le_bytes());
        slots
    }

    #[test]
    fn test_compiled_fixup_precode_resolves_to_body() {
        let system = MockSystemBuilder::new()
            .with_region(0x1000, fixup_precode())
            .with_region(0x2000, precode_slots(0x3000, 0x9000))
            .with_region(0x3000, body())
            .build();
        let (runtime, triple) = triple_with(system, walker(), EngineConfig::default());

        let method = MethodDesc::new("Compiled", 0x1000).into_ref();
        assert_eq!(triple.native_method_body(&method).unwrap(), 0x3000);
        assert_eq!(runtime.compile_count(), 0);
    }

    #[test]
    fn test_uncompiled_fixup_precode_compiles_once() {
        // The target slot points back at the precode's own tail
        let system = MockSystemBuilder::new()
            .with_region(0x1000, fixup_precode())
            .with_region(0x2000, precode_slots(0x1006, 0x9000))
            .with_region(0x3000, body())
            .build();
        let runtime = walker().with_compiled_entry(0x1000, 0x3000);
        let (runtime, triple) = triple_with(system, runtime, EngineConfig::default());

        let method = MethodDesc::new("Lazy", 0x1000).into_ref();
        assert_eq!(triple.native_method_body(&method).unwrap(), 0x3000);
        assert_eq!(runtime.compile_count(), 1);
    }

    #[test]
    fn test_unstable_entry_hits_iteration_limit() {
        let mut precode = vec![0xE8, 0xFB, 0x7F, 0x00, 0x00, 0x5E];
        precode.resize(24, 0xCC);
        let system = MockSystemBuilder::new().with_region(0x1000, precode).build();
        let config = EngineConfig::builder().walk_iteration_limit(5).build();
        let (runtime, triple) = triple_with(system, walker(), config);

        let method = MethodDesc::new("Run", 0x1000).into_ref();
        let err = triple.native_method_body(&method).unwrap_err();
        assert!(matches!(err, Error::EntryPointUnstable { iterations: 5, .. }));
        assert_eq!(runtime.compile_count(), 5);
    }

    #[test]
    fn test_self_jump_is_a_loop() {
        let system = MockSystemBuilder::new()
            .with_region(0x1000, jmp(0x1000, 0x1000))
            .build();
        let (_, triple) = triple_with(system, walker(), EngineConfig::default());

        let method = MethodDesc::new("Spin", 0x1000).into_ref();
        let err = triple.native_method_body(&method).unwrap_err();
        assert!(matches!(err, Error::ThunkLoop { entry: 0x1000, .. }));
    }

    #[test]
    fn test_prestub_detected_by_shared_target() {
        let system = MockSystemBuilder::new()
            .with_region(0x1000, jmp(0x1000, 0x9000))
            .with_region(0x5000, jmp(0x5000, 0x9000))
            .with_region(0x5100, jmp(0x5100, 0x9000))
            .with_region(0x5200, jmp(0x5200, 0x6000))
            .with_region(0x6000, body())
            .with_region(0x9000, body())
            .with_region(0x3000, body())
            .build();
        let runtime = walker()
            .with_compiled_entry(0x1000, 0x3000)
            .with_probe_candidates(vec![
                MethodDesc::new("Probe0", 0x5200).into_ref(),
                MethodDesc::new("Probe1", 0x5000).into_ref(),
                MethodDesc::new("Probe2", 0x5100).into_ref(),
            ]);
        let (runtime, triple) = triple_with(system, runtime, EngineConfig::default());

        let method = MethodDesc::new("Run", 0x1000).into_ref();
        assert_eq!(triple.native_method_body(&method).unwrap(), 0x3000);
        assert_eq!(runtime.compile_count(), 1);
        assert_eq!(triple.prestub.get(), Some(&0x9000));
    }

    #[test]
    fn test_prestub_sentinel_without_repeats() {
        let system = MockSystemBuilder::new()
            .with_region(0x1000, jmp(0x1000, 0x9000))
            .with_region(0x9000, body())
            .build();
        let runtime =
            walker().with_probe_candidates(vec![MethodDesc::new("Lonely", 0x9000).into_ref()]);
        let (runtime, triple) = triple_with(system, runtime, EngineConfig::default());

        let method = MethodDesc::new("Run", 0x1000).into_ref();
        assert_eq!(triple.native_method_body(&method).unwrap(), 0x9000);
        assert_eq!(runtime.compile_count(), 0);
        assert_eq!(triple.prestub.get(), Some(&NO_PRESTUB));
    }

    #[test]
    fn test_unreadable_entry_is_returned() {
        let system = MockSystemBuilder::new().build();
        let (_, triple) = triple_with(system, walker(), EngineConfig::default());
        let method = MethodDesc::new("Run", 0xDEAD_0000).into_ref();
        assert_eq!(triple.native_method_body(&method).unwrap(), 0xDEAD_0000);
    }

    #[test]
    fn test_read_limit_hides_long_thunks() {
        let system = MockSystemBuilder::new()
            .with_region(0x1000, jmp(0x1000, 0x2000))
            .with_region(0x2000, body())
            .build();
        let config = EngineConfig::builder().thunk_read_limit(4).build();
        let (_, triple) = triple_with(system, walker(), config);

        let method = MethodDesc::new("Run", 0x1000).into_ref();
        assert_eq!(triple.native_method_body(&method).unwrap(), 0x1000);
    }
}
