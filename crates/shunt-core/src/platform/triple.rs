use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::detour::{NativeDetour, SimpleNativeDetour};
use super::fixup::{FixupPlan, plan_abi_fixup};
use super::stubs::{VtableProxy, create_vtable_stubs};
use crate::abi::Abi;
use crate::arch::{Architecture, ArchitectureKind, create_current_architecture};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::features::{ArchitectureFeature, FeatureFlags, RuntimeFeature};
use crate::memory::{OsKind, System, create_current_system};
use crate::runtime::{MethodPin, MethodRef, NativeRuntime, Runtime, RuntimeKind};

static CURRENT: OnceCell<Arc<PlatformTriple>> = OnceCell::new();

/// One [`Architecture`], one [`System`] and one [`Runtime`] working together
pub struct PlatformTriple {
    arch: Arc<dyn Architecture>,
    system: Arc<dyn System>,
    runtime: Arc<dyn Runtime>,
    features: FeatureFlags,
    abi: Abi,
    config: EngineConfig,
    /// Address the runtime's shared prestub resolved to, or the sentinel
    pub(super) prestub: OnceCell<usize>,
}

impl PlatformTriple {
    pub fn new(
        arch: Arc<dyn Architecture>,
        system: Arc<dyn System>,
        runtime: Arc<dyn Runtime>,
    ) -> Self {
        Self::with_config(arch, system, runtime, EngineConfig::default())
    }

    pub fn with_config(
        arch: Arc<dyn Architecture>,
        system: Arc<dyn System>,
        runtime: Arc<dyn Runtime>,
        config: EngineConfig,
    ) -> Self {
        let features = FeatureFlags::new(arch.features(), system.features(), runtime.features());
        let abi = runtime.abi().clone();
        debug!(
            "Platform triple {}/{}/{} with features {}",
            arch.target(),
            system.target(),
            runtime.target(),
            features
        );

        Self {
            arch,
            system,
            runtime,
            features,
            abi,
            config,
            prestub: OnceCell::new(),
        }
    }

    /// Build a triple for the host from `SHUNT_*` configuration
    pub fn create_current() -> Result<Self> {
        Self::create_with_config(EngineConfig::from_env()?)
    }

    pub fn create_with_config(config: EngineConfig) -> Result<Self> {
        let system = create_current_system()?;
        let arch = create_current_architecture(system.clone())?;
        let runtime: Arc<dyn Runtime> = match config.runtime {
            RuntimeKind::Native => Arc::new(NativeRuntime::new(system.clone())?),
            other => {
                return Err(Error::PlatformNotSupported(format!(
                    "runtime {} must be supplied by the host",
                    other
                )));
            }
        };
        Ok(Self::with_config(arch, system, runtime, config))
    }

    /// The process-wide triple, created from the host on first use
    pub fn current() -> Result<Arc<Self>> {
        CURRENT
            .get_or_try_init(|| Self::create_current().map(Arc::new))
            .cloned()
    }

    /// Install `triple` as the process-wide triple.
    ///
    /// Fails once a triple exists, whether set here or created by [`PlatformTriple::current`].
    pub fn set_current(triple: Arc<Self>) -> Result<()> {
        CURRENT
            .set(triple)
            .map_err(|_| Error::TripleAlreadyInitialized)
    }

    pub fn architecture(&self) -> &Arc<dyn Architecture> {
        &self.arch
    }

    pub fn system(&self) -> &Arc<dyn System> {
        &self.system
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    pub fn features(&self) -> FeatureFlags {
        self.features
    }

    pub fn abi(&self) -> &Abi {
        &self.abi
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn host_triple(&self) -> (ArchitectureKind, OsKind, RuntimeKind) {
        (self.arch.target(), self.system.target(), self.runtime.target())
    }

    /// Make the runtime compile `method`
    pub fn compile(&self, method: &MethodRef) -> Result<()> {
        if method.is_generic_definition {
            return Err(Error::InvalidArgument(format!(
                "cannot compile generic definition {}",
                method.full_name()
            )));
        }
        let method = self.identifiable(method);
        trace!("Compiling {}", method.full_name());
        self.runtime.compile(&method)
    }

    pub fn identifiable(&self, method: &MethodRef) -> MethodRef {
        if self
            .features
            .has_runtime(RuntimeFeature::REQUIRES_METHOD_IDENTIFICATION)
        {
            self.runtime.identifiable(method)
        } else {
            method.clone()
        }
    }

    pub fn pin_method_if_needed(&self, method: &MethodRef) -> Result<Option<MethodPin>> {
        if self
            .features
            .has_runtime(RuntimeFeature::REQUIRES_METHOD_PINNING)
        {
            self.runtime.pin_method(method)
        } else {
            Ok(None)
        }
    }

    /// Returns whether the runtime was able to disable inlining.
    pub fn try_disable_inlining(&self, method: &MethodRef) -> Result<bool> {
        if self.features.has_runtime(RuntimeFeature::DISABLE_INLINING) {
            self.runtime.disable_inlining(method)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Redirect `from` to `to`.
    ///
    /// `from_rw` is a writable alias of `from` to patch instead, when code is
    /// mapped twice.
    pub fn create_simple_detour(
        &self,
        from: usize,
        to: usize,
        max_size: Option<usize>,
        from_rw: Option<usize>,
    ) -> Result<SimpleNativeDetour> {
        if from == to {
            return Err(Error::SelfDetour { address: from });
        }
        trace!("Creating simple detour 0x{:X} -> 0x{:X}", from, to);

        let info = self.arch.compute_detour_info(from, to, max_size)?;
        SimpleNativeDetour::apply(
            self.system.clone(),
            self.arch.clone(),
            info,
            from_rw.unwrap_or(from),
        )
    }

    /// Like [`PlatformTriple::create_simple_detour`], also keeping the original
    /// code reachable through an alternate entry point when possible
    pub fn create_native_detour(
        &self,
        from: usize,
        to: usize,
        max_size: Option<usize>,
        from_rw: Option<usize>,
    ) -> Result<NativeDetour> {
        if from == to {
            return Err(Error::SelfDetour { address: from });
        }
        trace!("Creating native detour 0x{:X} -> 0x{:X}", from, to);

        let info = self.arch.compute_detour_info(from, to, max_size)?;

        let alt = if !self.config.create_alt_entry {
            None
        } else if let (true, Some(factory)) = (
            self.features
                .has_architecture(ArchitectureFeature::CREATE_ALT_ENTRY_POINT),
            self.arch.alt_entry_factory(),
        ) {
            match factory.create_alternate_entrypoint(from, info.size) {
                Ok(alt) => Some(alt),
                Err(e) => {
                    warn!("No alternate entry point for 0x{:X}: {}", from, e);
                    None
                }
            }
        } else {
            warn!(
                "Cannot create alternate entry point for native detour (from: 0x{:X}, to: 0x{:X})",
                from, to
            );
            None
        };

        let simple = SimpleNativeDetour::apply(
            self.system.clone(),
            self.arch.clone(),
            info,
            from_rw.unwrap_or(from),
        )?;
        Ok(NativeDetour::new(simple, alt))
    }

    /// Method to actually detour `from` to: `to` itself, or glue fixing up the ABI
    pub fn real_detour_target(&self, from: &MethodRef, to: &MethodRef) -> Result<MethodRef> {
        let to = self.identifiable(to);
        let requires_context = self.runtime.requires_generic_context(from);

        match plan_abi_fixup(&self.abi, from, &to, requires_context)? {
            FixupPlan::Direct => Ok(to),
            FixupPlan::Glue(glue) => self.runtime.emit_glue(&glue),
        }
    }

    /// Build a vtable of `slot_count` slots that each forward to the same slot
    /// of the object stored at `this + pointer size`
    pub fn create_vtable_proxy(&self, slot_count: usize) -> Result<VtableProxy> {
        let stub = self.arch.vtable_proxy_stub().ok_or_else(|| {
            Error::PlatformNotSupported(format!(
                "no vtable proxy stub for {}",
                self.arch.target()
            ))
        })?;

        let mut table = vec![0usize; slot_count].into_boxed_slice();
        let allocations = create_vtable_stubs(
            self.system.as_ref(),
            &mut table,
            &stub.template,
            stub.index_offset,
            stub.premultiplied,
        )?;
        Ok(VtableProxy::new(table, allocations))
    }
}
