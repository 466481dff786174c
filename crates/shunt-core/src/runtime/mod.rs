//! Execution engine collaborators
//!
//! A [`Runtime`] knows how the engine hosting the detoured methods lays them
//! out: where a method's entry point lives, how to force compilation and which
//! calling convention compiled code follows. Managed engines are supplied by
//! the host; [`NativeRuntime`] covers plain native functions.

mod method;
#[cfg(test)]
pub mod mock;
mod native;

use serde::{Deserialize, Serialize};
use std::any::Any;
use strum::{Display, EnumString, IntoStaticStr};

pub use method::{MethodDesc, MethodRef, TypeRef};
#[cfg(test)]
pub use mock::MockRuntime;
pub use native::NativeRuntime;

use crate::abi::Abi;
use crate::error::{Error, Result};
use crate::features::RuntimeFeature;
use crate::platform::GlueMethod;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Display,
    EnumString,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Native,
    CoreClr,
    Mono,
    Framework,
}

/// Keeps a method pinned while alive
pub type MethodPin = Box<dyn Any + Send + Sync>;

/// Virtual table coordinates of the JIT interface for one runtime version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VtableLayout {
    /// Slot of the hooked method
    pub slot_index: usize,
    /// Total number of slots in the interface
    pub slot_count: usize,
}

pub trait Runtime: Send + Sync {
    fn target(&self) -> RuntimeKind;

    fn features(&self) -> RuntimeFeature;

    fn abi(&self) -> &Abi;

    /// Entry address the runtime currently reports for `method`
    fn method_entry_point(&self, method: &MethodRef) -> Result<usize>;

    /// Force `method` to be compiled so its entry point is final.
    fn compile(&self, method: &MethodRef) -> Result<()>;

    /// Canonical reference for `method`, comparable with [`std::sync::Arc::ptr_eq`]
    fn identifiable(&self, method: &MethodRef) -> MethodRef {
        method.clone()
    }

    /// Whether calls to `method` carry an implicit generic context argument
    fn requires_generic_context(&self, method: &MethodRef) -> bool;

    fn pin_method(&self, _method: &MethodRef) -> Result<Option<MethodPin>> {
        Ok(None)
    }

    fn disable_inlining(&self, _method: &MethodRef) -> Result<()> {
        Ok(())
    }

    /// Turn a glue description into a callable method.
    fn emit_glue(&self, glue: &GlueMethod) -> Result<MethodRef> {
        Err(Error::GlueUnsupported(glue.name.clone()))
    }

    /// Methods expected to still point at the shared prestub when first walked
    fn prestub_probe_candidates(&self) -> Vec<MethodRef> {
        Vec::new()
    }

    fn jit_vtable_layout(&self) -> Option<VtableLayout> {
        None
    }
}
