//! The platform triple and the operations built on it
//!
//! [`PlatformTriple`] ties an [`Architecture`](crate::arch::Architecture), a
//! [`System`](crate::memory::System) and a [`Runtime`](crate::runtime::Runtime)
//! together. It resolves method entry points, applies detours and builds the
//! glue and stub pages detours between mismatched callables need.

mod detour;
mod fixup;
mod stubs;
mod triple;
mod walk;

pub use detour::{NativeDetour, SimpleNativeDetour};
pub use fixup::{FixupPlan, GlueMethod, GlueOp, GlueParam, plan_abi_fixup};
pub use stubs::{VtableProxy, create_single_executable_stub, create_vtable_stubs};
pub use triple::PlatformTriple;
pub use walk::NO_PRESTUB;
