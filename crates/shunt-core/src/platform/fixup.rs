//! ABI fixup glue
//!
//! Redirecting a method to a replacement with a different calling shape needs a
//! small forwarding routine when the two conventions disagree on argument
//! placement. The routine is described here as a [`GlueMethod`], a short
//! instruction list the runtime turns into callable code.

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::abi::{Abi, SpecialArgumentKind, TypeClassification};
use crate::error::{Error, Result};
use crate::runtime::{MethodRef, TypeRef};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlueParam {
    pub kind: SpecialArgumentKind,
    pub ty: TypeRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlueOp {
    /// Push parameter `n` of the glue method
    LoadArg(usize),
    /// Call the target with the pushed arguments
    Call,
    /// Store the call result through the pointer pushed before it
    StoreIndirect(TypeRef),
    /// Push the return buffer pointer as the glue's own result
    LoadReturnBuffer(usize),
    Return,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlueMethod {
    pub name: String,
    pub return_type: TypeRef,
    pub params: Vec<GlueParam>,
    pub body: Vec<GlueOp>,
    /// Handle of the method the glue calls
    pub target: usize,
}

impl GlueMethod {
    /// Parameters as the caller passes them, without slot tags
    pub fn param_types(&self) -> Vec<&TypeRef> {
        self.params.iter().map(|p| &p.ty).collect()
    }

    pub fn position_of(&self, kind: SpecialArgumentKind) -> Option<usize> {
        self.params.iter().position(|p| p.kind == kind)
    }
}

/// Outcome of checking a `from`/`to` pair against the ABI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixupPlan {
    /// The target can be called directly
    Direct,
    Glue(GlueMethod),
}

/// Decide whether detouring `from` to `to` needs glue and build it if so.
///
/// `requires_generic_context` is the runtime's answer for `from`.
pub fn plan_abi_fixup(
    abi: &Abi,
    from: &MethodRef,
    to: &MethodRef,
    requires_generic_context: bool,
) -> Result<FixupPlan> {
    if to.is_generic_definition {
        return Err(Error::InvalidArgument(format!(
            "cannot detour to open generic definition {}",
            to.full_name()
        )));
    }
    if from.is_constructor || to.is_constructor {
        return Ok(FixupPlan::Direct);
    }

    let return_type = &from.return_type;
    let has_return_buffer = abi.classify(return_type, true) == TypeClassification::ByReference
        && abi.has_slot(SpecialArgumentKind::ReturnBuffer);
    let has_this = !from.is_static;
    let needs_return_buffer_fixup = has_this && to.is_static && has_return_buffer;
    let needs_generic_context_fixup =
        abi.has_slot(SpecialArgumentKind::GenericContext) && requires_generic_context;

    if !needs_return_buffer_fixup && !needs_generic_context_fixup {
        return Ok(FixupPlan::Direct);
    }

    let return_buffer_type = if has_return_buffer {
        return_type.clone().by_ref()
    } else {
        return_type.clone()
    };
    let glue_return_type = if has_return_buffer && !abi.returns_return_buffer {
        TypeRef::Void
    } else {
        return_buffer_type.clone()
    };

    let mut params = Vec::with_capacity(from.params.len() + 3);
    let mut this_pos = None;
    let mut return_buffer_pos = None;
    let mut user_offset = None;

    for kind in &abi.argument_order {
        match kind {
            SpecialArgumentKind::ThisPointer if has_this => {
                this_pos = Some(params.len());
                params.push(GlueParam {
                    kind: *kind,
                    ty: from.this_type().unwrap_or(TypeRef::Pointer),
                });
            }
            SpecialArgumentKind::ReturnBuffer if has_return_buffer => {
                return_buffer_pos = Some(params.len());
                params.push(GlueParam {
                    kind: *kind,
                    ty: return_buffer_type.clone(),
                });
            }
            SpecialArgumentKind::GenericContext if needs_generic_context_fixup => {
                // Accepted from the caller and dropped; the target keeps its own context.
                params.push(GlueParam {
                    kind: *kind,
                    ty: TypeRef::native_int(),
                });
            }
            SpecialArgumentKind::UserArguments => {
                user_offset = Some(params.len());
                params.extend(from.params.iter().map(|ty| GlueParam {
                    kind: *kind,
                    ty: ty.clone(),
                }));
            }
            _ => {}
        }
    }

    let user_offset = user_offset.ok_or_else(|| {
        Error::InvalidArgument("ABI argument order has no user argument slot".to_string())
    })?;

    if needs_generic_context_fixup {
        warn!(
            "Discarding generic context of {}; generic type arguments seen by {} may not match the caller",
            from.full_name(),
            to.full_name()
        );
    }

    let mut body = Vec::new();
    if let Some(pos) = return_buffer_pos {
        body.push(GlueOp::LoadArg(pos));
    }
    if let Some(pos) = this_pos {
        body.push(GlueOp::LoadArg(pos));
    }
    body.extend((0..from.params.len()).map(|i| GlueOp::LoadArg(user_offset + i)));
    body.push(GlueOp::Call);
    if let Some(pos) = return_buffer_pos {
        body.push(GlueOp::StoreIndirect(return_type.clone()));
        if abi.returns_return_buffer {
            body.push(GlueOp::LoadReturnBuffer(pos));
        }
    }
    body.push(GlueOp::Return);

    let glue = GlueMethod {
        name: format!("Glue:AbiFixup<{},{}>", from.full_name(), to.full_name()),
        return_type: glue_return_type,
        params,
        body,
        target: to.handle,
    };
    trace!("Planned {} with {} parameters", glue.name, glue.params.len());
    Ok(FixupPlan::Glue(glue))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MethodDesc;

    fn big() -> TypeRef {
        TypeRef::structure("Big", 24)
    }

    #[test]
    fn test_instance_to_static_swaps_this_and_return_buffer() {
        let abi = Abi::system_v_x86_64();
        let from = MethodDesc::new("Get", 0x1000)
            .instance_of("Holder")
            .with_params(vec![TypeRef::i32()])
            .returning(big())
            .into_ref();
        let to = MethodDesc::new("GetHook", 0x2000)
            .with_params(vec![TypeRef::object("Holder"), TypeRef::i32()])
            .returning(big())
            .into_ref();

        let FixupPlan::Glue(glue) = plan_abi_fixup(&abi, &from, &to, false).unwrap() else {
            panic!("expected glue");
        };

        let kinds: Vec<_> = glue.params.iter().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SpecialArgumentKind::ThisPointer,
                SpecialArgumentKind::ReturnBuffer,
                SpecialArgumentKind::UserArguments,
            ]
        );
        assert_eq!(
            glue.body,
            vec![
                GlueOp::LoadArg(1),
                GlueOp::LoadArg(0),
                GlueOp::LoadArg(2),
                GlueOp::Call,
                GlueOp::StoreIndirect(big()),
                GlueOp::LoadReturnBuffer(1),
                GlueOp::Return,
            ]
        );
        assert_eq!(glue.return_type, big().by_ref());
        assert_eq!(glue.target, 0x2000);
    }

    #[test]
    fn test_compatible_pair_is_direct() {
        let abi = Abi::win64();
        let from = MethodDesc::new("Add", 0x1000)
            .instance_of("Calc")
            .with_params(vec![TypeRef::i32()])
            .returning(TypeRef::i64())
            .into_ref();
        let to = MethodDesc::new("AddHook", 0x2000).into_ref();

        assert_eq!(plan_abi_fixup(&abi, &from, &to, false).unwrap(), FixupPlan::Direct);
    }

    #[test]
    fn test_instance_to_instance_needs_no_swap() {
        let abi = Abi::system_v_x86_64();
        let from = MethodDesc::new("Get", 0x1000)
            .instance_of("A")
            .returning(big())
            .into_ref();
        let to = MethodDesc::new("Get", 0x2000)
            .instance_of("B")
            .returning(big())
            .into_ref();
        assert_eq!(plan_abi_fixup(&abi, &from, &to, false).unwrap(), FixupPlan::Direct);
    }

    #[test]
    fn test_generic_context_is_accepted_and_dropped() {
        let abi = Abi::system_v_x86_64();
        let from = MethodDesc::new("Map", 0x1000)
            .generic()
            .with_params(vec![TypeRef::i32(), TypeRef::i64()])
            .returning(TypeRef::i32())
            .into_ref();
        let to = MethodDesc::new("MapHook", 0x2000).into_ref();

        let FixupPlan::Glue(glue) = plan_abi_fixup(&abi, &from, &to, true).unwrap() else {
            panic!("expected glue");
        };
        assert_eq!(glue.position_of(SpecialArgumentKind::GenericContext), Some(0));
        assert_eq!(glue.params.len(), 3);
        assert_eq!(
            glue.body,
            vec![GlueOp::LoadArg(1), GlueOp::LoadArg(2), GlueOp::Call, GlueOp::Return]
        );
        assert_eq!(glue.return_type, TypeRef::i32());
    }

    #[test]
    fn test_return_buffer_without_pointer_return() {
        let mut abi = Abi::system_v_x86_64();
        abi.returns_return_buffer = false;
        let from = MethodDesc::new("Get", 0x1000)
            .instance_of("Holder")
            .returning(big())
            .into_ref();
        let to = MethodDesc::new("GetHook", 0x2000).returning(big()).into_ref();

        let FixupPlan::Glue(glue) = plan_abi_fixup(&abi, &from, &to, false).unwrap() else {
            panic!("expected glue");
        };
        assert_eq!(glue.return_type, TypeRef::Void);
        assert!(!glue.body.iter().any(|op| matches!(op, GlueOp::LoadReturnBuffer(_))));
    }

    #[test]
    fn test_aapcs64_return_buffer_outside_argument_order() {
        let abi = Abi::aapcs64();
        let from = MethodDesc::new("Get", 0x1000)
            .instance_of("Holder")
            .returning(big())
            .into_ref();
        let to = MethodDesc::new("GetHook", 0x2000).returning(big()).into_ref();
        assert_eq!(plan_abi_fixup(&abi, &from, &to, false).unwrap(), FixupPlan::Direct);
    }

    #[test]
    fn test_rejects_open_generic_target() {
        let abi = Abi::system_v_x86_64();
        let from = MethodDesc::new("Map", 0x1000).into_ref();
        let to = MethodDesc::new("MapHook", 0x2000).generic_definition().into_ref();
        assert!(matches!(
            plan_abi_fixup(&abi, &from, &to, false),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_constructors_pass_through() {
        let abi = Abi::system_v_x86_64();
        let from = MethodDesc::new(".ctor", 0x1000)
            .constructor()
            .returning(big())
            .into_ref();
        let to = MethodDesc::new("CtorHook", 0x2000).returning(big()).into_ref();
        assert_eq!(plan_abi_fixup(&abi, &from, &to, true).unwrap(), FixupPlan::Direct);
    }
}
