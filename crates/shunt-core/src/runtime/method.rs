//! Runtime-neutral description of callables and the types in their signatures

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeRef {
    Void,
    Primitive { name: String, size: usize },
    Pointer,
    /// Managed reference type, passed as a single pointer
    Object(String),
    /// By-reference view (`&T`) of another type
    ByRef(Box<TypeRef>),
    /// Value type laid out inline
    Struct { name: String, size: usize },
}

impl TypeRef {
    pub fn primitive(name: impl Into<String>, size: usize) -> Self {
        TypeRef::Primitive {
            name: name.into(),
            size,
        }
    }

    pub fn i32() -> Self {
        Self::primitive("i32", 4)
    }

    pub fn i64() -> Self {
        Self::primitive("i64", 8)
    }

    pub fn f64() -> Self {
        Self::primitive("f64", 8)
    }

    pub fn native_int() -> Self {
        Self::primitive("nint", size_of::<usize>())
    }

    pub fn structure(name: impl Into<String>, size: usize) -> Self {
        TypeRef::Struct {
            name: name.into(),
            size,
        }
    }

    pub fn object(name: impl Into<String>) -> Self {
        TypeRef::Object(name.into())
    }

    pub fn by_ref(self) -> Self {
        TypeRef::ByRef(Box::new(self))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, TypeRef::Void)
    }

    /// Size of a value of this type when passed by value
    pub fn size(&self) -> usize {
        match self {
            TypeRef::Void => 0,
            TypeRef::Primitive { size, .. } | TypeRef::Struct { size, .. } => *size,
            TypeRef::Pointer | TypeRef::Object(_) | TypeRef::ByRef(_) => size_of::<usize>(),
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Void => write!(f, "void"),
            TypeRef::Primitive { name, .. } | TypeRef::Struct { name, .. } => write!(f, "{}", name),
            TypeRef::Pointer => write!(f, "ptr"),
            TypeRef::Object(name) => write!(f, "{}", name),
            TypeRef::ByRef(inner) => write!(f, "&{}", inner),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDesc {
    /// Runtime handle; the entry address for native functions
    pub handle: usize,
    pub name: String,
    pub declaring_type: Option<String>,
    pub is_static: bool,
    pub is_constructor: bool,
    /// Instantiation of a generic method
    pub is_generic: bool,
    /// Open generic definition; cannot be compiled or detoured to
    pub is_generic_definition: bool,
    pub params: Vec<TypeRef>,
    pub return_type: TypeRef,
}

pub type MethodRef = Arc<MethodDesc>;

impl MethodDesc {
    /// A static function with no parameters returning nothing
    pub fn new(name: impl Into<String>, handle: usize) -> Self {
        Self {
            handle,
            name: name.into(),
            declaring_type: None,
            is_static: true,
            is_constructor: false,
            is_generic: false,
            is_generic_definition: false,
            params: Vec::new(),
            return_type: TypeRef::Void,
        }
    }

    pub fn instance_of(mut self, declaring_type: impl Into<String>) -> Self {
        self.declaring_type = Some(declaring_type.into());
        self.is_static = false;
        self
    }

    pub fn declared_on(mut self, declaring_type: impl Into<String>) -> Self {
        self.declaring_type = Some(declaring_type.into());
        self
    }

    pub fn with_params(mut self, params: Vec<TypeRef>) -> Self {
        self.params = params;
        self
    }

    pub fn returning(mut self, return_type: TypeRef) -> Self {
        self.return_type = return_type;
        self
    }

    pub fn generic(mut self) -> Self {
        self.is_generic = true;
        self
    }

    pub fn generic_definition(mut self) -> Self {
        self.is_generic = true;
        self.is_generic_definition = true;
        self
    }

    pub fn constructor(mut self) -> Self {
        self.is_constructor = true;
        self.is_static = false;
        self
    }

    pub fn into_ref(self) -> MethodRef {
        Arc::new(self)
    }

    /// Type of the implicit `this` argument
    pub fn this_type(&self) -> Option<TypeRef> {
        if self.is_static {
            return None;
        }
        Some(TypeRef::object(
            self.declaring_type.as_deref().unwrap_or("object"),
        ))
    }

    pub fn full_name(&self) -> String {
        match &self.declaring_type {
            Some(ty) => format!("{}::{}", ty, self.name),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for MethodDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.full_name())?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", param)?;
        }
        write!(f, ") -> {}", self.return_type)
    }
}
