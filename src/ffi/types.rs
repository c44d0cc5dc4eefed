//! FFI Type System
//!
//! Type tags, function signatures and the dynamic values that cross the
//! native call boundary.

use std::ffi::c_void;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use super::FfiError;

/// Largest arity covered by the call dispatch table.
pub const MAX_ARITY: usize = 6;

/// Primitive types a declared signature may mention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    /// 32-bit signed integer (`int`)
    Int32,
    /// 64-bit floating point (`double`)
    Float64,
    /// Null-terminated UTF-8 string (`const char*`)
    Utf8String,
    /// Opaque address issued by the runtime (`void*`)
    Pointer,
    /// No value, return position only
    Void,
}

impl TypeTag {
    /// Every recognized tag, in vocabulary order
    pub const ALL: [TypeTag; 5] = [
        TypeTag::Int32,
        TypeTag::Float64,
        TypeTag::Utf8String,
        TypeTag::Pointer,
        TypeTag::Void,
    ];

    /// Parse a tag from its exact textual name.
    ///
    /// Only `int`, `double`, `string`, `pointer` and `void` are accepted.
    /// Matching is case-sensitive and nothing falls back to `pointer`.
    pub fn parse(name: &str) -> Result<Self, FfiError> {
        match name {
            "int" => Ok(TypeTag::Int32),
            "double" => Ok(TypeTag::Float64),
            "string" => Ok(TypeTag::Utf8String),
            "pointer" => Ok(TypeTag::Pointer),
            "void" => Ok(TypeTag::Void),
            _ => Err(FfiError::UnknownTypeTag(name.to_string())),
        }
    }

    /// The textual name accepted by [`TypeTag::parse`]
    pub fn name(&self) -> &'static str {
        match self {
            TypeTag::Int32 => "int",
            TypeTag::Float64 => "double",
            TypeTag::Utf8String => "string",
            TypeTag::Pointer => "pointer",
            TypeTag::Void => "void",
        }
    }

    /// Whether this tag may appear in argument position
    pub fn is_argument(&self) -> bool {
        !matches!(self, TypeTag::Void)
    }
}

impl FromStr for TypeTag {
    type Err = FfiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TypeTag::parse(s)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A validated function signature. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSignature {
    args: Vec<TypeTag>,
    ret: TypeTag,
}

impl FunctionSignature {
    /// Build a signature from already parsed tags
    pub fn new(args: Vec<TypeTag>, ret: TypeTag) -> Result<Self, FfiError> {
        if let Some(index) = args.iter().position(|t| !t.is_argument()) {
            return Err(FfiError::VoidArgument { index });
        }
        if args.len() > MAX_ARITY {
            return Err(FfiError::TooManyArgs {
                count: args.len(),
                max: MAX_ARITY,
            });
        }
        Ok(Self { args, ret })
    }

    /// Parse argument and return type names into a signature.
    ///
    /// Either every name is recognized or nothing is produced.
    pub fn parse<S: AsRef<str>>(arg_names: &[S], ret_name: &str) -> Result<Self, FfiError> {
        let args = arg_names
            .iter()
            .map(|name| TypeTag::parse(name.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let ret = TypeTag::parse(ret_name)?;
        Self::new(args, ret)
    }

    /// Argument tags in declaration order
    pub fn args(&self) -> &[TypeTag] {
        &self.args
    }

    /// Return tag
    pub fn ret(&self) -> TypeTag {
        self.ret
    }

    /// Number of declared arguments
    pub fn arity(&self) -> usize {
        self.args.len()
    }
}

impl fmt::Display for FunctionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

/// Identity of one runtime, stamped on every pointer it issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuntimeId(u64);

impl RuntimeId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        RuntimeId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// An address handed out by a runtime.
///
/// Only the runtime that issued it accepts it back as a `pointer` argument,
/// so a stray number can never be reinterpreted as an address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpaquePtr {
    addr: usize,
    origin: RuntimeId,
}

impl OpaquePtr {
    pub(crate) fn new(addr: *const c_void, origin: RuntimeId) -> Self {
        Self {
            addr: addr as usize,
            origin,
        }
    }

    pub(crate) fn as_raw(&self) -> *const c_void {
        self.addr as *const c_void
    }

    /// The runtime that issued this pointer
    pub fn origin(&self) -> RuntimeId {
        self.origin
    }

    pub fn is_null(&self) -> bool {
        self.addr == 0
    }
}

impl fmt::Debug for OpaquePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpaquePtr({:#x}, runtime {})", self.addr, self.origin.0)
    }
}

impl fmt::Display for OpaquePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr)
    }
}

/// A dynamically typed value passed to or returned from a native call
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// No value (result of a `void` function)
    Void,
    /// Integer; narrowed to 32 bits when passed as `int`
    Int(i64),
    /// Floating point number
    Float(f64),
    /// Owned text
    Str(String),
    /// Runtime-issued address
    Pointer(OpaquePtr),
}

impl Value {
    /// Short name of the value's kind, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Pointer(_) => "pointer",
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<OpaquePtr> {
        match self {
            Value::Pointer(p) => Some(*p),
            _ => None,
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<OpaquePtr> for Value {
    fn from(v: OpaquePtr) -> Self {
        Value::Pointer(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => write!(f, "void"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{}", s),
            Value::Pointer(p) => write!(f, "{}", p),
        }
    }
}
