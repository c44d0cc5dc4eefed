//! Argument Marshaling
//!
//! Turns dynamic values into native-call-ready arguments. String arguments
//! own their null-terminated buffer, so the marshaled list must be kept alive
//! until the native call has returned.

use std::ffi::{c_void, CString};
use std::os::raw::{c_double, c_int};

use super::types::{FunctionSignature, RuntimeId, TypeTag, Value};
use super::FfiError;

/// One argument in native form
#[derive(Debug)]
pub enum MarshaledArg {
    Int(c_int),
    Float(c_double),
    /// Owned, null-terminated copy of the caller's text
    Str(CString),
    Pointer(*const c_void),
}

impl MarshaledArg {
    /// The tag this argument was marshaled for
    pub fn tag(&self) -> TypeTag {
        match self {
            MarshaledArg::Int(_) => TypeTag::Int32,
            MarshaledArg::Float(_) => TypeTag::Float64,
            MarshaledArg::Str(_) => TypeTag::Utf8String,
            MarshaledArg::Pointer(_) => TypeTag::Pointer,
        }
    }
}

/// Convert `values` to native arguments according to `signature`.
///
/// Integers narrow to 32 bits with wrapping; floats passed as `int` truncate
/// toward zero first. Pointers are only accepted from the runtime `origin`.
pub fn marshal(
    values: &[Value],
    signature: &FunctionSignature,
    origin: RuntimeId,
) -> Result<Vec<MarshaledArg>, FfiError> {
    if values.len() != signature.arity() {
        return Err(FfiError::ArityMismatch {
            expected: signature.arity(),
            got: values.len(),
        });
    }

    values
        .iter()
        .zip(signature.args())
        .enumerate()
        .map(|(index, (value, &tag))| marshal_one(index, value, tag, origin))
        .collect()
}

fn marshal_one(
    index: usize,
    value: &Value,
    tag: TypeTag,
    origin: RuntimeId,
) -> Result<MarshaledArg, FfiError> {
    let mismatch = |got: &str| FfiError::ArgumentType {
        index,
        expected: tag,
        got: got.to_string(),
    };

    match (tag, value) {
        (TypeTag::Int32, Value::Int(v)) => Ok(MarshaledArg::Int(*v as c_int)),
        (TypeTag::Int32, Value::Float(v)) => Ok(MarshaledArg::Int(*v as i64 as c_int)),
        (TypeTag::Float64, Value::Float(v)) => Ok(MarshaledArg::Float(*v)),
        (TypeTag::Float64, Value::Int(v)) => Ok(MarshaledArg::Float(*v as c_double)),
        (TypeTag::Utf8String, Value::Str(s)) => CString::new(s.as_bytes())
            .map(MarshaledArg::Str)
            .map_err(|_| mismatch("string with interior NUL byte")),
        (TypeTag::Pointer, Value::Pointer(p)) => {
            if p.origin() != origin {
                return Err(FfiError::ForeignPointer { index });
            }
            Ok(MarshaledArg::Pointer(p.as_raw()))
        }
        (TypeTag::Void, _) => Err(FfiError::VoidArgument { index }),
        (_, other) => Err(mismatch(other.kind())),
    }
}
