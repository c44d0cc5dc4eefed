//! Call Dispatcher
//!
//! A native function's parameter layout is fixed by its arity and the
//! primitive kind of each parameter, so every call goes through a path that
//! places each argument individually with its real type. Arguments come in
//! three physical kinds (`c_int`, `c_double`, pointer; strings travel as
//! pointers) and returns in four (`void`, `c_int`, `c_double`, pointer), which
//! makes the table finite: `sum(3^n for n in 0..=MAX_ARITY)` argument
//! patterns times four returns. The `expand_slots!` macro enumerates it.

use std::ffi::{c_void, CStr};
use std::mem;
use std::os::raw::{c_char, c_double, c_int};

use log::trace;

use super::marshal::MarshaledArg;
use super::types::{OpaquePtr, RuntimeId, TypeTag, Value, MAX_ARITY};
use super::FfiError;

/// Number of distinct argument patterns covered for each return kind
pub const ARGUMENT_PATTERNS: usize = {
    let mut total = 0;
    let mut per_arity = 1;
    let mut n = 0;
    while n <= MAX_ARITY {
        total += per_arity;
        per_arity *= 3;
        n += 1;
    }
    total
};

/// A marshaled argument reduced to its physical kind
#[derive(Clone, Copy)]
enum Slot {
    I32(c_int),
    F64(c_double),
    Ptr(*const c_void),
}

impl Slot {
    fn of(arg: &MarshaledArg) -> Self {
        match arg {
            MarshaledArg::Int(v) => Slot::I32(*v),
            MarshaledArg::Float(v) => Slot::F64(*v),
            MarshaledArg::Str(buf) => Slot::Ptr(buf.as_ptr() as *const c_void),
            MarshaledArg::Pointer(p) => Slot::Ptr(*p),
        }
    }
}

// One direct call per arity. The parameter and return types are picked by the
// caller, so each instantiation is a distinct native call shape.

unsafe fn call0<R>(addr: *const c_void) -> R {
    let f: unsafe extern "C" fn() -> R = mem::transmute_copy(&addr);
    f()
}

unsafe fn call1<A, R>(addr: *const c_void, a: A) -> R {
    let f: unsafe extern "C" fn(A) -> R = mem::transmute_copy(&addr);
    f(a)
}

unsafe fn call2<A, B, R>(addr: *const c_void, a: A, b: B) -> R {
    let f: unsafe extern "C" fn(A, B) -> R = mem::transmute_copy(&addr);
    f(a, b)
}

unsafe fn call3<A, B, C, R>(addr: *const c_void, a: A, b: B, c: C) -> R {
    let f: unsafe extern "C" fn(A, B, C) -> R = mem::transmute_copy(&addr);
    f(a, b, c)
}

unsafe fn call4<A, B, C, D, R>(addr: *const c_void, a: A, b: B, c: C, d: D) -> R {
    let f: unsafe extern "C" fn(A, B, C, D) -> R = mem::transmute_copy(&addr);
    f(a, b, c, d)
}

unsafe fn call5<A, B, C, D, E, R>(addr: *const c_void, a: A, b: B, c: C, d: D, e: E) -> R {
    let f: unsafe extern "C" fn(A, B, C, D, E) -> R = mem::transmute_copy(&addr);
    f(a, b, c, d, e)
}

#[allow(clippy::too_many_arguments)]
unsafe fn call6<A, B, C, D, E, F, R>(
    addr: *const c_void,
    a: A,
    b: B,
    c: C,
    d: D,
    e: E,
    f: F,
) -> R {
    let func: unsafe extern "C" fn(A, B, C, D, E, F) -> R = mem::transmute_copy(&addr);
    func(a, b, c, d, e, f)
}

/// Peel one slot at a time, rebinding it to its concrete type, until all
/// slots are bound; then emit the direct call with the bound values.
macro_rules! expand_slots {
    ($call:ident($addr:ident) [$($bound:ident)*] []) => {
        $call($addr $(, $bound)*)
    };
    ($call:ident($addr:ident) [$($bound:ident)*] [$next:ident $($rest:ident)*]) => {
        match $next {
            Slot::I32($next) => expand_slots!($call($addr) [$($bound)* $next] [$($rest)*]),
            Slot::F64($next) => expand_slots!($call($addr) [$($bound)* $next] [$($rest)*]),
            Slot::Ptr($next) => expand_slots!($call($addr) [$($bound)* $next] [$($rest)*]),
        }
    };
}

/// Select the call path for the slot pattern and perform the call with
/// return type `R`.
unsafe fn dispatch<R>(addr: *const c_void, slots: &[Slot]) -> Result<R, FfiError> {
    let result = match *slots {
        [] => call0(addr),
        [a] => expand_slots!(call1(addr) [] [a]),
        [a, b] => expand_slots!(call2(addr) [] [a b]),
        [a, b, c] => expand_slots!(call3(addr) [] [a b c]),
        [a, b, c, d] => expand_slots!(call4(addr) [] [a b c d]),
        [a, b, c, d, e] => expand_slots!(call5(addr) [] [a b c d e]),
        [a, b, c, d, e, f] => expand_slots!(call6(addr) [] [a b c d e f]),
        _ => {
            return Err(FfiError::TooManyArgs {
                count: slots.len(),
                max: MAX_ARITY,
            })
        }
    };
    Ok(result)
}

/// Call the native function at `addr` and convert its result per `ret`.
///
/// Returned strings are copied out before this returns, while the argument
/// buffers they may point into are still alive. A null string becomes the
/// empty string, and bytes that are not valid UTF-8 are replaced with
/// U+FFFD rather than reported. Returned addresses are issued as pointers of
/// runtime `origin`.
///
/// # Safety
///
/// `addr` must be a live function whose real signature matches the argument
/// tags of `args` and `ret`. A mismatch, or a crash inside the callee, is
/// undefined behavior that this layer cannot detect or recover from.
pub unsafe fn invoke(
    addr: *const c_void,
    args: &[MarshaledArg],
    ret: TypeTag,
    origin: RuntimeId,
) -> Result<Value, FfiError> {
    if args.len() > MAX_ARITY {
        return Err(FfiError::TooManyArgs {
            count: args.len(),
            max: MAX_ARITY,
        });
    }

    let mut slots = [Slot::I32(0); MAX_ARITY];
    for (slot, arg) in slots.iter_mut().zip(args) {
        *slot = Slot::of(arg);
    }
    let slots = &slots[..args.len()];
    trace!("native call {:p} with {} args -> {}", addr, args.len(), ret);

    let value = match ret {
        TypeTag::Void => {
            dispatch::<()>(addr, slots)?;
            Value::Void
        }
        TypeTag::Int32 => Value::Int(i64::from(dispatch::<c_int>(addr, slots)?)),
        TypeTag::Float64 => Value::Float(dispatch::<c_double>(addr, slots)?),
        TypeTag::Utf8String => {
            let raw = dispatch::<*const c_void>(addr, slots)? as *const c_char;
            if raw.is_null() {
                Value::Str(String::new())
            } else {
                Value::Str(CStr::from_ptr(raw).to_string_lossy().into_owned())
            }
        }
        TypeTag::Pointer => Value::Pointer(OpaquePtr::new(
            dispatch::<*const c_void>(addr, slots)?,
            origin,
        )),
    };

    Ok(value)
}
