//! FFI Module
//!
//! Typed dynamic invocation of native library functions whose signatures are
//! only known at run time.
//!
//! # Architecture
//!
//! ```text
//! Runtime::open(path)                 handle table (loader.rs, registry.rs)
//!       │
//!       ▼
//! Runtime::declare(handle, sym, [..], ret)
//!       │   parse type tags            (types.rs)
//!       │   resolve symbol once
//!       ▼
//! BoundFunction::call(args)           (bound.rs)
//!       │   check handle is open
//!       │   marshal arguments          (marshal.rs)
//!       ▼
//! call path for (arity, kinds, ret)   (dispatch.rs)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use typed_dl::ffi::{Runtime, Value};
//!
//! let runtime = Runtime::new();
//! let libc = runtime.open("libc.so.6")?;
//! let strlen = runtime.declare(&libc, "strlen", &["string"], "int")?;
//! assert_eq!(strlen.call(&[Value::from("hello")])?, Value::Int(5));
//! runtime.close(&libc);
//! # Ok::<(), typed_dl::ffi::FfiError>(())
//! ```

mod bound;
mod dispatch;
mod loader;
mod marshal;
mod registry;
mod types;

pub use bound::{Bindings, BoundFunction};
pub use dispatch::{invoke, ARGUMENT_PATTERNS};
pub use loader::LibraryLocator;
pub use marshal::{marshal, MarshaledArg};
pub use registry::{FfiError, LibraryHandle, Result, Runtime};
pub use types::{FunctionSignature, OpaquePtr, RuntimeId, TypeTag, Value, MAX_ARITY};
