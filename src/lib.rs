//! typed-dl - Typed Dynamic Foreign Function Calls
//!
//! Loads shared libraries at run time and calls their exported functions
//! through signatures declared with a small vocabulary of type names
//! (`int`, `double`, `string`, `pointer`, `void`), with no compile-time
//! knowledge of the functions being called.
//!
//! # Example
//!
//! ```no_run
//! use typed_dl::ffi::{Runtime, Value};
//!
//! let runtime = Runtime::new();
//! let libc = runtime.open("libc.so.6")?;
//!
//! let abs = runtime.declare(&libc, "abs", &["int"], "int")?;
//! assert_eq!(abs.call(&[Value::Int(-5)])?, Value::Int(5));
//!
//! runtime.close(&libc);
//! assert!(abs.call(&[Value::Int(-5)]).is_err());
//! # Ok::<(), typed_dl::ffi::FfiError>(())
//! ```
//!
//! # Safety model
//!
//! Every failure this crate can detect (missing library or symbol, unknown
//! type name, wrong argument count or kind, closed handle) is returned as an
//! [`ffi::FfiError`] before any native code runs. A declared signature that
//! does not match the real function, or a callee that crashes, cannot be
//! detected: that is undefined behavior for the whole process.

pub mod config;
pub mod ffi;

pub use config::{LibrarySpec, Manifest, RuntimeConfig, SymbolSpec};
pub use ffi::{BoundFunction, FfiError, LibraryHandle, Runtime, TypeTag, Value};
