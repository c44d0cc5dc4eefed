//! Bound Functions
//!
//! A symbol resolved once and paired with its signature, callable repeatedly
//! with only marshal and dispatch on each call.

use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::sync::{Arc, Weak};

use super::dispatch::invoke;
use super::loader::LibraryState;
use super::marshal::marshal;
use super::registry::{LastError, LibraryHandle};
use super::types::{FunctionSignature, RuntimeId, Value};
use super::{FfiError, Result};

/// A declared native function.
///
/// It never keeps its library alive: the library is held weakly and its state
/// is checked before every call, so calling after `close` yields
/// [`FfiError::HandleClosed`] instead of jumping through a stale address.
/// Cloning is cheap and clones may be called from several threads at once;
/// whether the native function tolerates that is up to the function.
#[derive(Clone)]
pub struct BoundFunction {
    library: Weak<LibraryState>,
    symbol: String,
    address: usize,
    signature: FunctionSignature,
    origin: RuntimeId,
    last_error: Arc<LastError>,
}

impl BoundFunction {
    pub(crate) fn new(
        library: Weak<LibraryState>,
        symbol: &str,
        address: *const c_void,
        signature: FunctionSignature,
        origin: RuntimeId,
        last_error: Arc<LastError>,
    ) -> Self {
        Self {
            library,
            symbol: symbol.to_string(),
            address: address as usize,
            signature,
            origin,
            last_error,
        }
    }

    /// Call the function.
    ///
    /// Blocks until the native function returns; there is no cancellation.
    /// Every failure reported here happens before the native call is made.
    pub fn call(&self, args: &[Value]) -> Result<Value> {
        self.call_checked(args).map_err(|e| {
            self.last_error.record(&e);
            e
        })
    }

    fn call_checked(&self, args: &[Value]) -> Result<Value> {
        let library = self.library.upgrade().ok_or(FfiError::HandleClosed)?;
        if !library.is_open() {
            return Err(FfiError::HandleClosed);
        }
        let marshaled = marshal(args, &self.signature, self.origin)?;

        // Safety: the address was resolved from this library and the read
        // guard held by `with_open` keeps it loaded for the whole call. The
        // signature is the caller's assertion about the native function.
        let result = library.with_open(|| unsafe {
            invoke(
                self.address as *const c_void,
                &marshaled,
                self.signature.ret(),
                self.origin,
            )
        })?;

        drop(marshaled);
        result
    }

    /// Symbol name this function was declared from
    pub fn name(&self) -> &str {
        &self.symbol
    }

    pub fn signature(&self) -> &FunctionSignature {
        &self.signature
    }

    /// Whether the owning library is still open
    pub fn is_live(&self) -> bool {
        self.library
            .upgrade()
            .is_some_and(|library| library.is_open())
    }
}

impl fmt::Debug for BoundFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundFunction")
            .field("symbol", &self.symbol)
            .field("signature", &self.signature.to_string())
            .field("live", &self.is_live())
            .finish()
    }
}

impl fmt::Display for BoundFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.symbol, self.signature)
    }
}

/// Functions declared together from one library
#[derive(Debug)]
pub struct Bindings {
    name: String,
    handle: LibraryHandle,
    functions: HashMap<String, BoundFunction>,
    missing: Vec<String>,
}

impl Bindings {
    pub(crate) fn new(name: &str, handle: LibraryHandle) -> Self {
        Self {
            name: name.to_string(),
            handle,
            functions: HashMap::new(),
            missing: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, function: BoundFunction) {
        self.functions.insert(function.name().to_string(), function);
    }

    pub(crate) fn mark_missing(&mut self, symbol: String) {
        self.missing.push(symbol);
    }

    /// Library name as listed in the manifest
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &LibraryHandle {
        &self.handle
    }

    /// A bound function by symbol name; `None` if it was missing or never listed
    pub fn get(&self, symbol: &str) -> Option<&BoundFunction> {
        self.functions.get(symbol)
    }

    /// Bound functions sorted by symbol name
    pub fn functions(&self) -> Vec<&BoundFunction> {
        let mut functions: Vec<_> = self.functions.values().collect();
        functions.sort_by(|a, b| a.name().cmp(b.name()));
        functions
    }

    /// Listed symbols the library does not export
    pub fn missing(&self) -> &[String] {
        &self.missing
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
