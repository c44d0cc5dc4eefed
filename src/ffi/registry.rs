//! FFI Runtime
//!
//! The handle table and the entry points callers use: open, close, declare.
//! There is no process-wide registry; every `Runtime` is an independent
//! loader context and pointers it issues are only accepted back by itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use super::bound::{Bindings, BoundFunction};
use super::loader::{default_search_paths, LibraryLocator, LibraryState};
use super::types::{FunctionSignature, OpaquePtr, RuntimeId, TypeTag};
use crate::config::{LibrarySpec, Manifest, RuntimeConfig};

/// Error type for FFI operations
///
/// Every variant is recoverable. A native call that crashes or whose real
/// signature differs from the declared one is not reported here: it is
/// undefined behavior at the process level.
#[derive(Debug, Clone, Error)]
pub enum FfiError {
    /// Library missing, invalid, or with unresolved dependencies
    #[error("Load error: {0}")]
    LoadError(String),

    /// Requested export absent
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    /// Symbol name that cannot be passed to the loader
    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    /// Unrecognized type name
    #[error("Unknown type tag: '{0}' (expected int, double, string, pointer or void)")]
    UnknownTypeTag(String),

    /// `void` used as an argument type
    #[error("Argument {index} is declared void; void is only valid as a return type")]
    VoidArgument { index: usize },

    /// Declared arity beyond the dispatch table
    #[error("Too many arguments: {count} (max {max})")]
    TooManyArgs { count: usize, max: usize },

    /// Wrong number of call arguments
    #[error("Arity mismatch: expected {expected} arguments, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    /// Value of the wrong kind for its declared tag
    #[error("Argument {index}: expected {expected}, got {got}")]
    ArgumentType {
        index: usize,
        expected: TypeTag,
        got: String,
    },

    /// Pointer issued by another runtime
    #[error("Argument {index}: pointer was not issued by this runtime")]
    ForeignPointer { index: usize },

    /// Call or lookup through a closed library
    #[error("Library handle is closed")]
    HandleClosed,

    /// Handle not issued by this runtime
    #[error("Library handle #{0} does not belong to this runtime")]
    HandleNotFound(u64),
}

/// Result type for FFI operations
pub type Result<T> = std::result::Result<T, FfiError>;

/// Most recent error message of a runtime, shared with its bound functions
#[derive(Debug, Default)]
pub(crate) struct LastError(Mutex<Option<String>>);

impl LastError {
    pub(crate) fn record(&self, err: &FfiError) {
        *self.0.lock() = Some(err.to_string());
    }

    pub(crate) fn get(&self) -> Option<String> {
        self.0.lock().clone()
    }

    pub(crate) fn clear(&self) {
        *self.0.lock() = None;
    }
}

/// A library opened by a [`Runtime`].
///
/// Cloning the handle does not reopen the library; every clone refers to the
/// same native handle and sees the same open/closed state.
#[derive(Clone)]
pub struct LibraryHandle {
    state: Arc<LibraryState>,
    runtime: RuntimeId,
}

impl LibraryHandle {
    /// Numeric id, unique within the issuing runtime
    pub fn id(&self) -> u64 {
        self.state.id()
    }

    /// Path the library was opened from
    pub fn path(&self) -> &Path {
        self.state.path()
    }

    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }
}

impl std::fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryHandle")
            .field("id", &self.id())
            .field("path", &self.path())
            .field("open", &self.is_open())
            .finish()
    }
}

/// Loader context owning a table of open libraries.
///
/// Opening the same path twice yields two independent handles, each with its
/// own reference to the loaded library; closing one leaves the other and its
/// bound functions usable. Table operations are serialized by one mutex;
/// calls through a [`BoundFunction`] never touch the table.
pub struct Runtime {
    id: RuntimeId,
    locator: LibraryLocator,
    handles: Mutex<HashMap<u64, Arc<LibraryState>>>,
    next_handle: AtomicU64,
    last_error: Arc<LastError>,
}

impl Runtime {
    /// Create a runtime using the default search paths
    pub fn new() -> Self {
        Self::with_config(&RuntimeConfig::default())
    }

    /// Create a runtime from configuration
    pub fn with_config(config: &RuntimeConfig) -> Self {
        // Configured paths take precedence over the defaults.
        let mut search_paths = config.search_paths.clone();
        if config.use_default_search_paths {
            search_paths.extend(default_search_paths());
        }

        Self {
            id: RuntimeId::next(),
            locator: LibraryLocator::with_paths(search_paths),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            last_error: Arc::new(LastError::default()),
        }
    }

    pub fn id(&self) -> RuntimeId {
        self.id
    }

    pub fn locator(&self) -> &LibraryLocator {
        &self.locator
    }

    /// Open a library by path or by bare name
    pub fn open(&self, path: impl AsRef<str>) -> Result<LibraryHandle> {
        let located = self.locator.locate(path.as_ref());
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);

        // The table lock is held across the load so open and close are
        // serialized against each other.
        let mut handles = self.handles.lock();
        let state = LibraryState::open(id, &located).map_err(|e| self.fail(e))?;
        let state = Arc::new(state);
        handles.insert(id, Arc::clone(&state));

        Ok(LibraryHandle {
            state,
            runtime: self.id,
        })
    }

    /// Close a library.
    ///
    /// Closing twice is a no-op. Functions declared from this handle fail
    /// with [`FfiError::HandleClosed`] afterwards. A handle issued by another
    /// runtime is left untouched and [`FfiError::HandleNotFound`] is recorded
    /// as the last error.
    pub fn close(&self, handle: &LibraryHandle) {
        if handle.runtime != self.id {
            debug!(
                "refusing to close '{}': handle {} belongs to another runtime",
                handle.path().display(),
                handle.id()
            );
            self.fail(FfiError::HandleNotFound(handle.id()));
            return;
        }

        let mut handles = self.handles.lock();
        handles.remove(&handle.id());
        if handle.state.close() {
            if Arc::weak_count(&handle.state) > 0 {
                debug!(
                    "library '{}' closed with live bound functions; they are now invalid",
                    handle.path().display()
                );
            }
        } else {
            debug!("library '{}' was already closed", handle.path().display());
        }
    }

    /// Parse a signature, resolve the symbol and bind them together.
    ///
    /// Type names are checked before the library is touched, so an unknown
    /// tag never leads to a lookup or a native call.
    pub fn declare(
        &self,
        handle: &LibraryHandle,
        symbol: &str,
        arg_types: &[&str],
        ret_type: &str,
    ) -> Result<BoundFunction> {
        let signature = FunctionSignature::parse(arg_types, ret_type).map_err(|e| self.fail(e))?;
        self.declare_signature(handle, symbol, signature)
    }

    /// Bind a symbol with an already parsed signature
    pub fn declare_signature(
        &self,
        handle: &LibraryHandle,
        symbol: &str,
        signature: FunctionSignature,
    ) -> Result<BoundFunction> {
        self.check_owned(handle).map_err(|e| self.fail(e))?;
        // Resolution skips the table lock: the library's own read guard
        // already excludes a concurrent close, and dlsym is thread-safe.
        let address = handle.state.resolve(symbol).map_err(|e| self.fail(e))?;
        debug!("declared {}{}", symbol, signature);

        Ok(BoundFunction::new(
            Arc::downgrade(&handle.state),
            symbol,
            address,
            signature,
            self.id,
            Arc::clone(&self.last_error),
        ))
    }

    /// Look up a symbol and issue its address as an opaque pointer
    pub fn symbol_pointer(&self, handle: &LibraryHandle, symbol: &str) -> Result<OpaquePtr> {
        self.check_owned(handle).map_err(|e| self.fail(e))?;
        let address = handle.state.resolve(symbol).map_err(|e| self.fail(e))?;
        Ok(OpaquePtr::new(address, self.id))
    }

    /// A null pointer usable as a `pointer` argument
    pub fn null_pointer(&self) -> OpaquePtr {
        OpaquePtr::new(std::ptr::null(), self.id)
    }

    /// Open a library and declare every symbol listed in `spec`.
    ///
    /// Symbols the library does not export are recorded as missing rather
    /// than failing the batch. Open failures and unknown type names do fail.
    pub fn bind_library(&self, spec: &LibrarySpec) -> Result<Bindings> {
        let signatures = spec
            .symbols
            .iter()
            .map(|(name, sym)| {
                FunctionSignature::parse(sym.args.as_slice(), &sym.ret)
                    .map(|sig| (name.clone(), sig))
            })
            .collect::<Result<Vec<_>>>()
            .map_err(|e| self.fail(e))?;

        let handle = self.open(spec.path.as_deref().unwrap_or(spec.name.as_str()))?;
        let mut bindings = Bindings::new(&spec.name, handle.clone());

        for (name, signature) in signatures {
            match self.declare_signature(&handle, &name, signature) {
                Ok(function) => bindings.insert(function),
                Err(FfiError::SymbolNotFound(msg)) => {
                    warn!("library '{}': {}", spec.name, msg);
                    bindings.mark_missing(name);
                }
                Err(e) => {
                    self.close(&handle);
                    return Err(e);
                }
            }
        }

        info!(
            "bound {} symbols from '{}' ({} missing)",
            bindings.len(),
            spec.name,
            bindings.missing().len()
        );
        Ok(bindings)
    }

    /// Bind every library a manifest lists.
    ///
    /// All or nothing: if one library fails, those already bound are closed
    /// before the error is returned.
    pub fn load_manifest(&self, manifest: &Manifest) -> Result<Vec<Bindings>> {
        let mut bound = Vec::with_capacity(manifest.libraries.len());
        for spec in &manifest.libraries {
            match self.bind_library(spec) {
                Ok(bindings) => bound.push(bindings),
                Err(e) => {
                    for bindings in &bound {
                        self.close(bindings.handle());
                    }
                    return Err(e);
                }
            }
        }
        Ok(bound)
    }

    /// Message of the most recent error, if any
    pub fn last_error(&self) -> Option<String> {
        self.last_error.get()
    }

    pub fn clear_last_error(&self) {
        self.last_error.clear();
    }

    /// Path of an open library owned by this runtime
    pub fn path(&self, handle: &LibraryHandle) -> Option<PathBuf> {
        self.handles
            .lock()
            .get(&handle.id())
            .filter(|_| handle.runtime == self.id)
            .map(|state| state.path().to_path_buf())
    }

    pub fn is_open(&self, handle: &LibraryHandle) -> bool {
        handle.runtime == self.id && handle.is_open()
    }

    /// Ids and paths of every library currently open in this runtime
    pub fn open_handles(&self) -> Vec<(u64, PathBuf)> {
        let mut handles: Vec<_> = self
            .handles
            .lock()
            .values()
            .map(|state| (state.id(), state.path().to_path_buf()))
            .collect();
        handles.sort_by_key(|(id, _)| *id);
        handles
    }

    fn check_owned(&self, handle: &LibraryHandle) -> Result<()> {
        if handle.runtime != self.id {
            return Err(FfiError::HandleNotFound(handle.id()));
        }
        if !handle.is_open() {
            return Err(FfiError::HandleClosed);
        }
        Ok(())
    }

    fn fail(&self, err: FfiError) -> FfiError {
        self.last_error.record(&err);
        err
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        for (_, state) in self.handles.get_mut().drain() {
            state.close();
        }
    }
}
