//! Dynamic Library Loader
//!
//! Wraps libloading handles with an explicit open/closed state and resolves
//! bare library names against search paths.

use std::ffi::{c_void, CString};
use std::path::{Path, PathBuf};

use libloading::Library;
use log::{debug, warn};
use parking_lot::RwLock;

use super::FfiError;

/// One opened library and its open/closed state.
///
/// The native handle lives behind a lock: calls through symbols hold the read
/// side for their whole duration, closing takes the write side, so a symbol
/// address is never used once the library is gone.
pub(crate) struct LibraryState {
    id: u64,
    path: PathBuf,
    library: RwLock<Option<Library>>,
}

impl LibraryState {
    /// Load a library from the given path
    pub(crate) fn open(id: u64, path: &Path) -> Result<Self, FfiError> {
        // Safety: loading runs the library's initializers. The caller asked
        // for this path explicitly.
        let library = unsafe { load_now(path) }.map_err(|e| FfiError::LoadError(e.to_string()))?;
        debug!("opened library #{} '{}'", id, path.display());

        Ok(Self {
            id,
            path: path.to_path_buf(),
            library: RwLock::new(Some(library)),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn is_open(&self) -> bool {
        self.library.read().is_some()
    }

    /// Release the native handle. Returns false if it was already closed.
    pub(crate) fn close(&self) -> bool {
        let Some(library) = self.library.write().take() else {
            return false;
        };
        if let Err(e) = library.close() {
            warn!("closing '{}' reported: {}", self.path.display(), e);
        }
        debug!("closed library #{} '{}'", self.id, self.path.display());
        true
    }

    /// Look up an exported symbol's address
    pub(crate) fn resolve(&self, name: &str) -> Result<*const c_void, FfiError> {
        let c_name = CString::new(name)
            .map_err(|_| FfiError::InvalidSymbol(format!("Invalid symbol name: {:?}", name)))?;

        let guard = self.library.read();
        let library = guard.as_ref().ok_or(FfiError::HandleClosed)?;

        // Safety: we only read the symbol's address, its type is asserted
        // later by the declared signature.
        let addr = unsafe {
            let symbol = library
                .get::<*const c_void>(c_name.as_bytes_with_nul())
                .map_err(|e| {
                    FfiError::SymbolNotFound(format!(
                        "'{}' in '{}': {}",
                        name,
                        self.path.display(),
                        e
                    ))
                })?;
            *symbol
        };

        if addr.is_null() {
            return Err(FfiError::SymbolNotFound(format!(
                "'{}' in '{}' resolved to a null address",
                name,
                self.path.display()
            )));
        }

        debug!("resolved '{}' in '{}'", name, self.path.display());
        Ok(addr)
    }

    /// Run `f` while the library is guaranteed to stay loaded
    pub(crate) fn with_open<R>(&self, f: impl FnOnce() -> R) -> Result<R, FfiError> {
        let guard = self.library.read();
        if guard.is_none() {
            return Err(FfiError::HandleClosed);
        }
        let result = f();
        drop(guard);
        Ok(result)
    }
}

/// Bind every symbol at load time so missing dependencies fail here instead
/// of at the first call.
#[cfg(unix)]
unsafe fn load_now(path: &Path) -> Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_LOCAL, RTLD_NOW};

    UnixLibrary::open(Some(path), RTLD_NOW | RTLD_LOCAL).map(Library::from)
}

#[cfg(not(unix))]
unsafe fn load_now(path: &Path) -> Result<Library, libloading::Error> {
    Library::new(path)
}

/// Resolves library names to paths
#[derive(Debug, Clone)]
pub struct LibraryLocator {
    search_paths: Vec<PathBuf>,
}

impl LibraryLocator {
    /// Create a locator with the platform's default search paths
    pub fn new() -> Self {
        Self {
            search_paths: default_search_paths(),
        }
    }

    /// Create a locator that only searches the given paths
    pub fn with_paths(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    /// Add a search path
    pub fn add_search_path(&mut self, path: impl AsRef<Path>) {
        self.search_paths.push(path.as_ref().to_path_buf());
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Find a library by name.
    ///
    /// Existing files and anything containing a path separator are returned
    /// unchanged. Otherwise the search paths are tried with the platform
    /// filename, and failing that the bare name is handed to the system
    /// loader's own lookup.
    pub fn locate(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.exists() || name.contains(std::path::MAIN_SEPARATOR) || name.contains('/') {
            return path.to_path_buf();
        }

        let lib_name = library_filename(name);
        for search_path in &self.search_paths {
            let full_path = search_path.join(&lib_name);
            if full_path.is_file() {
                return full_path;
            }
        }

        path.to_path_buf()
    }
}

impl Default for LibraryLocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Get the default library search paths for this platform
pub(crate) fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd);
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(ld_path) = std::env::var("LD_LIBRARY_PATH") {
            paths.extend(ld_path.split(':').filter(|p| !p.is_empty()).map(PathBuf::from));
        }
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/usr/lib"));
        paths.push(PathBuf::from("/lib"));
        paths.push(PathBuf::from("/usr/lib64"));
        paths.push(PathBuf::from("/lib64"));
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(dyld_path) = std::env::var("DYLD_LIBRARY_PATH") {
            paths.extend(dyld_path.split(':').filter(|p| !p.is_empty()).map(PathBuf::from));
        }
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/opt/homebrew/lib"));
        paths.push(PathBuf::from("/usr/lib"));
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(path) = std::env::var("PATH") {
            paths.extend(path.split(';').filter(|p| !p.is_empty()).map(PathBuf::from));
        }
        paths.push(PathBuf::from("C:\\Windows\\System32"));
    }

    paths
}

/// Construct the platform-specific library filename
pub(crate) fn library_filename(name: &str) -> String {
    #[cfg(target_os = "macos")]
    {
        if name.ends_with(".dylib") {
            name.to_string()
        } else {
            format!("lib{}.dylib", name)
        }
    }

    #[cfg(target_os = "windows")]
    {
        if name.to_ascii_lowercase().ends_with(".dll") {
            name.to_string()
        } else {
            format!("{}.dll", name)
        }
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        if name.ends_with(".so") || name.contains(".so.") {
            name.to_string()
        } else {
            format!("lib{}.so", name)
        }
    }
}
