//! Binding Manifests
//!
//! Handles parsing of `typed-dl.toml` files, which list libraries and the
//! signatures of the symbols to bind from them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// File name searched for by [`Manifest::find_and_load`]
pub const MANIFEST_FILE: &str = "typed-dl.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root structure of a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Extra directories searched for bare library names
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,

    /// Whether the platform's default search paths are used as well
    #[serde(default = "default_true")]
    pub use_default_search_paths: bool,

    /// Libraries to bind
    #[serde(default, rename = "library")]
    pub libraries: Vec<LibrarySpec>,
}

impl Manifest {
    /// Load a manifest from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let manifest: Manifest = toml::from_str(&content)?;
        Ok(manifest)
    }

    /// Find and load a manifest by searching up from the given directory.
    ///
    /// Returns the empty manifest if no directory up to the root has one.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let manifest_path = dir.join(MANIFEST_FILE);
            if manifest_path.exists() {
                return Self::load(&manifest_path);
            }
            if !dir.pop() {
                return Ok(Self::default());
            }
        }
    }

    /// Save the manifest to a file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Runtime settings described by this manifest
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            search_paths: self.search_paths.clone(),
            use_default_search_paths: self.use_default_search_paths,
        }
    }

    /// A library entry by name
    pub fn library(&self, name: &str) -> Option<&LibrarySpec> {
        self.libraries.iter().find(|lib| lib.name == name)
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            use_default_search_paths: true,
            libraries: Vec::new(),
        }
    }
}

impl FromStr for Manifest {
    type Err = toml::de::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s)
    }
}

/// One library and the symbols to bind from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibrarySpec {
    /// Name used to refer to the library; also the path if `path` is unset
    pub name: String,

    /// Path or file name handed to the loader
    #[serde(default)]
    pub path: Option<String>,

    /// Symbol name to signature
    #[serde(default)]
    pub symbols: BTreeMap<String, SymbolSpec>,
}

impl LibrarySpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            symbols: BTreeMap::new(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Add a symbol to bind
    pub fn with_symbol(mut self, name: impl Into<String>, args: &[&str], ret: &str) -> Self {
        self.symbols.insert(
            name.into(),
            SymbolSpec {
                args: args.iter().map(|s| s.to_string()).collect(),
                ret: ret.to_string(),
            },
        );
        self
    }
}

/// Declared signature of one symbol, as type names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolSpec {
    /// Argument type names
    #[serde(default)]
    pub args: Vec<String>,

    /// Return type name
    #[serde(default = "default_ret")]
    pub ret: String,
}

fn default_ret() -> String {
    "void".to_string()
}

fn default_true() -> bool {
    true
}

/// Settings for a [`Runtime`](crate::ffi::Runtime).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directories searched first for bare library names
    pub search_paths: Vec<PathBuf>,

    /// Append the platform's default search paths
    pub use_default_search_paths: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            use_default_search_paths: true,
        }
    }
}
