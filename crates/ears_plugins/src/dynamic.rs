//! Loading adapter factories from shared libraries
//!
//! A library exports two symbols, normally generated with
//! [`export_adapter_factory!`](crate::export_adapter_factory):
//!
//! * `get_adapter_abi_version`: the `ears_core` version it was built against
//! * `create_adapter_factory`: a boxed [`AdapterFactory`]
//!
//! Versions must agree on major and minor. Loaded libraries stay mapped for
//! as long as the factory built from them is registered.

use ears_core::{Adapter, AdapterError, AdapterFactory, AdapterFactoryRegistry, RegistryError};
use libloading::{Library, Symbol};
use serde_json::Value;
use std::ffi::CStr;
use std::os::raw::c_char;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Errors raised while loading adapter libraries
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to load library {path}: {reason}")]
    Library { path: PathBuf, reason: String },

    #[error("Library {path} does not export {symbol}")]
    MissingSymbol { path: PathBuf, symbol: &'static str },

    #[error("Incompatible adapter library {path}: built for v{found}, runtime is v{expected}")]
    VersionMismatch {
        path: PathBuf,
        found: String,
        expected: String,
    },

    #[error("Adapter library {0} returned no factory")]
    NullFactory(PathBuf),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Factory that keeps its library mapped
struct LibraryFactory {
    factory: Box<dyn AdapterFactory>,
    _library: Arc<Library>,
}

impl AdapterFactory for LibraryFactory {
    fn adapter_type(&self) -> &str {
        self.factory.adapter_type()
    }

    fn create(&self, params: &Value) -> Result<Arc<dyn Adapter>, AdapterError> {
        self.factory.create(params)
    }
}

/// Loads every shared library in a directory and registers the factories they export
pub fn load_directory(
    directory: impl AsRef<Path>,
    factories: &AdapterFactoryRegistry,
) -> Result<Vec<String>, LoadError> {
    let directory = directory.as_ref();
    if !directory.exists() {
        warn!("⚠️ Adapter directory does not exist: {}", directory.display());
        return Ok(Vec::new());
    }

    let files = discover_libraries(directory)?;
    info!("📁 Found {} adapter libraries in {}", files.len(), directory.display());

    let mut loaded = Vec::new();
    for path in files {
        match load_library(&path, factories) {
            Ok(adapter_type) => loaded.push(adapter_type),
            Err(e) => error!("❌ {}", e),
        }
    }
    Ok(loaded)
}

/// Loads one library and registers its factory; returns the adapter type
pub fn load_library(path: &Path, factories: &AdapterFactoryRegistry) -> Result<String, LoadError> {
    info!("🔄 Loading adapter library: {}", path.display());

    let library = unsafe {
        Library::new(path).map_err(|e| LoadError::Library {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
    };

    let found = {
        let get_version: Symbol<unsafe extern "C" fn() -> *const c_char> = unsafe {
            library
                .get(b"get_adapter_abi_version")
                .map_err(|_| LoadError::MissingSymbol {
                    path: path.to_path_buf(),
                    symbol: "get_adapter_abi_version",
                })?
        };
        let ptr = unsafe { get_version() };
        if ptr.is_null() {
            String::new()
        } else {
            unsafe { CStr::from_ptr(ptr) }.to_string_lossy().to_string()
        }
    };

    let expected = ears_core::EARS_CORE_VERSION;
    if !versions_compatible(&found, expected) {
        return Err(LoadError::VersionMismatch {
            path: path.to_path_buf(),
            found,
            expected: expected.to_string(),
        });
    }

    let factory = {
        let create: Symbol<unsafe extern "C" fn() -> *mut dyn AdapterFactory> = unsafe {
            library
                .get(b"create_adapter_factory")
                .map_err(|_| LoadError::MissingSymbol {
                    path: path.to_path_buf(),
                    symbol: "create_adapter_factory",
                })?
        };
        let ptr = unsafe { create() };
        if ptr.is_null() {
            return Err(LoadError::NullFactory(path.to_path_buf()));
        }
        unsafe { Box::from_raw(ptr) }
    };

    let adapter_type = factory.adapter_type().to_string();
    factories.register(Arc::new(LibraryFactory {
        factory,
        _library: Arc::new(library),
    }))?;

    info!("✅ Loaded adapter type {} from {}", adapter_type, path.display());
    Ok(adapter_type)
}

fn discover_libraries(directory: &Path) -> Result<Vec<PathBuf>, LoadError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(extension) = path.extension() else {
            continue;
        };
        let ext = extension.to_string_lossy().to_lowercase();

        #[cfg(target_os = "windows")]
        let is_library = ext == "dll";
        #[cfg(target_os = "macos")]
        let is_library = ext == "dylib";
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        let is_library = ext == "so";

        if is_library {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Vtable carrier for the null factory pointer returned after a panic
#[doc(hidden)]
pub struct Unavailable;

impl AdapterFactory for Unavailable {
    fn adapter_type(&self) -> &str {
        ""
    }

    fn create(&self, _params: &Value) -> Result<Arc<dyn Adapter>, AdapterError> {
        Err(AdapterError::Failed("adapter factory unavailable".to_string()))
    }
}

/// Major and minor must match
fn versions_compatible(found: &str, expected: &str) -> bool {
    let major_minor = |version: &str| -> Option<(u32, u32)> {
        let mut parts = version.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        Some((major, minor))
    };
    match (major_minor(found), major_minor(expected)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Exports the symbols [`load_library`] looks for.
///
/// ```rust,ignore
/// ears_plugins::export_adapter_factory!(MyFactory::new());
/// ```
#[macro_export]
macro_rules! export_adapter_factory {
    ($factory:expr) => {
        #[no_mangle]
        pub extern "C" fn get_adapter_abi_version() -> *const std::os::raw::c_char {
            static VERSION: std::sync::OnceLock<std::ffi::CString> = std::sync::OnceLock::new();
            VERSION
                .get_or_init(|| {
                    std::ffi::CString::new($crate::ears_core::EARS_CORE_VERSION).unwrap_or_default()
                })
                .as_ptr()
        }

        #[no_mangle]
        pub extern "C" fn create_adapter_factory() -> *mut dyn $crate::ears_core::AdapterFactory {
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let factory: Box<dyn $crate::ears_core::AdapterFactory> = Box::new($factory);
                Box::into_raw(factory)
            })) {
                Ok(ptr) => ptr,
                Err(panic_info) => {
                    eprintln!("Adapter factory creation panicked: {:?}", panic_info);
                    std::ptr::null_mut::<$crate::dynamic::Unavailable>()
                        as *mut dyn $crate::ears_core::AdapterFactory
                }
            }
        }
    };
}
