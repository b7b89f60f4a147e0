//! Native plugin modules.
//!
//! A plugin is a `cdylib` built against this crate that exports a
//! [`PluginDeclaration`] through [`export_plugin!`](crate::export_plugin). Loading
//! a module opens the library, checks the declared ABI version, and hands the
//! module's entry point a registrar bound to the [`TransformRegistry`].
//!
//! ```ignore
//! use flowfeat::transform_registry::PluginRegistrar;
//!
//! fn register(registrar: &mut dyn PluginRegistrar) {
//!     registrar.register_transform("P_zero", std::sync::Arc::new(|_ctx, args, record| {
//!         record.set(args.field, "0");
//!         Ok(())
//!     }));
//! }
//!
//! flowfeat::export_plugin!(register);
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::transform_registry::{KeyGenFn, PluginRegistrar, TransformFn, TransformRegistry};

/// Bumped whenever the plugin-facing types change layout.
pub const PLUGIN_ABI_VERSION: u32 = 1;

/// Version of the engine crate, recorded in every declaration.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Symbol exported by [`export_plugin!`](crate::export_plugin).
pub const DECLARATION_SYMBOL: &[u8] = b"FLOWFEAT_PLUGIN_DECLARATION\0";

/// Module name under which built-in functions are registered.
pub const BUILTIN_MODULE: &str = "builtin";

/// Static descriptor a plugin module exports.
#[derive(Clone, Copy)]
pub struct PluginDeclaration {
    pub abi_version: u32,
    pub engine_version: &'static str,
    pub register: fn(&mut dyn PluginRegistrar),
}

/// Export a plugin declaration whose entry point is `$register`.
#[macro_export]
macro_rules! export_plugin {
    ($register:expr) => {
        #[doc(hidden)]
        #[no_mangle]
        pub static FLOWFEAT_PLUGIN_DECLARATION: $crate::plugin::PluginDeclaration =
            $crate::plugin::PluginDeclaration {
                abi_version: $crate::plugin::PLUGIN_ABI_VERSION,
                engine_version: $crate::plugin::ENGINE_VERSION,
                register: $register,
            };
    };
}

/// Errors raised while loading modules or registering their functions
#[derive(Debug, Clone)]
pub enum PluginError {
    Open {
        path: PathBuf,
        message: String,
    },
    MissingDeclaration {
        path: PathBuf,
    },
    AbiMismatch {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
    InvalidName {
        name: String,
        expected_prefix: &'static str,
    },
    Duplicate {
        name: String,
        first: String,
        second: String,
    },
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginError::Open { path, message } => {
                write!(f, "Failed to open plugin module {}: {}", path.display(), message)
            }
            PluginError::MissingDeclaration { path } => write!(
                f,
                "Plugin module {} does not export FLOWFEAT_PLUGIN_DECLARATION",
                path.display()
            ),
            PluginError::AbiMismatch {
                path,
                found,
                expected,
            } => write!(
                f,
                "Plugin module {} declares ABI version {}, engine expects {}",
                path.display(),
                found,
                expected
            ),
            PluginError::InvalidName {
                name,
                expected_prefix,
            } => write!(
                f,
                "Function name '{}' does not carry the '{}' prefix",
                name, expected_prefix
            ),
            PluginError::Duplicate {
                name,
                first,
                second,
            } => write!(
                f,
                "Function '{}' registered by both '{}' and '{}'",
                name, first, second
            ),
        }
    }
}

impl std::error::Error for PluginError {}

/// Registrar bound to one module while its entry point runs.
///
/// Names with the wrong prefix are skipped with a warning; any other
/// registration failure is kept and reported by [`ModuleRegistrar::finish`].
pub struct ModuleRegistrar<'a> {
    registry: &'a mut TransformRegistry,
    module: String,
    registered: usize,
    errors: Vec<PluginError>,
}

impl<'a> ModuleRegistrar<'a> {
    pub fn new(registry: &'a mut TransformRegistry, module: impl Into<String>) -> Self {
        Self {
            registry,
            module: module.into(),
            registered: 0,
            errors: Vec::new(),
        }
    }

    fn record(&mut self, name: &str, result: Result<(), PluginError>) {
        match result {
            Ok(()) => self.registered += 1,
            Err(PluginError::InvalidName {
                name: bad,
                expected_prefix,
            }) => {
                tracing::warn!(
                    "Module '{}' registered '{}' without the '{}' prefix; ignoring it",
                    self.module,
                    bad,
                    expected_prefix
                );
            }
            Err(e) => {
                tracing::error!("Module '{}' failed to register '{}': {}", self.module, name, e);
                self.errors.push(e);
            }
        }
    }

    /// Number of functions registered, or the first registration error.
    pub fn finish(self) -> Result<usize, PluginError> {
        match self.errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(self.registered),
        }
    }
}

impl PluginRegistrar for ModuleRegistrar<'_> {
    fn register_transform(&mut self, name: &str, transform: Arc<dyn TransformFn>) {
        let result = self
            .registry
            .register_transform(&self.module, name, transform);
        self.record(name, result);
    }

    fn register_key_gen(&mut self, name: &str, key_gen: Arc<dyn KeyGenFn>) {
        let result = self.registry.register_key_gen(&self.module, name, key_gen);
        self.record(name, result);
    }
}

impl TransformRegistry {
    /// Load one native module and register its functions.
    ///
    /// # Arguments
    ///
    /// * `path` - Path of the shared library
    ///
    /// # Returns
    ///
    /// Number of functions the module registered
    ///
    /// # Safety
    ///
    /// The library runs arbitrary code on load and must have been built with
    /// the same compiler and `flowfeat` version as the engine.
    pub unsafe fn load_module(&mut self, path: &Path) -> Result<usize, PluginError> {
        let library = libloading::Library::new(path).map_err(|e| PluginError::Open {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let declaration = library
            .get::<*const PluginDeclaration>(DECLARATION_SYMBOL)
            .map_err(|_| PluginError::MissingDeclaration {
                path: path.to_path_buf(),
            })?
            .read();

        if declaration.abi_version != PLUGIN_ABI_VERSION {
            return Err(PluginError::AbiMismatch {
                path: path.to_path_buf(),
                found: declaration.abi_version,
                expected: PLUGIN_ABI_VERSION,
            });
        }
        if declaration.engine_version != ENGINE_VERSION {
            tracing::warn!(
                "Plugin module {} was built against flowfeat {}, engine is {}",
                path.display(),
                declaration.engine_version,
                ENGINE_VERSION
            );
        }

        let module = path.display().to_string();
        let result = {
            let mut registrar = ModuleRegistrar::new(self, module.as_str());
            (declaration.register)(&mut registrar);
            registrar.finish()
        };
        // Handles may already be registered even when registration failed.
        self.adopt_library(library);

        let count = result?;
        tracing::info!("Loaded {} functions from plugin module {}", count, module);
        Ok(count)
    }

    /// Load every module named by `paths`, expanding directories to the
    /// shared libraries they contain (sorted by name).
    ///
    /// # Safety
    ///
    /// See [`TransformRegistry::load_module`].
    pub unsafe fn load_modules(&mut self, paths: &[PathBuf]) -> Result<usize, PluginError> {
        let mut total = 0;
        for path in paths {
            if path.is_dir() {
                for module in module_files(path)? {
                    total += self.load_module(&module)?;
                }
            } else {
                total += self.load_module(path)?;
            }
        }
        Ok(total)
    }
}

fn module_files(dir: &Path) -> Result<Vec<PathBuf>, PluginError> {
    let entries = std::fs::read_dir(dir).map_err(|e| PluginError::Open {
        path: dir.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut modules: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension().and_then(|e| e.to_str()) == Some(std::env::consts::DLL_EXTENSION)
        })
        .collect();
    modules.sort();
    Ok(modules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::runtime::context::DispatchContext;
    use crate::transform_registry::{KeyContext, TransformArgs, TransformError};

    fn zero(
        _ctx: &DispatchContext,
        args: &TransformArgs<'_>,
        record: &mut Record,
    ) -> Result<(), TransformError> {
        record.set(args.field, "0");
        Ok(())
    }

    fn const_key(_ctx: &KeyContext, _raw: &Record, _level: &str) -> Result<String, TransformError> {
        Ok("k".to_string())
    }

    mod exported {
        use super::*;

        fn register(registrar: &mut dyn PluginRegistrar) {
            registrar.register_transform("P_zero", Arc::new(zero));
            registrar.register_key_gen("genKey_const", Arc::new(const_key));
        }

        crate::export_plugin!(register);
    }

    #[test]
    fn test_exported_declaration_registers() {
        let declaration = exported::FLOWFEAT_PLUGIN_DECLARATION;
        assert_eq!(declaration.abi_version, PLUGIN_ABI_VERSION);
        assert_eq!(declaration.engine_version, ENGINE_VERSION);

        let mut registry = TransformRegistry::new();
        let mut registrar = ModuleRegistrar::new(&mut registry, "exported");
        (declaration.register)(&mut registrar);
        assert_eq!(registrar.finish().unwrap(), 2);
        assert!(registry.has_transform("P_zero"));
        assert!(registry.has_key_gen("genKey_const"));
    }

    #[test]
    fn test_wrong_prefix_is_skipped() {
        let mut registry = TransformRegistry::new();
        let mut registrar = ModuleRegistrar::new(&mut registry, "m");
        registrar.register_transform("zero", Arc::new(zero));
        registrar.register_key_gen("P_key", Arc::new(const_key));
        registrar.register_transform("P_zero", Arc::new(zero));
        assert_eq!(registrar.finish().unwrap(), 1);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_duplicate_across_modules_fails() {
        let mut registry = TransformRegistry::new();
        let mut first = ModuleRegistrar::new(&mut registry, "a");
        first.register_transform("P_zero", Arc::new(zero));
        first.finish().unwrap();

        let mut second = ModuleRegistrar::new(&mut registry, "b");
        second.register_transform("P_zero", Arc::new(zero));
        let err = second.finish().unwrap_err();
        assert!(matches!(err, PluginError::Duplicate { .. }));
        assert!(err.to_string().contains("'a' and 'b'"));
    }

    #[test]
    fn test_missing_module_fails_to_open() {
        let mut registry = TransformRegistry::new();
        let result = unsafe { registry.load_module(Path::new("/nonexistent/libplugin.so")) };
        assert!(matches!(result, Err(PluginError::Open { .. })));
    }

    #[test]
    fn test_non_library_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin.so");
        std::fs::write(&path, b"not a shared object").unwrap();

        let mut registry = TransformRegistry::new();
        let result = unsafe { registry.load_module(&path) };
        assert!(matches!(result, Err(PluginError::Open { .. })));
        assert_eq!(registry.library_count(), 0);
    }

    #[test]
    fn test_empty_plugin_directory_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.txt"), b"docs").unwrap();

        let mut registry = TransformRegistry::new();
        let loaded = unsafe { registry.load_modules(&[dir.path().to_path_buf()]) }.unwrap();
        assert_eq!(loaded, 0);
    }
}
