use std::{
    collections::BTreeMap,
    path::Path,
    sync::Arc,
};

use soa_service_sdk::{ServiceModule, API_VERSION};

use crate::error::LoaderError;

/// Builds a fresh copy of a module every time it is loaded.
pub type ModuleBuilder = Arc<dyn Fn() -> anyhow::Result<ServiceModule> + Send + Sync>;

/// Resolves a configured module path into a loaded module.
pub trait ModuleSource: Send + Sync {
    fn load(&self, path: &Path) -> Result<ServiceModule, LoaderError>;
}

/// Startup-time registry of the modules this host can load.
///
/// A module path resolves by its file stem, so `/opt/svc/cgi.so` and `cgi`
/// both name the module registered as `cgi`. Every load runs the module's
/// builder again and hands the caller its own export table, nothing from a
/// previous load is reused.
#[derive(Clone, Default)]
pub struct ModuleCatalog {
    modules: BTreeMap<String, ModuleBuilder>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, builder: F) -> &mut Self
    where
        F: Fn() -> anyhow::Result<ServiceModule> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(module = %name, "module registered");
        self.modules.insert(name, Arc::new(builder));
        self
    }

    pub fn with_module<F>(mut self, name: impl Into<String>, builder: F) -> Self
    where
        F: Fn() -> anyhow::Result<ServiceModule> + Send + Sync + 'static,
    {
        self.register(name, builder);
        self
    }

    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }
}

impl ModuleSource for ModuleCatalog {
    fn load(&self, path: &Path) -> Result<ServiceModule, LoaderError> {
        let name = module_name(path).ok_or_else(|| LoaderError::InvalidPath {
            path: path.to_path_buf(),
        })?;
        let builder = self
            .modules
            .get(&name)
            .ok_or_else(|| LoaderError::ModuleNotFound {
                module: name.clone(),
                path: path.to_path_buf(),
            })?;
        let module = builder().map_err(|source| LoaderError::Load {
            path: path.to_path_buf(),
            source,
        })?;
        if !module.is_compatible() {
            return Err(LoaderError::IncompatibleModule {
                module: module.name,
                path: path.to_path_buf(),
                found: module.api_version,
                expected: API_VERSION,
            });
        }
        tracing::debug!(
            module = %module.name,
            version = %module.version,
            exports = module.exports().len(),
            "module loaded"
        );
        Ok(module)
    }
}

/// Module name a path refers to: its file name without extension.
pub fn module_name(path: &Path) -> Option<String> {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().trim().to_string())
        .filter(|stem| !stem.is_empty())
}
