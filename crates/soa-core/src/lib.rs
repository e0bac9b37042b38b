pub mod catalog;
pub mod config;
pub mod error;
pub mod host;
pub mod loader;
pub mod process;

pub use catalog::{ModuleCatalog, ModuleSource};
pub use config::{HostConfig, ProcessServiceOptions, ProcessServiceOverrides, ServiceLoaderOptions};
pub use error::{ConfigError, LoaderError};
pub use host::{add_user_service, ServiceHost, UserServiceFactory};
pub use loader::UserServiceLoader;
pub use process::{InvocationResult, ProcessService};

/// Returns the crate version baked in at compile time.
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Catalog with the modules that ship with the host.
pub fn builtin_catalog(overrides: ProcessServiceOverrides) -> ModuleCatalog {
    ModuleCatalog::new().with_module(process::MODULE_NAME, ProcessService::module(overrides))
}
