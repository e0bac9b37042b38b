use std::sync::Arc;

use soa_service_sdk::{UserLogger, UserService};

use crate::{
    catalog::ModuleSource,
    config::ServiceLoaderOptions,
    error::{error_chain, ConfigError, LoaderError},
};

/// Locates the user service in its module and instantiates it.
pub struct UserServiceLoader {
    options: ServiceLoaderOptions,
    source: Arc<dyn ModuleSource>,
}

impl UserServiceLoader {
    pub fn new(
        options: ServiceLoaderOptions,
        source: Arc<dyn ModuleSource>,
    ) -> Result<Self, ConfigError> {
        options.validate()?;
        Ok(Self { options, source })
    }

    pub fn options(&self) -> &ServiceLoaderOptions {
        &self.options
    }

    /// Loads the module and builds the first exported type implementing [`UserService`].
    ///
    /// Failures are logged with their full cause chain and returned as-is.
    pub fn create_service_instance(&self) -> Result<Box<dyn UserService>, LoaderError> {
        self.try_create().map_err(|err| {
            tracing::error!(
                module_path = %self.options.module_path.display(),
                error = %error_chain(&err),
                "error when creating user service instance"
            );
            err
        })
    }

    fn try_create(&self) -> Result<Box<dyn UserService>, LoaderError> {
        let path = &self.options.module_path;
        let module = self.source.load(path)?;
        let export = module
            .find_service_type()
            .ok_or_else(|| LoaderError::ContractNotFound {
                module: module.name.clone(),
                path: path.clone(),
            })?;

        let logger = UserLogger::new(export.name());
        let construct_err = |source: anyhow::Error| LoaderError::Construct {
            module: module.name.clone(),
            type_name: export.name().to_string(),
            path: path.clone(),
            source,
        };
        let service = match export.instantiate(logger) {
            Some(Ok(service)) => service,
            Some(Err(source)) => return Err(construct_err(source)),
            None => {
                return Err(LoaderError::ContractNotFound {
                    module: module.name.clone(),
                    path: path.clone(),
                })
            }
        };

        tracing::info!(
            module = %module.name,
            version = %module.version,
            service = export.name(),
            "user service instance created"
        );
        Ok(service)
    }
}
