use std::{sync::Arc, time::Instant};

use soa_service_sdk::{CancellationToken, InvokeError, UserService};
use tracing::Instrument;

use crate::{
    catalog::ModuleSource,
    config::HostConfig,
    error::{ConfigError, LoaderError},
    loader::UserServiceLoader,
};

/// Hands out user service instances on demand.
///
/// Every call to [`UserServiceFactory::create`] goes through the loader again,
/// so callers get a fresh instance each time.
#[derive(Clone)]
pub struct UserServiceFactory {
    loader: Arc<UserServiceLoader>,
}

impl UserServiceFactory {
    pub fn create(&self) -> Result<Box<dyn UserService>, LoaderError> {
        self.loader.create_service_instance()
    }

    pub fn loader(&self) -> &UserServiceLoader {
        &self.loader
    }
}

/// Binds the `[user_service]` section to the loader and returns the factory.
/// Options are validated here, at startup.
pub fn add_user_service(
    config: &HostConfig,
    source: Arc<dyn ModuleSource>,
) -> Result<UserServiceFactory, ConfigError> {
    let loader = UserServiceLoader::new(config.user_service.clone(), source)?;
    Ok(UserServiceFactory {
        loader: Arc::new(loader),
    })
}

/// Running host holding one resolved user service.
pub struct ServiceHost {
    service: Arc<dyn UserService>,
}

impl ServiceHost {
    /// Validates configuration and instantiates the user service up front,
    /// so a host with an unusable implementation never starts.
    pub fn start(config: &HostConfig, source: Arc<dyn ModuleSource>) -> anyhow::Result<Self> {
        config.validate()?;
        let factory = add_user_service(config, source)?;
        let service = factory.create()?;
        tracing::info!(
            module_path = %config.user_service.module_path.display(),
            "service host started"
        );
        Ok(Self {
            service: Arc::from(service),
        })
    }

    pub fn from_service(service: Arc<dyn UserService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> Arc<dyn UserService> {
        self.service.clone()
    }

    pub async fn invoke(
        &self,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<String, InvokeError> {
        let start = Instant::now();
        let span = tracing::info_span!(
            "invocation",
            input_bytes = input.len(),
            outcome = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        );
        let result = self
            .service
            .invoke(input, cancel)
            .instrument(span.clone())
            .await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(InvokeError::Cancelled) => "cancelled",
            Err(InvokeError::Failed(_)) => "error",
        };
        span.record("outcome", outcome);
        span.record("duration_ms", start.elapsed().as_millis() as u64);
        metrics::counter!("soa_invocations_total", "outcome" => outcome).increment(1);
        if let Err(InvokeError::Failed(err)) = &result {
            tracing::error!(error = %format!("{err:#}"), "user service invocation failed");
        }
        result
    }
}
