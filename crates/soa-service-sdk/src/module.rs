use std::{fmt, sync::Arc};

use semver::Version;

use crate::{UserLogger, UserService, API_VERSION};

/// Constructor the host calls to instantiate an exported service type.
pub type ServiceConstructor =
    Arc<dyn Fn(UserLogger) -> anyhow::Result<Box<dyn UserService>> + Send + Sync>;

/// Service types that can be built from the diagnostic sink alone.
pub trait FromLogger: UserService + Sized {
    fn from_logger(logger: UserLogger) -> anyhow::Result<Self>;
}

/// One type exported by a service module.
#[derive(Clone)]
pub struct ExportedType {
    name: String,
    constructor: Option<ServiceConstructor>,
}

impl ExportedType {
    /// Exports `T` under its Rust type name.
    pub fn service<T: FromLogger>() -> Self {
        Self::with_constructor(std::any::type_name::<T>(), |logger| {
            let service = T::from_logger(logger)?;
            Ok(Box::new(service) as Box<dyn UserService>)
        })
    }

    pub fn with_constructor<F>(name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(UserLogger) -> anyhow::Result<Box<dyn UserService>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            constructor: Some(Arc::new(constructor)),
        }
    }

    /// A helper or data type that does not implement the service contract.
    pub fn opaque(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constructor: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn implements_service(&self) -> bool {
        self.constructor.is_some()
    }

    /// Runs the constructor; `None` when the type is not a service.
    pub fn instantiate(&self, logger: UserLogger) -> Option<anyhow::Result<Box<dyn UserService>>> {
        self.constructor.as_ref().map(|ctor| ctor(logger))
    }
}

impl fmt::Debug for ExportedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedType")
            .field("name", &self.name)
            .field("implements_service", &self.implements_service())
            .finish()
    }
}

/// Unit of deployment the host loads a user service from.
#[derive(Debug, Clone)]
pub struct ServiceModule {
    pub name: String,
    pub version: Version,
    pub api_version: Version,
    exports: Vec<ExportedType>,
}

impl ServiceModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: Version::new(0, 1, 0),
            api_version: API_VERSION,
            exports: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_api_version(mut self, api_version: Version) -> Self {
        self.api_version = api_version;
        self
    }

    pub fn export(mut self, export: ExportedType) -> Self {
        self.exports.push(export);
        self
    }

    /// Exports in enumeration order, which is the order they were added.
    pub fn exports(&self) -> &[ExportedType] {
        &self.exports
    }

    /// First export implementing the service contract.
    ///
    /// Several conforming exports are not an error: the earliest one wins.
    pub fn find_service_type(&self) -> Option<&ExportedType> {
        self.exports.iter().find(|export| export.implements_service())
    }

    pub fn is_compatible(&self) -> bool {
        self.api_version.major == API_VERSION.major
    }
}
