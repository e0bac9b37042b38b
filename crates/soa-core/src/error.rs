use std::{error::Error as StdError, path::PathBuf};

use thiserror::Error;

/// Startup configuration problems. Always fatal, never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} is required but missing in configuration")]
    Missing { key: &'static str },

    #[error("failed to read configuration file {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Failures while resolving and instantiating the user service.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("module path `{}` does not name a module", .path.display())]
    InvalidPath { path: PathBuf },

    #[error("user service module `{module}` could not be found for {}", .path.display())]
    ModuleNotFound { module: String, path: PathBuf },

    #[error("failed to load user service module from {}", .path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error(
        "module `{module}` from {} targets service API {found}, host supports {expected}",
        .path.display()
    )]
    IncompatibleModule {
        module: String,
        path: PathBuf,
        found: semver::Version,
        expected: semver::Version,
    },

    #[error(
        "can't find a type that implements UserService in `{module}` from {}",
        .path.display()
    )]
    ContractNotFound { module: String, path: PathBuf },

    #[error(
        "failed to construct `{type_name}` from module `{module}` ({})",
        .path.display()
    )]
    Construct {
        module: String,
        type_name: String,
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

impl LoaderError {
    /// True when the module loaded but exposed no conforming type.
    pub fn is_contract_not_found(&self) -> bool {
        matches!(self, LoaderError::ContractNotFound { .. })
    }

    /// True for every failure that happened before or during construction.
    pub fn is_load_error(&self) -> bool {
        !self.is_contract_not_found()
    }
}

/// Renders an error with all of its sources, outermost first.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
