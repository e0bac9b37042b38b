use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name looked up for the process service's settings.
pub const PROCESS_SETTINGS_FILE: &str = "cgisettings.toml";

/// Prefix of environment variables feeding [`ProcessServiceOptions`].
pub const PROCESS_ENV_PREFIX: &str = "CGI_";

/// Root host configuration deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HostConfig {
    pub user_service: ServiceLoaderOptions,
}

impl HostConfig {
    pub fn from_toml(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.user_service.validate()
    }
}

/// Where the user service module lives.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServiceLoaderOptions {
    pub module_path: PathBuf,
}

impl ServiceLoaderOptions {
    pub fn new(module_path: impl Into<PathBuf>) -> Self {
        Self {
            module_path: module_path.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.module_path.as_os_str().to_string_lossy().trim().is_empty() {
            return Err(ConfigError::Missing {
                key: "user_service.module_path",
            });
        }
        Ok(())
    }
}

/// Program the process service runs for every invocation.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ProcessServiceOptions {
    pub command: String,
    pub arguments: Option<String>,
}

/// Highest-precedence layer, normally taken from the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessServiceOverrides {
    pub command: Option<String>,
    pub arguments: Option<String>,
}

impl ProcessServiceOptions {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            arguments: None,
        }
    }

    pub fn with_arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = Some(arguments.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::Missing { key: "command" });
        }
        Ok(())
    }

    /// Merges the settings file, `CGI_*` variables and overrides, later layers winning.
    ///
    /// A missing settings file is not an error.
    pub fn layered<I>(
        file: Option<&Path>,
        env: I,
        overrides: &ProcessServiceOverrides,
    ) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut options = match file {
            Some(path) if path.is_file() => {
                let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str::<ProcessServiceOptions>(&raw).map_err(|source| {
                    ConfigError::Parse {
                        path: path.to_path_buf(),
                        source,
                    }
                })?
            }
            _ => ProcessServiceOptions::default(),
        };

        for (key, value) in env {
            let Some(name) = strip_prefix_ignore_case(&key, PROCESS_ENV_PREFIX) else {
                continue;
            };
            if name.eq_ignore_ascii_case("COMMAND") {
                options.command = value;
            } else if name.eq_ignore_ascii_case("ARGUMENTS") {
                options.arguments = Some(value);
            }
        }

        if let Some(command) = &overrides.command {
            options.command = command.clone();
        }
        if let Some(arguments) = &overrides.arguments {
            options.arguments = Some(arguments.clone());
        }

        options.validate()?;
        Ok(options)
    }

    /// Loads the layers from the running process: settings next to the executable
    /// (or in the working directory) and the current environment.
    pub fn from_process_environment(
        overrides: &ProcessServiceOverrides,
    ) -> Result<Self, ConfigError> {
        let base = settings_base_dir();
        tracing::info!(dir = %base.display(), "looking up process service settings");
        let file = base.join(PROCESS_SETTINGS_FILE);
        let options = Self::layered(Some(file.as_path()), process_env(), overrides)?;
        tracing::info!(
            command = %options.command,
            arguments = options.arguments.as_deref().unwrap_or_default(),
            "process service configured"
        );
        Ok(options)
    }
}

fn settings_base_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .filter(|dir| !dir.as_os_str().is_empty())
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Current environment, skipping entries that are not valid Unicode.
fn process_env() -> impl Iterator<Item = (String, String)> {
    std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
}

fn strip_prefix_ignore_case<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    let head = key.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &key[prefix.len()..])
}
