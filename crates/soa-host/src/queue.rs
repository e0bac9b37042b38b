use anyhow::{bail, Result};
use clap::Args;
use serde::Serialize;

/// Environment variable consulted when `--connection-string` is absent.
pub const ENV_CONNECTION_STRING: &str = "QUEUE_CONNECTION_STRING";

pub const SERVICE_BUS_QUEUE: &str = "servicebus";
pub const STORAGE_QUEUE: &str = "storage";

/// Connectivity options for the queue the host would be fed from.
#[derive(Args, Debug, Clone)]
pub struct QueueOptions {
    /// Can also be set by env var QUEUE_CONNECTION_STRING.
    #[arg(short = 'C', long)]
    pub connection_string: Option<String>,

    /// Can be `servicebus` or `storage`.
    #[arg(short = 't', long, default_value = SERVICE_BUS_QUEUE)]
    pub queue_type: String,

    #[arg(short = 'n', long)]
    pub queue_name: String,

    /// Polling interval in milliseconds, for storage queue only.
    #[arg(short = 'i', long = "query-interval", default_value_t = 500)]
    pub query_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    ServiceBus,
    Storage,
}

/// Queue options after validation, with the connection string resolved.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedQueue {
    #[serde(skip_serializing)]
    pub connection_string: String,
    pub kind: QueueKind,
    pub queue_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_interval_ms: Option<u64>,
}

impl QueueOptions {
    pub fn validate(&self) -> Result<ResolvedQueue> {
        self.validate_with(|key| std::env::var(key).ok())
    }

    pub fn validate_with<F>(&self, env: F) -> Result<ResolvedQueue>
    where
        F: Fn(&str) -> Option<String>,
    {
        let connection_string = match self.connection_string.as_deref() {
            Some(value) if !value.trim().is_empty() => value.to_string(),
            _ => match env(ENV_CONNECTION_STRING) {
                Some(value) if !value.trim().is_empty() => value,
                _ => bail!(
                    "Connection string is missing! Set it either in command line or in environment variable {ENV_CONNECTION_STRING}!"
                ),
            },
        };

        let kind = if self.queue_type.eq_ignore_ascii_case(SERVICE_BUS_QUEUE) {
            QueueKind::ServiceBus
        } else if self.queue_type.eq_ignore_ascii_case(STORAGE_QUEUE) {
            QueueKind::Storage
        } else {
            bail!("Invalid queue type '{}'!", self.queue_type);
        };

        if self.queue_name.trim().is_empty() {
            bail!("queue name must not be empty");
        }

        Ok(ResolvedQueue {
            connection_string,
            kind,
            queue_name: self.queue_name.clone(),
            query_interval_ms: (kind == QueueKind::Storage).then_some(self.query_interval_ms),
        })
    }
}
