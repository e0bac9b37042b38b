pub mod logger;
pub mod module;

pub use logger::UserLogger;
pub use module::{ExportedType, FromLogger, ServiceConstructor, ServiceModule};
pub use tokio_util::sync::CancellationToken;

pub use async_trait::async_trait;

/// Version of the service contract that modules are built against.
pub const API_VERSION: semver::Version = semver::Version::new(1, 0, 0);

/// Contract every user service implementation exposes to the host.
#[async_trait]
pub trait UserService: Send + Sync + 'static {
    /// Handles one request payload and returns the response payload.
    ///
    /// Implementations must not block the calling scheduler. Cancellation is
    /// cooperative: once `cancel` fires the implementation should stop waiting
    /// and return [`InvokeError::Cancelled`].
    async fn invoke(&self, input: &str, cancel: &CancellationToken) -> Result<String, InvokeError>;
}

/// Failures that escape an invocation instead of being folded into its payload.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("invocation was cancelled")]
    Cancelled,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl InvokeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, InvokeError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    #[async_trait]
    impl UserService for Upper {
        async fn invoke(
            &self,
            input: &str,
            cancel: &CancellationToken,
        ) -> Result<String, InvokeError> {
            if cancel.is_cancelled() {
                return Err(InvokeError::Cancelled);
            }
            Ok(input.to_uppercase())
        }
    }

    #[tokio::test]
    async fn trait_objects_are_invocable() {
        let service: Box<dyn UserService> = Box::new(Upper);
        let out = service
            .invoke("ping", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "PING");
    }

    #[tokio::test]
    async fn cancelled_token_surfaces_as_cancelled_kind() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = Upper.invoke("ping", &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn api_version_is_stable_major() {
        assert_eq!(API_VERSION.major, 1);
        assert_eq!(API_VERSION.to_string(), "1.0.0");
    }
}
