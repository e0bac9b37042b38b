use std::{fmt, sync::Arc};

use tracing::Span;

/// Diagnostic sink handed to a user service when it is constructed.
///
/// Every event is emitted inside a `user_service` span carrying the service's
/// type identity, so its output stays attributable in the host's log stream.
#[derive(Clone)]
pub struct UserLogger {
    service: Arc<str>,
    span: Span,
}

impl UserLogger {
    pub fn new(service: impl Into<Arc<str>>) -> Self {
        let service = service.into();
        let span = tracing::info_span!("user_service", service = %service);
        Self { service, span }
    }

    /// Type identity the logger is bound to.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Span to instrument async work with.
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn debug(&self, message: impl fmt::Display) {
        self.span
            .in_scope(|| tracing::debug!(service = %self.service, "{message}"));
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.span
            .in_scope(|| tracing::info!(service = %self.service, "{message}"));
    }

    pub fn warn(&self, message: impl fmt::Display) {
        self.span
            .in_scope(|| tracing::warn!(service = %self.service, "{message}"));
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.span
            .in_scope(|| tracing::error!(service = %self.service, "{message}"));
    }
}

impl fmt::Debug for UserLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserLogger")
            .field("service", &self.service)
            .finish()
    }
}
