// Session collaborators notified by the request client

/// Hooks into the embedding application's session handling
pub trait SessionHooks: Send + Sync {
    /// The session can no longer be recovered; credentials have already been
    /// cleared and the application should return to its login entry point.
    fn on_auth_expired(&self);

    /// A best-effort context header could not be obtained. The request was
    /// still sent without it.
    fn on_enrichment_failed(&self, source: &str, error: &anyhow::Error) {
        let _ = (source, error);
    }
}

/// Hooks that only log, for headless use
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSessionHooks;

impl SessionHooks for LoggingSessionHooks {
    fn on_auth_expired(&self) {
        tracing::warn!("Session expired, sign-in required");
    }

    fn on_enrichment_failed(&self, source: &str, error: &anyhow::Error) {
        tracing::debug!(source = source, error = %error, "Context header unavailable");
    }
}
