use thiserror::Error;

/// Errors surfaced by the reconciler to its caller.
///
/// `Requeue` covers every transient condition the spec calls out: a cluster
/// object that isn't there yet, a write conflict, a netlink hiccup that
/// wasn't already absorbed by the adapter's idempotence. `Fatal` is reserved
/// for configuration errors that no amount of retrying will fix (no family
/// enabled, a named parent interface that doesn't exist).
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("transient error, requeue: {0}")]
    Requeue(#[source] anyhow::Error),

    #[error("fatal configuration error: {0}")]
    Fatal(#[source] anyhow::Error),
}

impl ReconcileError {
    pub fn requeue(err: impl Into<anyhow::Error>) -> Self {
        ReconcileError::Requeue(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        ReconcileError::Fatal(err.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ReconcileError::Fatal(_))
    }
}
