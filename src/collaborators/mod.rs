//! External collaborators (database, cache).
//!
//! The lifecycle only needs two things from a backing service: a way to check
//! it is reachable and a way to release it. Real clients plug in by
//! implementing [`Collaborator`].

mod tcp;

pub use tcp::TcpCollaborator;

use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("{name} unreachable at {address}: {source}")]
    Unreachable {
        name: String,
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{name} did not answer within {after:?}")]
    Timeout { name: String, after: Duration },

    #[error("{0} is closed")]
    Closed(String),

    #[error("{0} ping cancelled")]
    Cancelled(String),

    #[error("{name}: {reason}")]
    Other { name: String, reason: String },
}

/// A backing service consumed through `ping` and `close` only.
pub trait Collaborator: Send + Sync + 'static {
    /// Short name used for the health check and in logs.
    fn name(&self) -> &str;

    /// Verify the service is reachable. Should return early once `token` fires.
    fn ping(&self, token: CancellationToken) -> BoxFuture<'_, Result<(), CollaboratorError>>;

    /// Release the connection. May be called at most once per shutdown; later
    /// pings fail.
    fn close(&self) -> BoxFuture<'_, Result<(), CollaboratorError>>;
}
