//! Reachability-only collaborator backed by a TCP connect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::{Collaborator, CollaboratorError};
use crate::config::CollaboratorConfig;

#[derive(Debug)]
pub struct TcpCollaborator {
    name: String,
    address: String,
    connect_timeout: Duration,
    closed: AtomicBool,
}

impl TcpCollaborator {
    pub fn new(name: impl Into<String>, address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            connect_timeout,
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(name: &str, config: &CollaboratorConfig, connect_timeout: Duration) -> Self {
        Self::new(name, config.address.clone(), connect_timeout)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<(), CollaboratorError> {
        match time::timeout(self.connect_timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(source)) => Err(CollaboratorError::Unreachable {
                name: self.name.clone(),
                address: self.address.clone(),
                source,
            }),
            Err(_) => Err(CollaboratorError::Timeout {
                name: self.name.clone(),
                after: self.connect_timeout,
            }),
        }
    }
}

impl Collaborator for TcpCollaborator {
    fn name(&self) -> &str {
        &self.name
    }

    fn ping(&self, token: CancellationToken) -> BoxFuture<'_, Result<(), CollaboratorError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(CollaboratorError::Closed(self.name.clone()));
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(CollaboratorError::Cancelled(self.name.clone())),
                result = self.connect() => result,
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), CollaboratorError>> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::AcqRel) {
                tracing::info!(collaborator = %self.name, address = %self.address, "Collaborator closed");
            }
            Ok(())
        })
    }
}
