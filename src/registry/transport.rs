use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::registry::protocol::{RegistryRequest, RegistryResponse};

/// Why a request never got a registry response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Worth retrying: connection failures, timeouts, 5xx, 429.
    #[error("transient transport failure: {0}")]
    Transient(String),
    /// Retrying will not help: bad credentials, malformed requests.
    #[error("permanent transport failure: {0}")]
    Permanent(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Moves one request to the registry and brings its response back.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: RegistryRequest) -> Result<RegistryResponse, TransportError>;
}

type SendFn =
    dyn Fn(RegistryRequest) -> BoxFuture<'static, Result<RegistryResponse, TransportError>> + Send + Sync;

/// Transport backed by a plain function, for wiring tests and adapters.
pub struct FnTransport {
    send: Arc<SendFn>,
}

impl FnTransport {
    pub fn new<F>(send: F) -> Self
    where
        F: Fn(RegistryRequest) -> BoxFuture<'static, Result<RegistryResponse, TransportError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            send: Arc::new(send),
        }
    }
}

#[async_trait]
impl Transport for FnTransport {
    async fn send(&self, request: RegistryRequest) -> Result<RegistryResponse, TransportError> {
        (self.send)(request).await
    }
}
