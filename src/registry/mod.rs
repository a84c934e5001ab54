//! Control-plane protocol: typed requests, pluggable transports, retries,
//! and an in-memory registry that speaks the same protocol.

pub mod client;
pub mod http;
pub mod memory;
pub mod protocol;
pub mod retry;
pub mod transport;

pub use client::{EventPage, RegistryClient};
pub use http::HttpTransport;
pub use memory::InMemoryRegistry;
pub use protocol::{ExecutionRecord, RegistryFault, RegistryReply, RegistryRequest, RegistryResponse};
pub use retry::RetryPolicy;
pub use transport::{FnTransport, Transport, TransportError};
