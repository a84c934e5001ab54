use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::error::{Result, TaskError};
use crate::registry::protocol::{RegistryRequest, RegistryResponse};
use crate::registry::transport::{Transport, TransportError};

pub const ORGANIZATION_HEADER: &str = "X-Organization-Id";

/// POSTs each request as JSON to `{api_url}/registry`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    access_token: Option<String>,
    organization_id: Option<String>,
}

impl HttpTransport {
    pub fn new(
        api_url: &str,
        access_token: Option<String>,
        organization_id: Option<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TaskError::InvalidConfig(format!("cannot build http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/registry", api_url.trim_end_matches('/')),
            access_token,
            organization_id,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn classify_status(status: StatusCode) -> Option<TransportError> {
    if status.is_success() {
        None
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Some(TransportError::Transient(format!("registry answered {status}")))
    } else {
        Some(TransportError::Permanent(format!("registry answered {status}")))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: RegistryRequest) -> Result<RegistryResponse, TransportError> {
        let op = request.op();
        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(token) = &self.access_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(org) = &self.organization_id {
            builder = builder.header(ORGANIZATION_HEADER, org);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_builder() {
                TransportError::Permanent(e.to_string())
            } else {
                TransportError::Transient(e.to_string())
            }
        })?;
        let status = response.status();
        debug!(op, status = status.as_u16(), "registry call");
        if let Some(error) = classify_status(status) {
            return Err(error);
        }
        response
            .json::<RegistryResponse>()
            .await
            .map_err(|e| TransportError::Permanent(format!("malformed registry response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_split_into_transient_and_permanent() {
        assert_eq!(classify_status(StatusCode::OK), None);
        assert!(classify_status(StatusCode::BAD_GATEWAY).unwrap().is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS).unwrap().is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED).unwrap().is_transient());
    }

    #[test]
    fn endpoint_is_derived_from_the_api_url() {
        let transport = HttpTransport::new("https://api.example.com/", None, None).unwrap();
        assert_eq!(transport.endpoint(), "https://api.example.com/registry");
    }
}
