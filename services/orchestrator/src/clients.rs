//! Client construction seam.
//!
//! The sync engine and dispatcher obtain their upstream clients through
//! `ClientFactory`, so tests can substitute scripted implementations.
//! The production factory decrypts the connector's API key on demand and
//! builds a reqwest client with the caller's timeout; the plaintext key
//! lives only inside the returned client.

use std::sync::Arc;
use std::time::Duration;

use arr_api::{HttpUpstreamClient, UpstreamClient, UpstreamError};

use crate::store::connectors::Connector;
use crate::vault::Vault;

/// Builds an upstream client for a connector.
pub trait ClientFactory: Send + Sync {
    fn client_for(
        &self,
        connector: &Connector,
        timeout: Duration,
    ) -> Result<Arc<dyn UpstreamClient>, UpstreamError>;
}

/// Production factory: vault-decrypted key + reqwest client.
pub struct HttpClientFactory {
    vault: Arc<Vault>,
}

impl HttpClientFactory {
    pub fn new(vault: Arc<Vault>) -> Self {
        HttpClientFactory { vault }
    }
}

impl ClientFactory for HttpClientFactory {
    fn client_for(
        &self,
        connector: &Connector,
        timeout: Duration,
    ) -> Result<Arc<dyn UpstreamClient>, UpstreamError> {
        let api_key = self
            .vault
            .decrypt(&connector.api_key_enc)
            .map_err(|e| UpstreamError::Validation(format!("api key unusable: {e}")))?;
        let client = HttpUpstreamClient::with_timeout(
            connector.dialect,
            &connector.base_url,
            &api_key,
            timeout,
        )?;
        Ok(Arc::new(client))
    }
}
