//! Proxy engine administrative surface
//!
//! The reverse-proxy engine is a black box that accepts a full configuration
//! document on its admin endpoint and either acknowledges it (2xx) or rejects
//! it. The live configuration is replaced wholesale on every successful load.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::synth::ConfigDocument;

/// Something that can load a synthesized document into a running proxy
#[async_trait]
pub trait ProxyEngine: Send + Sync {
    async fn load(&self, doc: &ConfigDocument) -> Result<(), EngineError>;
}

/// Engine reached over its HTTP admin API
pub struct AdminApiEngine {
    client: reqwest::Client,
    load_url: String,
    timeout: Duration,
}

impl AdminApiEngine {
    pub fn new(config: &EngineConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build engine HTTP client: {}", e))?;
        Ok(Self {
            client,
            load_url: config.load_url(),
            timeout: config.timeout(),
        })
    }

    pub fn load_url(&self) -> &str {
        &self.load_url
    }

    fn transport_error(&self, e: reqwest::Error) -> EngineError {
        if e.is_timeout() {
            EngineError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            EngineError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl ProxyEngine for AdminApiEngine {
    async fn load(&self, doc: &ConfigDocument) -> Result<(), EngineError> {
        debug!(url = %self.load_url, hash = %doc.hash, "Submitting config to proxy engine");

        let response = self
            .client
            .post(&self.load_url)
            .header("Content-Type", "application/json")
            .body(doc.to_bytes())
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response
            .text()
            .await
            .map_err(|e| self.transport_error(e))?;
        warn!(status = status.as_u16(), "Proxy engine rejected config");
        Err(EngineError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
