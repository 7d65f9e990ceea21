//! Active proxy probing.
//!
//! Probing is the only outbound I/O the proxy subsystem performs, so it
//! sits behind a trait: the engine's maintenance loop sweeps cooled-down
//! unhealthy proxies through a [`ProxyProber`] and feeds the results back
//! into the pool.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProxyError;
use crate::proxy::model::ProxyEndpoint;

/// Issues a single request through a candidate proxy.
#[async_trait]
pub trait ProxyProber: Send + Sync {
    /// Ok with the observed latency when the proxy is usable.
    async fn probe(&self, endpoint: &ProxyEndpoint) -> Result<Duration, ProxyError>;
}

/// HTTP prober: fetches a test URL through the candidate proxy.
pub struct HttpProber {
    test_url: String,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(test_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            test_url: test_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ProxyProber for HttpProber {
    async fn probe(&self, endpoint: &ProxyEndpoint) -> Result<Duration, ProxyError> {
        let failed = |reason: String| ProxyError::ProbeFailed {
            addr: endpoint.display_addr(),
            reason,
        };

        let proxy = reqwest::Proxy::all(endpoint.url()).map_err(|e| failed(e.to_string()))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| failed(e.to_string()))?;

        let started = std::time::Instant::now();
        let response = client
            .get(&self.test_url)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        if response.status().is_success() {
            Ok(started.elapsed())
        } else {
            Err(failed(format!("status {}", response.status())))
        }
    }
}
