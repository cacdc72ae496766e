//! HTTP request issuer
//!
//! Log submission and record lookup only need GET and POST with a status and
//! a body back. Callers hold a `&dyn HttpTransport` so tests can substitute
//! an in-memory log.

use crate::error::AttestError;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn body_text(&self) -> Result<&str, AttestError> {
        std::str::from_utf8(&self.body)
            .map_err(|_| AttestError::ParseError("response body is not UTF-8".to_string()))
    }
}

pub trait HttpTransport: Send + Sync {
    fn get(&self, url: &str) -> Result<HttpResponse, AttestError>;
    fn post(&self, url: &str, body: &[u8]) -> Result<HttpResponse, AttestError>;
}

/// `ureq` agent that returns every status as a response.
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(timeout))
            .build()
            .into();
        UreqTransport { agent }
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport for UreqTransport {
    fn get(&self, url: &str) -> Result<HttpResponse, AttestError> {
        log::debug!("GET {}", url);
        let response = self.agent.get(url).call()?;
        let status = response.status().as_u16();
        let body = response.into_body().read_to_vec()?;
        Ok(HttpResponse { status, body })
    }

    fn post(&self, url: &str, body: &[u8]) -> Result<HttpResponse, AttestError> {
        log::debug!("POST {} ({} bytes)", url, body.len());
        let response = self
            .agent
            .post(url)
            .header("Content-Type", "text/plain")
            .send(body)?;
        let status = response.status().as_u16();
        let body = response.into_body().read_to_vec()?;
        Ok(HttpResponse { status, body })
    }
}
