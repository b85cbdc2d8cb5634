//! The engine's only way to reach the server.

pub mod http;
pub mod memory;

use crate::journey::{ContinuingNode, Node};
use async_trait::async_trait;
use thiserror::Error;
use url::Url;

pub use http::{HttpTransport, HttpTransportConfig};
pub use memory::ScriptedTransport;

/// Transport failures. The current node stays valid and may be resubmitted.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server error {status}: {message}")]
    Http { status: u16, message: String },
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("not supported by this transport: {0}")]
    Unsupported(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Extra parameters for the first request of a journey.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StartOptions {
    pub force_auth: bool,
    pub no_session: bool,
    pub query: Vec<(String, String)>,
}

impl StartOptions {
    #[must_use]
    pub fn with_force_auth(mut self, force_auth: bool) -> Self {
        self.force_auth = force_auth;
        self
    }

    #[must_use]
    pub fn with_no_session(mut self, no_session: bool) -> Self {
        self.no_session = no_session;
        self
    }

    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn start_flow(&self, journey: &str, options: &StartOptions) -> Result<Node, TransportError>;

    /// Submits the node with its current collector values.
    async fn submit_node(&self, node: &ContinuingNode) -> Result<Node, TransportError>;

    /// Continues a flow after an external redirect (social login, email link).
    async fn resume(&self, resume_url: &Url) -> Result<Node, TransportError> {
        Err(TransportError::Unsupported(format!("resume from {resume_url}")))
    }
}
