//! In-process transport that replays scripted responses.
//!
//! Useful for tests and for embedders that drive journeys without a server.
//! Every request is recorded; a gate can hold responses back so callers can
//! observe the engine while a request is in flight.

use super::{StartOptions, Transport, TransportError};
use crate::journey::{ContinuingNode, Node};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::debug;
use url::Url;

#[derive(Clone, Debug, PartialEq)]
pub enum Recorded {
    Start { journey: String, options: StartOptions },
    /// Node name and the wire values of its collectors, keyed by id.
    Submit {
        node: String,
        values: BTreeMap<String, serde_json::Value>,
    },
    Resume { url: String },
}

#[derive(Default)]
struct Script {
    responses: VecDeque<Result<Node, TransportError>>,
    recorded: Vec<Recorded>,
}

#[derive(Clone)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
    gate: Arc<watch::Sender<bool>>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    #[must_use]
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            script: Arc::new(Mutex::new(Script::default())),
            gate: Arc::new(gate),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues the next response.
    #[must_use]
    pub fn then(self, node: Node) -> Self {
        self.push(Ok(node));
        self
    }

    /// Queues a transport failure.
    #[must_use]
    pub fn then_fail(self, err: TransportError) -> Self {
        self.push(Err(err));
        self
    }

    pub fn push(&self, response: Result<Node, TransportError>) {
        self.lock().responses.push_back(response);
    }

    /// While closed, requests are recorded but their responses are held.
    pub fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    #[must_use]
    pub fn recorded(&self) -> Vec<Recorded> {
        self.lock().recorded.clone()
    }

    #[must_use]
    pub fn submissions(&self) -> usize {
        self.lock()
            .recorded
            .iter()
            .filter(|r| matches!(r, Recorded::Submit { .. }))
            .count()
    }

    async fn respond(&self, request: Recorded) -> Result<Node, TransportError> {
        debug!(?request, "scripted request");
        self.lock().recorded.push(request);

        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map_err(|_| TransportError::Network("gate dropped".to_string()))?;

        self.lock()
            .responses
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Network("script exhausted".to_string())))
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn start_flow(&self, journey: &str, options: &StartOptions) -> Result<Node, TransportError> {
        self.respond(Recorded::Start {
            journey: journey.to_string(),
            options: options.clone(),
        })
        .await
    }

    async fn submit_node(&self, node: &ContinuingNode) -> Result<Node, TransportError> {
        let values = node
            .collectors()
            .iter()
            .map(|c| (c.id().to_string(), c.value().to_wire()))
            .collect();
        self.respond(Recorded::Submit {
            node: node.name.clone(),
            values,
        })
        .await
    }

    async fn resume(&self, resume_url: &Url) -> Result<Node, TransportError> {
        self.respond(Recorded::Resume {
            url: resume_url.to_string(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journey::Node;
    use std::time::Duration;

    #[tokio::test]
    async fn replays_in_order_and_records() {
        let transport = ScriptedTransport::new()
            .then(Node::local_error("first", "unknown"))
            .then_fail(TransportError::Network("down".into()));

        let first = transport.start_flow("Login", &StartOptions::default()).await;
        assert!(matches!(first, Ok(Node::Error { .. })));
        let second = transport.start_flow("Login", &StartOptions::default()).await;
        assert!(matches!(second, Err(TransportError::Network(_))));
        let third = transport.start_flow("Login", &StartOptions::default()).await;
        assert!(third.unwrap_err().to_string().contains("script exhausted"));
        assert_eq!(transport.recorded().len(), 3);
    }

    #[tokio::test]
    async fn gate_holds_responses() {
        let transport = ScriptedTransport::new().then(Node::local_error("held", "unknown"));
        transport.close_gate();

        let pending = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.start_flow("Login", &StartOptions::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());
        assert_eq!(transport.recorded().len(), 1);

        transport.open_gate();
        assert!(pending.await.unwrap().is_ok());
    }
}
