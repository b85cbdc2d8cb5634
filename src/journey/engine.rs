//! The flow engine: sole owner and writer of a journey's session state.
//!
//! State machine: uninitialised, then any number of continuing nodes, then
//! one terminal node (success, failure or error). Only `start` (or `restart`)
//! leaves a terminal state, and it begins a logically new flow.
//!
//! State-changing operations are single-flight: while one transport request
//! is outstanding, `advance` returns the current node untouched and `start`,
//! `resume` and `restart` are rejected.

use super::dispatcher::{CallbackDispatcher, DispatchPlan, DispatchReport};
use super::error::{FlowError, Result};
use super::node::{ContinuingNode, Node};
use super::prompt::PromptCoordinator;
use super::resolver::{self, TerminalOutcome};
use crate::transport::{StartOptions, Transport, TransportError};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// On `restart`, copy values from the last continuing node into the new
    /// first node when stage and composition match.
    pub carry_values_on_restart: bool,
    /// Reject `advance` while a collector fails local validation instead of
    /// leaving the decision to the server.
    pub validate_before_submit: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            carry_values_on_restart: true,
            validate_before_submit: false,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn with_carry_values_on_restart(mut self, carry: bool) -> Self {
        self.carry_values_on_restart = carry;
        self
    }

    #[must_use]
    pub fn with_validate_before_submit(mut self, validate: bool) -> Self {
        self.validate_before_submit = validate;
        self
    }
}

/// Observable state of one flow. Read-only for everybody but the engine.
#[derive(Clone, Debug, Default)]
pub struct FlowSession {
    pub flow_id: Option<Uuid>,
    pub journey: Option<String>,
    pub current: Option<Node>,
    pub previous: Option<Node>,
    pub is_loading: bool,
    /// Last transport or action error; the current node stays usable.
    pub last_error: Option<String>,
}

impl FlowSession {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.current.as_ref().is_some_and(Node::is_terminal)
    }

    #[must_use]
    pub fn outcome(&self) -> Option<TerminalOutcome> {
        self.current.as_ref().and_then(resolver::classify)
    }

    /// The continuing node to show again after a failure or error, so the
    /// user can correct the input before restarting.
    #[must_use]
    pub fn retry_node(&self) -> Option<&ContinuingNode> {
        match self.current {
            Some(Node::Failure(_) | Node::Error { .. }) => {
                self.previous.as_ref().and_then(Node::as_continuing)
            }
            _ => None,
        }
    }
}

pub struct FlowEngine {
    transport: Arc<dyn Transport>,
    dispatcher: CallbackDispatcher,
    config: EngineConfig,
    prompts: PromptCoordinator,
    session: watch::Sender<FlowSession>,
    in_flight: AtomicBool,
    cancellations: watch::Sender<Option<String>>,
    last_start: Mutex<Option<(String, StartOptions)>>,
}

struct LoadingGuard<'a> {
    engine: &'a FlowEngine,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.engine.session.send_modify(|s| s.is_loading = false);
        self.engine.in_flight.store(false, Ordering::Release);
    }
}

impl FlowEngine {
    #[must_use]
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::with_transport(Arc::new(transport))
    }

    #[must_use]
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        let (session, _) = watch::channel(FlowSession::default());
        let (cancellations, _) = watch::channel(None);
        Self {
            transport,
            dispatcher: CallbackDispatcher::default(),
            config: EngineConfig::default(),
            prompts: PromptCoordinator::new(),
            session,
            in_flight: AtomicBool::new(false),
            cancellations,
            last_start: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: CallbackDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Snapshot of the session.
    #[must_use]
    pub fn session(&self) -> FlowSession {
        self.session.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<FlowSession> {
        self.session.subscribe()
    }

    /// The coordinator the UI answers prompts through.
    #[must_use]
    pub fn prompts(&self) -> &PromptCoordinator {
        &self.prompts
    }

    #[must_use]
    pub fn dispatcher(&self) -> &CallbackDispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn plan(&self, node: &ContinuingNode) -> DispatchPlan {
        self.dispatcher.plan(node)
    }

    #[must_use]
    pub fn outcome(&self) -> Option<TerminalOutcome> {
        self.session.borrow().outcome()
    }

    fn begin(&self) -> Option<LoadingGuard<'_>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        self.session.send_modify(|s| s.is_loading = true);
        Some(LoadingGuard { engine: self })
    }

    fn last_start(&self) -> MutexGuard<'_, Option<(String, StartOptions)>> {
        self.last_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `work` unless the flow is cancelled first.
    async fn until_cancelled<T>(
        &self,
        cancel_rx: &mut watch::Receiver<Option<String>>,
        work: impl Future<Output = T>,
    ) -> std::result::Result<T, String> {
        tokio::select! {
            out = work => Ok(out),
            _ = cancel_rx.changed() => {
                Err(cancel_rx.borrow().clone().unwrap_or_else(|| "cancelled".to_string()))
            }
        }
    }

    /// Applies `apply` unless a cancellation arrived since `cancel_rx` was taken.
    fn commit(
        &self,
        cancel_rx: &watch::Receiver<Option<String>>,
        apply: impl FnOnce(&mut FlowSession),
    ) -> bool {
        self.session.send_if_modified(|s| {
            if cancel_rx.has_changed().unwrap_or(true) {
                return false;
            }
            apply(s);
            true
        })
    }

    fn record_error(&self, message: String) {
        self.session.send_modify(|s| s.last_error = Some(message));
    }

    /// Moves a live flow to a terminal `Error` classified as cancelled.
    /// With `flow_id` set, only that flow is ended; a newer flow is left alone.
    fn terminate(&self, reason: &str, flow_id: Option<Uuid>) {
        self.session.send_if_modified(|s| {
            if flow_id.is_some_and(|id| s.flow_id != Some(id)) {
                debug!(%reason, "cancelled collector belongs to an earlier flow");
                return false;
            }
            let live = s.current.as_ref().is_some_and(|node| !node.is_terminal());
            if !live {
                return false;
            }
            s.previous = s.current.take();
            s.current = Some(Node::local_error(reason, "cancelled"));
            true
        });
    }

    /// Begins a new flow. The returned node becomes both current and previous.
    ///
    /// # Errors
    /// `Transport` if the first request fails, `InvalidState` if another
    /// operation is in flight, `Cancelled` if the flow is cancelled meanwhile.
    #[instrument(skip(self, options))]
    pub async fn start(&self, journey: &str, options: StartOptions) -> Result<Node> {
        let Some(_guard) = self.begin() else {
            return Err(FlowError::invalid_state(
                "cannot start while another request is in flight",
            ));
        };

        // prompts of an earlier flow never leak into this one
        self.prompts.cancel("a new flow was started");
        self.prompts.reopen();
        *self.last_start() = Some((journey.to_string(), options.clone()));

        let flow_id = Uuid::new_v4();
        info!(%flow_id, "starting journey");

        let mut cancel_rx = self.cancellations.subscribe();
        let response = self
            .until_cancelled(&mut cancel_rx, self.transport.start_flow(journey, &options))
            .await
            .map_err(FlowError::Cancelled)?;

        let node = match response {
            Ok(node) => node,
            Err(err) => return Err(self.transport_failed(err)),
        };

        let committed = self.commit(&cancel_rx, |s| {
            s.flow_id = Some(flow_id);
            s.journey = Some(journey.to_string());
            s.previous = Some(node.clone());
            s.current = Some(node.clone());
            s.last_error = None;
        });
        if !committed {
            return Err(FlowError::Cancelled("flow cancelled during start".to_string()));
        }

        log_node(&node);
        Ok(node)
    }

    /// Submits `node` and moves to the server's answer.
    ///
    /// While another request is in flight this is a no-op returning the
    /// current node.
    ///
    /// # Errors
    /// `InvalidState` for terminal nodes, a terminal or missing flow, or a
    /// node that is not the current step. `Validation` when
    /// `validate_before_submit` is set and a collector is invalid.
    /// `Transport` if the request fails; the current node is kept and may be
    /// resubmitted.
    #[instrument(skip_all, fields(node = node.label()))]
    pub async fn advance(&self, node: Node) -> Result<Node> {
        let node = node.into_continuing()?;

        let current = self.session.borrow().current.clone();
        let current = match current {
            None => return Err(FlowError::invalid_state("no flow has been started")),
            Some(Node::Continuing(current)) => current,
            Some(terminal) => {
                return Err(FlowError::invalid_state(format!(
                    "flow already ended with a {} node; start a new flow",
                    terminal.label()
                )))
            }
        };
        if !node.same_composition(&current) {
            return Err(FlowError::invalid_state(format!(
                "node '{}' is not the current step '{}'",
                node.name, current.name
            )));
        }

        let Some(_guard) = self.begin() else {
            debug!("advance ignored, a request is already in flight");
            return Ok(Node::Continuing(current));
        };

        let report = node.validate();
        if let Some((collector, errors)) = report.into_iter().next() {
            if self.config.validate_before_submit {
                return Err(FlowError::Validation { collector, errors });
            }
            debug!(%collector, "submitting with local validation errors");
        }

        let mut cancel_rx = self.cancellations.subscribe();
        let response = self
            .until_cancelled(&mut cancel_rx, self.transport.submit_node(&node))
            .await
            .map_err(FlowError::Cancelled)?;

        let next = match response {
            Ok(next) => next,
            Err(err) => return Err(self.transport_failed(err)),
        };

        let committed = self.commit(&cancel_rx, |s| {
            s.previous = Some(Node::Continuing(node));
            s.current = Some(next.clone());
            s.last_error = None;
        });
        if !committed {
            return Err(FlowError::Cancelled("flow cancelled during submit".to_string()));
        }

        log_node(&next);
        Ok(next)
    }

    /// Runs the autonomous and prompt-suspended collectors of `node`.
    ///
    /// `node` is borrowed mutably for the whole run, so it cannot be passed
    /// to `advance` before its actions finish.
    ///
    /// # Errors
    /// `InvalidState` for terminal nodes. `Cancelled` if a prompt or the flow
    /// was cancelled; the flow then ends with a cancelled `Error` node.
    #[instrument(skip_all)]
    pub async fn collect(&self, node: &mut Node) -> Result<DispatchReport> {
        let continuing = node
            .as_continuing_mut()
            .ok_or_else(|| FlowError::invalid_state("terminal nodes have no collectors to run"))?;

        let flow_id = self.session.borrow().flow_id;
        let mut cancel_rx = self.cancellations.subscribe();
        let outcome = self
            .until_cancelled(
                &mut cancel_rx,
                self.dispatcher.run(continuing, &self.prompts),
            )
            .await
            .map_err(FlowError::Cancelled)?;

        match outcome {
            Ok(report) => {
                if report.blocked {
                    let failed = report.failed.join(", ");
                    warn!(%failed, "collector actions failed, step is blocked");
                    self.record_error(format!("collector actions failed: {failed}"));
                }
                Ok(report)
            }
            Err(FlowError::Cancelled(reason)) => {
                self.terminate(&reason, flow_id);
                Err(FlowError::Cancelled(reason))
            }
            Err(err) => Err(err),
        }
    }

    /// Continues the flow after an external redirect.
    ///
    /// # Errors
    /// `Transport` (including `Unsupported`) if the transport cannot resume,
    /// `InvalidState` if another request is in flight.
    #[instrument(skip(self))]
    pub async fn resume(&self, resume_url: &Url) -> Result<Node> {
        let Some(_guard) = self.begin() else {
            return Err(FlowError::invalid_state(
                "cannot resume while another request is in flight",
            ));
        };
        self.prompts.reopen();

        let mut cancel_rx = self.cancellations.subscribe();
        let response = self
            .until_cancelled(&mut cancel_rx, self.transport.resume(resume_url))
            .await
            .map_err(FlowError::Cancelled)?;

        let node = match response {
            Ok(node) => node,
            Err(err) => return Err(self.transport_failed(err)),
        };

        let committed = self.commit(&cancel_rx, |s| {
            let previous = s.current.take().filter(|n| !n.is_terminal());
            s.previous = Some(previous.unwrap_or_else(|| node.clone()));
            s.current = Some(node.clone());
            s.flow_id.get_or_insert_with(Uuid::new_v4);
            s.last_error = None;
        });
        if !committed {
            return Err(FlowError::Cancelled("flow cancelled during resume".to_string()));
        }

        log_node(&node);
        Ok(node)
    }

    /// Starts the last journey again with the same options, carrying values
    /// over from the last continuing node when the first step matches it.
    ///
    /// # Errors
    /// `InvalidState` if no journey was ever started, otherwise as `start`.
    pub async fn restart(&self) -> Result<Node> {
        let (journey, options) = self
            .last_start()
            .clone()
            .ok_or_else(|| FlowError::invalid_state("restart called before start"))?;

        let last = {
            let session = self.session.borrow();
            session
                .current
                .as_ref()
                .and_then(Node::as_continuing)
                .or_else(|| session.previous.as_ref().and_then(Node::as_continuing))
                .cloned()
        };

        let cancel_rx = self.cancellations.subscribe();
        let node = self.start(&journey, options).await?;
        if !self.config.carry_values_on_restart {
            return Ok(node);
        }

        let (Node::Continuing(mut fresh), Some(last)) = (node.clone(), last) else {
            return Ok(node);
        };
        if fresh.name != last.name || fresh.stage() != last.stage() {
            return Ok(node);
        }
        if !fresh.carry_values_from(&last) {
            return Ok(node);
        }

        debug!(node = %fresh.name, "carried values into restarted flow");
        let carried = Node::Continuing(fresh);
        let committed = self.commit(&cancel_rx, |s| {
            s.previous = Some(carried.clone());
            s.current = Some(carried.clone());
        });
        if !committed {
            return Err(FlowError::Cancelled("flow cancelled during restart".to_string()));
        }
        Ok(carried)
    }

    /// Cancels the flow: outstanding prompts resolve with `Cancelled`, an
    /// in-flight request is abandoned and a live flow ends with a cancelled
    /// `Error` node.
    #[instrument(skip(self))]
    pub fn cancel(&self, reason: &str) {
        info!("cancelling flow");
        self.prompts.close(reason);
        self.cancellations.send_replace(Some(reason.to_string()));
        self.terminate(reason, None);
    }

    fn transport_failed(&self, err: TransportError) -> FlowError {
        warn!("transport error: {err}");
        self.record_error(err.to_string());
        FlowError::Transport(err)
    }
}

fn log_node(node: &Node) {
    match node {
        Node::Continuing(step) => {
            debug!(node = %step.name, collectors = step.collectors().len(), "continuing node");
        }
        terminal => match resolver::classify(terminal) {
            Some(TerminalOutcome::Success(_)) => info!("journey succeeded"),
            Some(TerminalOutcome::Failed(cause)) => info!(kind = %cause.kind, "journey ended: {}", cause.message),
            None => {}
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journey::collector::{Collector, CollectorKind, CollectorValue};
    use crate::journey::resolver::CauseKind;
    use crate::transport::ScriptedTransport;
    use serde_json::json;
    use std::time::Duration;

    fn login() -> Node {
        Node::Continuing(
            ContinuingNode::new(
                "Login",
                vec![
                    Collector::new("0", CollectorKind::Name),
                    Collector::new("1", CollectorKind::Password),
                ],
            )
            .with_state(json!({ "stage": "UsernamePassword" })),
        )
    }

    #[tokio::test]
    async fn advance_before_start_is_invalid() {
        let engine = FlowEngine::new(ScriptedTransport::new());
        let err = engine.advance(login()).await.unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[tokio::test]
    async fn transport_error_keeps_current_node() {
        let transport = ScriptedTransport::new()
            .then(login())
            .then_fail(TransportError::Network("connection reset".into()));
        let engine = FlowEngine::new(transport.clone());

        let node = engine.start("Login", StartOptions::default()).await.unwrap();
        let err = engine.advance(node).await.unwrap_err();
        assert!(matches!(err, FlowError::Transport(_)));

        let session = engine.session();
        assert_eq!(session.current.as_ref().map(Node::label), Some("continuing"));
        assert_eq!(
            session.last_error.as_deref(),
            Some("network error: connection reset")
        );
        assert!(!session.is_loading);
    }

    #[tokio::test]
    async fn restart_carries_values_when_stage_matches() {
        let transport = ScriptedTransport::new()
            .then(login())
            .then(Node::local_error("Login failure", "Unauthorized"))
            .then(login());
        let engine = FlowEngine::new(transport.clone());

        let mut node = engine.start("Login", StartOptions::default()).await.unwrap();
        let step = node.as_continuing_mut().unwrap();
        step.collector_mut("0")
            .unwrap()
            .set_value(CollectorValue::Text("alice".into()))
            .unwrap();
        let ended = engine.advance(node).await.unwrap();
        assert!(ended.is_terminal());
        assert!(engine.session().retry_node().is_some());

        let restarted = engine.restart().await.unwrap();
        let step = restarted.as_continuing().unwrap();
        assert_eq!(step.collector("0").unwrap().value().as_text(), Some("alice"));
        assert_eq!(
            engine.session().current.unwrap().as_continuing().unwrap().collector("0").unwrap().value().as_text(),
            Some("alice")
        );
    }

    #[tokio::test]
    async fn strict_engine_rejects_invalid_nodes() {
        let transport = ScriptedTransport::new().then(Node::Continuing(ContinuingNode::new(
            "Login",
            vec![Collector::new("0", CollectorKind::Name)
                .with_prompt("User Name")
                .with_required(true)],
        )));
        let engine = FlowEngine::new(transport.clone())
            .with_config(EngineConfig::default().with_validate_before_submit(true));

        let node = engine.start("Login", StartOptions::default()).await.unwrap();
        match engine.advance(node).await {
            Err(FlowError::Validation { collector, errors }) => {
                assert_eq!(collector, "0");
                assert_eq!(errors.len(), 1);
            }
            other => panic!("expected a validation error, got {other:?}"),
        }
        assert_eq!(transport.submissions(), 0);
        assert!(!engine.session().is_loading);
    }

    #[tokio::test]
    async fn cancel_during_restart_keeps_the_flow_ended() {
        let transport = ScriptedTransport::new()
            .then(login())
            .then(Node::local_error("Login failure", "Unauthorized"))
            .then(login());
        let engine = FlowEngine::new(transport.clone());
        let node = engine.start("Login", StartOptions::default()).await.unwrap();
        engine.advance(node).await.unwrap();

        transport.close_gate();
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            engine.cancel("user closed the dialog");
            transport.open_gate();
        };
        let (restarted, ()) = tokio::join!(engine.restart(), cancel);

        assert!(restarted.unwrap_err().is_cancelled());
        let session = engine.session();
        assert!(session.is_terminal());
        assert!(!session.is_loading);
    }

    #[tokio::test]
    async fn cancel_ends_a_live_flow() {
        let engine = FlowEngine::new(ScriptedTransport::new().then(login()));
        engine.start("Login", StartOptions::default()).await.unwrap();

        engine.cancel("user closed the dialog");
        let outcome = engine.outcome().unwrap();
        assert_eq!(outcome.cause().unwrap().kind, CauseKind::Cancelled);
        assert!(engine.advance(login()).await.unwrap_err().is_invalid_state());
    }

    #[tokio::test]
    async fn resume_is_forwarded_to_the_transport() {
        let transport = ScriptedTransport::new().then(login());
        let engine = FlowEngine::new(transport.clone());
        let url = Url::parse("https://app.example.com/callback?code=abc&state=xyz").unwrap();

        let node = engine.resume(&url).await.unwrap();
        assert!(!node.is_terminal());
        assert!(engine.session().flow_id.is_some());
        assert_eq!(transport.recorded().len(), 1);
    }
}
