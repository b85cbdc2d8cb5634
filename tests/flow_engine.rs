use anyhow::{Context, Result, bail, ensure};
use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;
use wayfarer::journey::{
    CallbackDispatcher, CauseKind, Collector, CollectorAction, CollectorKind, CollectorValue,
    ContinuingNode, DispatcherConfig, EngineConfig, ErrorDetails, FlowEngine, FlowError, Node,
    Prompt, PromptAnswer, PromptCoordinator, SessionArtifact, TerminalOutcome,
};
use wayfarer::transport::memory::Recorded;
use wayfarer::transport::{ScriptedTransport, StartOptions};

fn login() -> Node {
    Node::Continuing(ContinuingNode::new(
        "Login",
        vec![
            Collector::new("0", CollectorKind::Name).with_prompt("User Name"),
            Collector::new("1", CollectorKind::Password).with_prompt("Password"),
        ],
    ))
}

fn binding() -> Node {
    Node::Continuing(ContinuingNode::new(
        "Bind device",
        vec![Collector::new("0", CollectorKind::DeviceBinding).with_prompt("Bind this device")],
    ))
}

fn success() -> Node {
    Node::Success(SessionArtifact {
        token: "AQIC5w".to_string().into(),
        success_url: Some("/console".to_string()),
        realm: Some("/".to_string()),
    })
}

/// Signs with a PIN asked from the user.
struct PinSigner;

#[async_trait]
impl CollectorAction for PinSigner {
    async fn execute(
        &self,
        _collector: &Collector,
        prompts: &PromptCoordinator,
    ) -> wayfarer::journey::Result<CollectorValue> {
        match prompts.raise(Prompt::secret("Enter PIN"))?.await? {
            PromptAnswer::Secret(pin) => Ok(CollectorValue::Json(json!({
                "jws": format!("signed:{}", pin.expose_secret())
            }))),
            PromptAnswer::Selection(_) => Err(FlowError::Action("expected a PIN".to_string())),
        }
    }
}

fn binding_engine(transport: &ScriptedTransport, config: DispatcherConfig) -> FlowEngine {
    FlowEngine::new(transport.clone()).with_dispatcher(
        CallbackDispatcher::new(config)
            .with_prompt_suspended(CollectorKind::DeviceBinding, PinSigner),
    )
}

async fn wait_for_prompt(prompts: &PromptCoordinator) -> Result<()> {
    let mut rx = prompts.subscribe();
    rx.wait_for(Option::is_some).await?;
    Ok(())
}

#[tokio::test]
async fn login_with_name_and_password() -> Result<()> {
    let transport = ScriptedTransport::new().then(login()).then(success());
    let engine = FlowEngine::new(transport.clone());

    let mut node = engine.start("Login", StartOptions::default()).await?;
    let step = node.as_continuing_mut().context("expected a continuing node")?;
    step.collector_mut("0")
        .context("name collector")?
        .set_value(CollectorValue::Text("alice".to_string()))?;
    step.collector_mut("1")
        .context("password collector")?
        .set_value(CollectorValue::secret("secret"))?;

    let next = engine.advance(node).await?;
    ensure!(matches!(next, Node::Success(_)), "expected success");

    let session = engine.session();
    ensure!(matches!(session.current, Some(Node::Success(_))));
    ensure!(matches!(session.previous, Some(Node::Continuing(_))));
    ensure!(!session.is_loading);
    ensure!(!format!("{session:?}").contains("AQIC5w"), "token leaked");

    let Some(TerminalOutcome::Success(artifact)) = engine.outcome() else {
        bail!("expected a successful outcome");
    };
    assert_eq!(artifact.token.expose_secret(), "AQIC5w");

    let Some(Recorded::Submit { values, .. }) = transport.recorded().pop() else {
        bail!("expected a submission");
    };
    assert_eq!(values["0"], "alice");
    assert_eq!(values["1"], "secret");
    Ok(())
}

#[tokio::test]
async fn device_binding_waits_for_the_pin() -> Result<()> {
    let transport = ScriptedTransport::new().then(binding()).then(login());
    let engine = binding_engine(&transport, DispatcherConfig::default());

    let mut node = engine.start("Bind", StartOptions::default()).await?;
    ensure!(engine.plan(node.as_continuing().context("continuing")?).pending() == vec!["0"]);

    let answer = async {
        wait_for_prompt(engine.prompts()).await?;
        let active = engine.prompts().active().context("prompt is active")?;
        assert_eq!(active.prompt.title, "Enter PIN");
        Ok::<_, anyhow::Error>(engine.prompts().resolve(PromptAnswer::secret("1234"))?)
    };
    let (report, delivered) = tokio::join!(engine.collect(&mut node), answer);
    let report = report?;
    ensure!(delivered?, "answer was not delivered");

    assert_eq!(report.completed, vec!["0".to_string()]);
    assert!(report.failed.is_empty());
    assert!(report.auto_advance);
    assert!(engine.prompts().active().is_none());

    let next = engine.advance(node).await?;
    assert_eq!(next.as_continuing().map(|n| n.name.as_str()), Some("Login"));

    let Some(Recorded::Submit { values, .. }) = transport.recorded().pop() else {
        bail!("expected a submission");
    };
    assert_eq!(values["0"], json!({ "jws": "signed:1234" }));
    Ok(())
}

#[tokio::test]
async fn server_error_ends_the_flow() -> Result<()> {
    let transport = ScriptedTransport::new().then(login()).then(Node::Error {
        message: "rate limited".to_string(),
        details: ErrorDetails {
            code: Some(429),
            ..ErrorDetails::default()
        },
    });
    let engine = FlowEngine::new(transport.clone());

    let node = engine.start("Login", StartOptions::default()).await?;
    let ended = engine.advance(node.clone()).await?;
    ensure!(ended.is_terminal());

    let cause = engine
        .outcome()
        .and_then(|outcome| outcome.cause().cloned())
        .context("expected a failure cause")?;
    assert_eq!(cause.kind, CauseKind::Unknown);
    assert_eq!(cause.message, "rate limited");

    // neither the old step nor the terminal node can be submitted
    let err = engine.advance(node).await.unwrap_err();
    assert!(err.is_invalid_state(), "{err}");
    let err = engine.advance(ended).await.unwrap_err();
    assert!(err.is_invalid_state(), "{err}");

    let session = engine.session();
    ensure!(matches!(session.current, Some(Node::Error { .. })));
    assert_eq!(transport.submissions(), 1);

    // a new start is the only way on
    transport.push(Ok(login()));
    let again = engine.start("Login", StartOptions::default()).await?;
    ensure!(!again.is_terminal());
    Ok(())
}

#[tokio::test]
async fn only_one_request_is_in_flight() -> Result<()> {
    let transport = ScriptedTransport::new().then(login()).then(success());
    let engine = FlowEngine::new(transport.clone());
    let node = engine.start("Login", StartOptions::default()).await?;

    transport.close_gate();
    let release = async {
        sleep(Duration::from_millis(50)).await;
        let loading = engine.session().is_loading;
        transport.open_gate();
        loading
    };
    let (first, second, was_loading) =
        tokio::join!(engine.advance(node.clone()), engine.advance(node), release);

    ensure!(was_loading, "session should report loading while the request waits");
    let results = [first?, second?];
    assert_eq!(results.iter().filter(|n| n.is_terminal()).count(), 1);
    assert_eq!(results.iter().filter(|n| !n.is_terminal()).count(), 1);
    assert_eq!(transport.submissions(), 1);
    assert!(!engine.session().is_loading);
    Ok(())
}

#[tokio::test]
async fn second_resolve_is_a_no_op() -> Result<()> {
    let prompts = PromptCoordinator::new();
    let pending = prompts.raise(Prompt::one_of(
        "Pick a device",
        vec!["laptop".to_string(), "phone".to_string()],
    ))?;

    ensure!(prompts.resolve(PromptAnswer::Selection(1))?);
    ensure!(!prompts.resolve(PromptAnswer::Selection(0))?);

    let answer = pending.await?;
    ensure!(matches!(answer, PromptAnswer::Selection(1)));
    Ok(())
}

#[tokio::test]
async fn cancel_with_an_active_prompt() -> Result<()> {
    let transport = ScriptedTransport::new().then(binding());
    let engine = binding_engine(&transport, DispatcherConfig::default());
    let mut node = engine.start("Bind", StartOptions::default()).await?;

    let cancel = async {
        wait_for_prompt(engine.prompts()).await?;
        engine.cancel("user closed the dialog");
        Ok::<_, anyhow::Error>(())
    };
    let (collected, cancelled) = tokio::join!(engine.collect(&mut node), cancel);
    cancelled?;

    let err = collected.unwrap_err();
    assert!(err.is_cancelled(), "{err}");
    assert!(engine.prompts().active().is_none());

    let cause = engine
        .outcome()
        .and_then(|outcome| outcome.cause().cloned())
        .context("expected a cancelled outcome")?;
    assert_eq!(cause.kind, CauseKind::Cancelled);

    let late = engine.prompts().raise(Prompt::secret("Enter PIN"));
    assert!(late.is_err_and(|err| err.is_cancelled()));
    assert_eq!(transport.submissions(), 0);
    Ok(())
}

#[tokio::test]
async fn unanswered_prompt_times_out() -> Result<()> {
    let transport = ScriptedTransport::new().then(binding());
    let engine = binding_engine(
        &transport,
        DispatcherConfig::default().with_prompt_timeout(Some(Duration::from_millis(50))),
    );
    let mut node = engine.start("Bind", StartOptions::default()).await?;

    let err = engine.collect(&mut node).await.unwrap_err();
    assert!(err.is_cancelled(), "{err}");
    assert!(err.to_string().ends_with("within 50ms"), "{err}");
    ensure!(engine.session().is_terminal());
    Ok(())
}

#[tokio::test]
async fn new_flow_survives_the_previous_flows_prompt() -> Result<()> {
    let transport = ScriptedTransport::new().then(binding()).then(login());
    let engine = binding_engine(&transport, DispatcherConfig::default());
    let mut node = engine.start("Bind", StartOptions::default()).await?;

    let start_over = async {
        wait_for_prompt(engine.prompts()).await?;
        Ok::<_, anyhow::Error>(engine.start("Login", StartOptions::default()).await?)
    };
    let (collected, started) = tokio::join!(engine.collect(&mut node), start_over);

    let err = collected.unwrap_err();
    assert!(err.is_cancelled(), "{err}");
    ensure!(!started?.is_terminal());

    let session = engine.session();
    ensure!(!session.is_terminal(), "new flow was ended: {:?}", session.current);
    assert_eq!(session.journey.as_deref(), Some("Login"));
    assert_eq!(
        session.current.as_ref().and_then(Node::as_continuing).map(|n| n.name.as_str()),
        Some("Login")
    );
    Ok(())
}

fn with_unknown_callback() -> Node {
    Node::Continuing(ContinuingNode::new(
        "Login",
        vec![
            Collector::new("0", CollectorKind::Name)
                .with_prompt("User Name")
                .with_value(CollectorValue::Text("alice".to_string())),
            Collector::new("1", CollectorKind::Unsupported("FooCallback".to_string()))
                .with_prompt("Foo")
                .with_required(true),
        ],
    ))
}

#[tokio::test]
async fn unknown_collectors_do_not_block_submission() -> Result<()> {
    let transport = ScriptedTransport::new()
        .then(with_unknown_callback())
        .then(success());
    let engine = FlowEngine::new(transport.clone());

    let node = engine.start("Login", StartOptions::default()).await?;
    let step = node.as_continuing().context("expected a step")?;
    assert_eq!(engine.plan(step).unsupported().len(), 1);

    let next = engine.advance(node).await?;
    ensure!(matches!(next, Node::Success(_)));
    assert_eq!(transport.submissions(), 1);
    Ok(())
}

#[tokio::test]
async fn unknown_collectors_pass_strict_validation() -> Result<()> {
    let transport = ScriptedTransport::new()
        .then(with_unknown_callback())
        .then(success());
    let engine = FlowEngine::new(transport.clone())
        .with_config(EngineConfig::default().with_validate_before_submit(true));

    let node = engine.start("Login", StartOptions::default()).await?;
    let next = engine.advance(node).await?;
    ensure!(matches!(next, Node::Success(_)));
    assert_eq!(transport.submissions(), 1);
    Ok(())
}
