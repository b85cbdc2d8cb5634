//! Terminal front-end: drives one journey over stdin/stdout.

use crate::cli::actions::profile::DeviceProfile;
use crate::cli::commands::journey::Options;
use crate::journey::{
    ActivePrompt, AnswerShape, CallbackDispatcher, CauseKind, Collector, CollectorKind, CollectorValue,
    ContinuingNode, DispatchReport, DispatcherConfig, FailurePolicy, FlowEngine, FlowError, Node,
    PromptAnswer, PromptCoordinator, Strategy, TerminalOutcome, ValueShape,
};
use crate::transport::{HttpTransport, HttpTransportConfig, StartOptions};
use anyhow::{anyhow, Result};
use serde_json::json;
use std::time::Duration;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::watch;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Clone)]
pub struct Args {
    pub url: Url,
    pub realm: String,
    pub journey: String,
    pub prompt_timeout: Option<Duration>,
    pub failure_policy: FailurePolicy,
    pub start: StartOptions,
}

impl From<Options> for Args {
    fn from(options: Options) -> Self {
        Self {
            url: options.url,
            realm: options.realm,
            journey: options.journey,
            prompt_timeout: options.prompt_timeout,
            failure_policy: if options.fail_closed {
                FailurePolicy::Halt
            } else {
                FailurePolicy::Proceed
            },
            start: StartOptions::default()
                .with_force_auth(options.force_auth)
                .with_no_session(options.no_session),
        }
    }
}

/// Dispatcher with the collector actions a terminal can provide.
#[must_use]
pub fn dispatcher(args: &Args) -> CallbackDispatcher {
    CallbackDispatcher::new(
        DispatcherConfig::default()
            .with_failure_policy(args.failure_policy)
            .with_prompt_timeout(args.prompt_timeout),
    )
    .with_autonomous(CollectorKind::DeviceProfile, DeviceProfile::default())
}

/// Execute the run action.
///
/// # Errors
/// Returns an error if the server cannot be reached or the journey does not
/// end in success.
pub async fn execute(args: Args) -> Result<()> {
    let transport =
        HttpTransport::new(HttpTransportConfig::new(args.url.clone()).with_realm(&args.realm))?;
    let engine = FlowEngine::new(transport).with_dispatcher(dispatcher(&args));

    info!(url = %args.url, realm = %args.realm, journey = %args.journey, "running journey");

    let mut input = BufReader::new(io::stdin()).lines();
    let mut out = io::stdout();

    tokio::select! {
        result = drive(&engine, &args.journey, args.start.clone(), &mut input, &mut out) => result,
        _ = tokio::signal::ctrl_c() => {
            engine.cancel("interrupted");
            Err(anyhow!("journey interrupted"))
        }
    }
}

/// Runs `journey` to a terminal node, reading answers from `input`.
///
/// # Errors
/// Returns an error if the journey fails, input ends early or a request
/// cannot be made.
pub async fn drive<R, W>(
    engine: &FlowEngine,
    journey: &str,
    options: StartOptions,
    input: &mut Lines<R>,
    out: &mut W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut node = engine.start(journey, options).await?;

    loop {
        if node.is_terminal() {
            match finish(engine, input, out).await? {
                Some(restarted) => {
                    node = restarted;
                    continue;
                }
                None => return Ok(()),
            }
        }

        if let Some(step) = node.as_continuing() {
            say(out, format!("== {} ==", step.name)).await?;
            if !step.description.is_empty() {
                say(out, &step.description).await?;
            }
        }

        let Some(report) = run_actions(engine, &mut node, input, out).await? else {
            // a declined prompt ends the flow
            node = engine.session().current.unwrap_or(node);
            continue;
        };
        if report.blocked {
            say(out, "A device check failed and this step cannot continue.").await?;
            return Err(anyhow!(
                "collector actions failed: {}",
                report.failed.join(", ")
            ));
        }

        if let Some(step) = node.as_continuing_mut() {
            fill_step(engine, step, input, out).await?;
        }

        node = submit(engine, node, input, out).await?;
    }
}

/// Reports the terminal node; offers a restart after a rejected login.
async fn finish<R, W>(
    engine: &FlowEngine,
    input: &mut Lines<R>,
    out: &mut W,
) -> Result<Option<Node>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match engine.outcome() {
        Some(TerminalOutcome::Success(artifact)) => {
            say(out, "Authenticated.").await?;
            if let Some(url) = artifact.success_url {
                say(out, format!("Continue at {url}")).await?;
            }
            Ok(None)
        }
        Some(TerminalOutcome::Failed(cause)) => {
            say(out, format!("Journey ended: {cause}")).await?;
            if cause.kind == CauseKind::ServerRejected && confirm(input, out, "Try again?").await? {
                return Ok(Some(engine.restart().await?));
            }
            Err(anyhow!("journey ended: {cause}"))
        }
        None => Err(anyhow!("journey ended without an outcome")),
    }
}

async fn submit<R, W>(
    engine: &FlowEngine,
    node: Node,
    input: &mut Lines<R>,
    out: &mut W,
) -> Result<Node>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        match engine.advance(node.clone()).await {
            Ok(next) => return Ok(next),
            Err(FlowError::Transport(err)) => {
                say(out, format!("Request failed: {err}")).await?;
                if !confirm(input, out, "Retry?").await? {
                    return Err(err.into());
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Runs the node's automatic collectors while answering their prompts.
/// `None` when a prompt was declined.
async fn run_actions<R, W>(
    engine: &FlowEngine,
    node: &mut Node,
    input: &mut Lines<R>,
    out: &mut W,
) -> Result<Option<DispatchReport>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut prompt_rx = engine.prompts().subscribe();
    let answering = answer_prompts(engine.prompts(), &mut prompt_rx, input, out);

    tokio::select! {
        report = engine.collect(node) => match report {
            Ok(report) => Ok(Some(report)),
            Err(FlowError::Cancelled(_)) => Ok(None),
            Err(err) => Err(err.into()),
        },
        result = answering => {
            engine.cancel("input closed");
            result?;
            Err(anyhow!("input closed while a prompt was waiting"))
        }
    }
}

/// Answers prompts until input ends. An empty line declines the prompt.
async fn answer_prompts<R, W>(
    prompts: &PromptCoordinator,
    prompt_rx: &mut watch::Receiver<Option<ActivePrompt>>,
    input: &mut Lines<R>,
    out: &mut W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let active = prompt_rx.borrow_and_update().clone();

        if let Some(active) = active {
            let prompt = &active.prompt;
            say(out, format!("-- {} --", prompt.title)).await?;
            for line in [&prompt.subtitle, &prompt.description] {
                if !line.is_empty() {
                    say(out, line).await?;
                }
            }
            if let AnswerShape::OneOf(candidates) = &prompt.expected {
                for (index, candidate) in candidates.iter().enumerate() {
                    say(out, format!("  {}) {candidate}", index + 1)).await?;
                }
            }
            ask(out, "> ").await?;

            let Some(line) = input.next_line().await? else {
                return Ok(());
            };

            if line.trim().is_empty() {
                prompts.cancel("declined by user");
                continue;
            }

            let answer = match &prompt.expected {
                AnswerShape::Secret => PromptAnswer::secret(line),
                AnswerShape::OneOf(candidates) => match pick(&line, candidates.len()) {
                    Some(index) => PromptAnswer::Selection(index),
                    None => {
                        say(out, format!("Pick a number from 1 to {}", candidates.len())).await?;
                        continue;
                    }
                },
            };

            match prompts.resolve(answer) {
                Ok(delivered) => debug!(prompt_id = active.id, delivered, "prompt answered"),
                Err(err) => say(out, err.to_string()).await?,
            }
            continue;
        }

        if prompt_rx.changed().await.is_err() {
            return Ok(());
        }
    }
}

/// Asks for every user-edited collector of `step`.
async fn fill_step<R, W>(
    engine: &FlowEngine,
    step: &mut ContinuingNode,
    input: &mut Lines<R>,
    out: &mut W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let plan = engine.plan(step);

    for entry in &plan.entries {
        match entry.strategy {
            Strategy::DisplayOnly => {
                if let Some(collector) = step.collector(&entry.id) {
                    say(out, collector.prompt()).await?;
                }
            }
            Strategy::Unsupported => {
                say(out, format!("(skipping unsupported step: {})", entry.kind)).await?;
            }
            Strategy::UserEdited if entry.kind != CollectorKind::HiddenValue => {
                if let Some(collector) = step.collector_mut(&entry.id) {
                    ask_collector(collector, input, out).await?;
                }
            }
            _ => {}
        }
    }

    Ok(())
}

async fn ask_collector<R, W>(
    collector: &mut Collector,
    input: &mut Lines<R>,
    out: &mut W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    for failed in collector.validation_state() {
        say(out, format!("  ! {}", failed.message)).await?;
    }

    let choices = collector.choices();
    for (index, choice) in choices.iter().enumerate() {
        say(out, format!("  {}) {choice}", index + 1)).await?;
    }

    loop {
        let keep = if collector.value().is_empty() {
            ""
        } else {
            " [enter keeps the current value]"
        };
        ask(out, format!("{}{keep}: ", collector.prompt())).await?;

        let line = next_line(input).await?;

        let value = if line.is_empty() && !collector.value().is_empty() {
            collector.value().clone()
        } else if *collector.kind() == CollectorKind::KbaCreate {
            ask(out, "Answer: ").await?;
            let answer = next_line(input).await?;
            CollectorValue::Json(json!({ "question": line, "answer": answer }))
        } else {
            match parse_value(collector, &choices, line) {
                Ok(value) => value,
                Err(hint) => {
                    say(out, hint).await?;
                    continue;
                }
            }
        };

        collector.set_value(value)?;

        let errors = collector.validate();
        if errors.is_empty() {
            return Ok(());
        }
        for error in errors {
            say(out, format!("  ! {}", error.message)).await?;
        }
    }
}

fn parse_value(
    collector: &Collector,
    choices: &[String],
    line: String,
) -> std::result::Result<CollectorValue, String> {
    if *collector.kind() == CollectorKind::SelectIdp {
        return pick(&line, choices.len())
            .map(|index| CollectorValue::Text(choices[index].clone()))
            .ok_or_else(|| format!("Pick a number from 1 to {}", choices.len()));
    }

    match collector.kind().value_shape() {
        ValueShape::Secret => Ok(CollectorValue::secret(line)),
        ValueShape::Index => pick(&line, choices.len())
            .map(CollectorValue::Index)
            .ok_or_else(|| format!("Pick a number from 1 to {}", choices.len())),
        ValueShape::Bool => match line.trim().to_lowercase().as_str() {
            "y" | "yes" | "true" => Ok(CollectorValue::Bool(true)),
            "n" | "no" | "false" => Ok(CollectorValue::Bool(false)),
            _ => Err("Answer y or n".to_string()),
        },
        ValueShape::Number => line
            .trim()
            .parse::<f64>()
            .map(CollectorValue::Number)
            .map_err(|_| "Enter a number".to_string()),
        ValueShape::Text | ValueShape::Any | ValueShape::None => Ok(CollectorValue::Text(line)),
    }
}

/// 1-based menu pick to a 0-based index.
fn pick(line: &str, len: usize) -> Option<usize> {
    line.trim()
        .parse::<usize>()
        .ok()
        .filter(|n| (1..=len).contains(n))
        .map(|n| n - 1)
}

async fn confirm<R, W>(input: &mut Lines<R>, out: &mut W, question: &str) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    ask(out, format!("{question} [y/N] ")).await?;
    let Some(line) = input.next_line().await? else {
        return Ok(false);
    };
    Ok(matches!(line.trim().to_lowercase().as_str(), "y" | "yes"))
}

async fn next_line<R>(input: &mut Lines<R>) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    input
        .next_line()
        .await?
        .ok_or_else(|| anyhow!("input closed"))
}

async fn ask<W: AsyncWrite + Unpin>(out: &mut W, text: impl AsRef<str>) -> Result<()> {
    out.write_all(text.as_ref().as_bytes()).await?;
    out.flush().await?;
    Ok(())
}

async fn say<W: AsyncWrite + Unpin>(out: &mut W, line: impl AsRef<str>) -> Result<()> {
    out.write_all(line.as_ref().as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await?;
    Ok(())
}
