//! Kind to strategy registry, and the runner that satisfies a node's
//! autonomous and prompt-suspended collectors.
//!
//! Front-ends never switch on collector kinds themselves: they ask the
//! dispatcher for a [`DispatchPlan`] (what to render, what runs on its own)
//! and call [`CallbackDispatcher::run`] once per node arrival.

use super::collector::{Collector, CollectorKind, CollectorValue};
use super::error::{FlowError, Result};
use super::node::ContinuingNode;
use super::prompt::PromptCoordinator;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

const DEFAULT_POLLING_WAIT_MS: u64 = 8_000;

/// Platform-supplied behaviour for one collector kind.
///
/// Implementations may call [`PromptCoordinator::raise`] to ask the user for a
/// secret or a selection; a `Cancelled` error from the prompt must be
/// returned as-is.
#[async_trait]
pub trait CollectorAction: Send + Sync {
    async fn execute(
        &self,
        collector: &Collector,
        prompts: &PromptCoordinator,
    ) -> Result<CollectorValue>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// The UI sets the value directly.
    UserEdited,
    /// Text shown to the user; never blocks.
    DisplayOnly,
    /// Runs in the background once per node arrival.
    Autonomous,
    /// Runs in the background and may suspend on a prompt.
    PromptSuspended,
    /// No handler; rendered as unsupported and never blocks submission.
    Unsupported,
}

/// What to do when an autonomous or prompt-suspended action fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Record the failure on the collector and let the flow advance.
    #[default]
    Proceed,
    /// Record the failure and mark the node as blocked.
    Halt,
}

#[derive(Clone, Debug, Default)]
pub struct DispatcherConfig {
    pub failure_policy: FailurePolicy,
    /// Upper bound for each prompt-suspended action, prompts included.
    pub prompt_timeout: Option<Duration>,
}

impl DispatcherConfig {
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    #[must_use]
    pub fn with_prompt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.prompt_timeout = timeout;
        self
    }
}

#[derive(Clone)]
struct Registration {
    strategy: Strategy,
    action: Option<Arc<dyn CollectorAction>>,
    failure_policy: Option<FailurePolicy>,
}

#[derive(Clone)]
pub struct CallbackDispatcher {
    config: DispatcherConfig,
    registry: HashMap<CollectorKind, Registration>,
}

impl fmt::Debug for CallbackDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<String> = self
            .registry
            .iter()
            .filter(|(_, registration)| registration.action.is_some())
            .map(|(kind, _)| kind.to_string())
            .collect();
        kinds.sort();
        f.debug_struct("CallbackDispatcher")
            .field("config", &self.config)
            .field("actions", &kinds)
            .finish()
    }
}

impl Default for CallbackDispatcher {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

impl CallbackDispatcher {
    /// Dispatcher with the built-in handlers: user-edited inputs, display-only
    /// text and the polling wait.
    #[must_use]
    pub fn new(config: DispatcherConfig) -> Self {
        let mut registry = HashMap::new();

        for kind in CollectorKind::known() {
            let strategy = if kind.is_display_only() {
                Strategy::DisplayOnly
            } else if is_user_edited(&kind) {
                Strategy::UserEdited
            } else {
                continue;
            };
            registry.insert(
                kind,
                Registration {
                    strategy,
                    action: None,
                    failure_policy: None,
                },
            );
        }

        let dispatcher = Self { config, registry };
        dispatcher.with_autonomous(CollectorKind::PollingWait, PollingWait)
    }

    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Registers an action that runs without user involvement.
    #[must_use]
    pub fn with_autonomous(mut self, kind: CollectorKind, action: impl CollectorAction + 'static) -> Self {
        self.register(kind, Strategy::Autonomous, Arc::new(action));
        self
    }

    /// Registers an action that may suspend on a prompt.
    #[must_use]
    pub fn with_prompt_suspended(
        mut self,
        kind: CollectorKind,
        action: impl CollectorAction + 'static,
    ) -> Self {
        self.register(kind, Strategy::PromptSuspended, Arc::new(action));
        self
    }

    /// Overrides the global failure policy for one kind.
    #[must_use]
    pub fn with_failure_policy(mut self, kind: CollectorKind, policy: FailurePolicy) -> Self {
        if let Some(registration) = self.registry.get_mut(&kind) {
            registration.failure_policy = Some(policy);
        }
        self
    }

    pub fn register(
        &mut self,
        kind: CollectorKind,
        strategy: Strategy,
        action: Arc<dyn CollectorAction>,
    ) {
        debug!(%kind, ?strategy, "registering collector action");
        let failure_policy = self.registry.get(&kind).and_then(|r| r.failure_policy);
        self.registry.insert(
            kind,
            Registration {
                strategy,
                action: Some(action),
                failure_policy,
            },
        );
    }

    #[must_use]
    pub fn strategy(&self, kind: &CollectorKind) -> Strategy {
        self.registry
            .get(kind)
            .map_or(Strategy::Unsupported, |registration| registration.strategy)
    }

    fn failure_policy(&self, kind: &CollectorKind) -> FailurePolicy {
        self.registry
            .get(kind)
            .and_then(|registration| registration.failure_policy)
            .unwrap_or(self.config.failure_policy)
    }

    /// Per-collector strategy for `node`, without running anything.
    #[must_use]
    pub fn plan(&self, node: &ContinuingNode) -> DispatchPlan {
        let entries: Vec<PlanEntry> = node
            .collectors()
            .iter()
            .map(|collector| PlanEntry {
                id: collector.id().to_string(),
                kind: collector.kind().clone(),
                strategy: self.strategy(collector.kind()),
                settled: collector.is_settled(),
            })
            .collect();

        let auto_advance = entries.iter().any(|entry| {
            matches!(
                entry.strategy,
                Strategy::Autonomous | Strategy::PromptSuspended
            ) || matches!(entry.kind, CollectorKind::Confirmation | CollectorKind::PollingWait)
        });

        DispatchPlan {
            entries,
            auto_advance,
        }
    }

    /// Runs every unsettled autonomous and prompt-suspended collector of
    /// `node` and stores the results on it.
    ///
    /// Autonomous actions run concurrently. Prompt-suspended actions run one
    /// after another in a single task so they never compete for the prompt
    /// slot.
    ///
    /// # Errors
    /// `Cancelled` when a prompt or action was cancelled; remaining actions
    /// are aborted. Action failures are not errors: they are recorded on the
    /// collector according to the failure policy.
    #[instrument(skip_all, fields(node = %node.name))]
    pub async fn run(
        &self,
        node: &mut ContinuingNode,
        prompts: &PromptCoordinator,
    ) -> Result<DispatchReport> {
        let mut autonomous = Vec::new();
        let mut suspended = Vec::new();

        for (index, collector) in node.collectors().iter().enumerate() {
            if collector.is_settled() {
                continue;
            }
            let Some(registration) = self.registry.get(collector.kind()) else {
                continue;
            };
            let Some(action) = registration.action.clone() else {
                continue;
            };
            let job = Job {
                index,
                collector: collector.clone(),
                action,
            };
            match registration.strategy {
                Strategy::Autonomous => autonomous.push(job),
                Strategy::PromptSuspended => suspended.push(job),
                _ => {}
            }
        }

        let mut report = DispatchReport {
            auto_advance: self.plan(node).auto_advance,
            ..DispatchReport::default()
        };

        if autonomous.is_empty() && suspended.is_empty() {
            return Ok(report);
        }

        info!(
            autonomous = autonomous.len(),
            suspended = suspended.len(),
            "running collector actions"
        );

        let mut tasks: JoinSet<Vec<Outcome>> = JoinSet::new();

        for job in autonomous {
            let prompts = prompts.clone();
            tasks.spawn(async move { vec![job.execute(&prompts, None).await] });
        }

        if !suspended.is_empty() {
            let prompts = prompts.clone();
            let timeout = self.config.prompt_timeout;
            tasks.spawn(async move {
                let mut outcomes = Vec::with_capacity(suspended.len());
                for job in suspended {
                    let outcome = job.execute(&prompts, timeout).await;
                    let stop = matches!(outcome.result, Err(FlowError::Cancelled(_)));
                    outcomes.push(outcome);
                    if stop {
                        break;
                    }
                }
                outcomes
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let outcomes =
                joined.map_err(|err| FlowError::Action(format!("collector task failed: {err}")))?;

            for outcome in outcomes {
                let Some(collector) = node.collector_at_mut(outcome.index) else {
                    continue;
                };
                let id = collector.id().to_string();
                let kind = collector.kind().clone();

                let failure = match outcome.result {
                    Ok(value) => match collector.set_value(value) {
                        Ok(()) => {
                            debug!(collector = %id, %kind, "collector action completed");
                            report.completed.push(id);
                            continue;
                        }
                        Err(err) => err,
                    },
                    Err(FlowError::Cancelled(reason)) => {
                        tasks.abort_all();
                        warn!(collector = %id, %reason, "collector action cancelled");
                        return Err(FlowError::Cancelled(reason));
                    }
                    Err(err) => err,
                };

                warn!(collector = %id, %kind, "collector action failed: {failure}");
                collector.set_client_error(failure.to_string());
                if self.failure_policy(&kind) == FailurePolicy::Halt {
                    report.blocked = true;
                }
                report.failed.push(id);
            }
        }

        if report.blocked {
            report.auto_advance = false;
        }

        Ok(report)
    }
}

fn is_user_edited(kind: &CollectorKind) -> bool {
    matches!(
        kind,
        CollectorKind::Name
            | CollectorKind::Password
            | CollectorKind::TextInput
            | CollectorKind::Choice
            | CollectorKind::Confirmation
            | CollectorKind::BooleanAttribute
            | CollectorKind::NumberAttribute
            | CollectorKind::StringAttribute
            | CollectorKind::ValidatedUsername
            | CollectorKind::ValidatedPassword
            | CollectorKind::KbaCreate
            | CollectorKind::TermsAndConditions
            | CollectorKind::ConsentMapping
            | CollectorKind::HiddenValue
            | CollectorKind::SelectIdp
    )
}

struct Job {
    index: usize,
    collector: Collector,
    action: Arc<dyn CollectorAction>,
}

struct Outcome {
    index: usize,
    result: Result<CollectorValue>,
}

impl Job {
    async fn execute(self, prompts: &PromptCoordinator, timeout: Option<Duration>) -> Outcome {
        let run = self.action.execute(&self.collector, prompts);
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => Err(FlowError::Cancelled(format!(
                    "{} did not complete within {limit:?}",
                    self.collector.kind()
                ))),
            },
            None => run.await,
        };
        Outcome {
            index: self.index,
            result,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanEntry {
    pub id: String,
    pub kind: CollectorKind,
    pub strategy: Strategy,
    pub settled: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchPlan {
    pub entries: Vec<PlanEntry>,
    /// The node submits itself once its actions finish (no "Next" button).
    pub auto_advance: bool,
}

impl DispatchPlan {
    /// Ids of autonomous/prompt-suspended collectors not settled yet.
    #[must_use]
    pub fn pending(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|entry| {
                !entry.settled
                    && matches!(
                        entry.strategy,
                        Strategy::Autonomous | Strategy::PromptSuspended
                    )
            })
            .map(|entry| entry.id.as_str())
            .collect()
    }

    #[must_use]
    pub fn unsupported(&self) -> Vec<&PlanEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.strategy == Strategy::Unsupported)
            .collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// A failed action's policy is `Halt`.
    pub blocked: bool,
    pub auto_advance: bool,
}

/// Waits for the server-supplied `waitTime` (milliseconds).
#[derive(Clone, Copy, Debug, Default)]
pub struct PollingWait;

#[async_trait]
impl CollectorAction for PollingWait {
    async fn execute(
        &self,
        collector: &Collector,
        _prompts: &PromptCoordinator,
    ) -> Result<CollectorValue> {
        let attributes = collector.attributes();
        let wait = attributes["waitTime"]
            .as_u64()
            .or_else(|| attributes["waitTime"].as_str().and_then(|s| s.parse().ok()))
            .unwrap_or(DEFAULT_POLLING_WAIT_MS);
        debug!(wait_ms = wait, "polling wait");
        tokio::time::sleep(Duration::from_millis(wait)).await;
        Ok(CollectorValue::Json(json!({ "waited": wait })))
    }
}
