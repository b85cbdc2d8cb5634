pub mod collector;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod node;
pub mod policy;
pub mod prompt;
pub mod resolver;

pub use collector::{Collector, CollectorKind, CollectorValue, ValueShape};
pub use dispatcher::{
    CallbackDispatcher, CollectorAction, DispatchPlan, DispatchReport, DispatcherConfig,
    FailurePolicy, PlanEntry, PollingWait, Strategy,
};
pub use engine::{EngineConfig, FlowEngine, FlowSession};
pub use error::{FlowError, Result};
pub use node::{ContinuingNode, ErrorDetails, FailureCause, Node, SessionArtifact};
pub use policy::{Policy, PolicyRequirement, ValidationError};
pub use prompt::{ActivePrompt, AnswerShape, PendingAnswer, Prompt, PromptAnswer, PromptCoordinator};
pub use resolver::{CauseKind, TerminalCause, TerminalOutcome};
