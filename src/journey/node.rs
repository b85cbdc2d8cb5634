//! Nodes: one step of a journey.

use super::collector::{Collector, CollectorKind};
use super::error::{FlowError, Result};
use super::policy::{PolicyRequirement, ValidationError};
use secrecy::SecretString;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

#[derive(Clone, Debug)]
pub enum Node {
    Continuing(ContinuingNode),
    Success(SessionArtifact),
    Failure(FailureCause),
    Error { message: String, details: ErrorDetails },
}

impl Node {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Continuing(_))
    }

    #[must_use]
    pub fn as_continuing(&self) -> Option<&ContinuingNode> {
        match self {
            Self::Continuing(node) => Some(node),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_continuing_mut(&mut self) -> Option<&mut ContinuingNode> {
        match self {
            Self::Continuing(node) => Some(node),
            _ => None,
        }
    }

    /// # Errors
    /// Returns `FlowError::InvalidState` for terminal nodes.
    pub fn into_continuing(self) -> Result<ContinuingNode> {
        match self {
            Self::Continuing(node) => Ok(node),
            other => Err(FlowError::invalid_state(format!(
                "{} node cannot be advanced",
                other.label()
            ))),
        }
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Continuing(_) => "continuing",
            Self::Success(_) => "success",
            Self::Failure(_) => "failure",
            Self::Error { .. } => "error",
        }
    }

    /// Error node produced locally (cancellation, malformed responses).
    #[must_use]
    pub fn local_error(message: impl Into<String>, reason: &str) -> Self {
        Self::Error {
            message: message.into(),
            details: ErrorDetails {
                code: None,
                reason: Some(reason.to_string()),
                raw: Value::Null,
            },
        }
    }
}

#[derive(Clone, Debug)]
pub struct ContinuingNode {
    pub name: String,
    pub description: String,
    /// Opaque transport state (for AM: the whole step payload incl. `authId`).
    pub state: Value,
    collectors: Vec<Collector>,
}

impl ContinuingNode {
    #[must_use]
    pub fn new(name: impl Into<String>, collectors: Vec<Collector>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            state: Value::Null,
            collectors,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_state(mut self, state: Value) -> Self {
        self.state = state;
        self
    }

    #[must_use]
    pub fn collectors(&self) -> &[Collector] {
        &self.collectors
    }

    /// Mutable access to a single collector. The list itself is never exposed
    /// mutably so ids and kinds stay fixed.
    #[must_use]
    pub fn collector_mut(&mut self, id: &str) -> Option<&mut Collector> {
        self.collectors.iter_mut().find(|c| c.id() == id)
    }

    #[must_use]
    pub fn collector(&self, id: &str) -> Option<&Collector> {
        self.collectors.iter().find(|c| c.id() == id)
    }

    pub(crate) fn collector_at_mut(&mut self, index: usize) -> Option<&mut Collector> {
        self.collectors.get_mut(index)
    }

    /// First collector of the given kind.
    #[must_use]
    pub fn find_kind(&self, kind: &CollectorKind) -> Option<&Collector> {
        self.collectors.iter().find(|c| c.kind() == kind)
    }

    /// Same ids and kinds, in the same order.
    #[must_use]
    pub fn same_composition(&self, other: &Self) -> bool {
        self.collectors.len() == other.collectors.len()
            && self
                .collectors
                .iter()
                .zip(&other.collectors)
                .all(|(a, b)| a.same_shape(b))
    }

    /// Server stage hint, used to match a restarted node with the previous one.
    #[must_use]
    pub fn stage(&self) -> Option<&str> {
        self.state["stage"].as_str()
    }

    /// Copies values from `previous` when both nodes have the same composition.
    /// Returns true when values were carried over.
    pub fn carry_values_from(&mut self, previous: &Self) -> bool {
        if !self.same_composition(previous) {
            return false;
        }
        for (target, source) in self.collectors.iter_mut().zip(&previous.collectors) {
            if !source.value().is_empty() {
                // Same kind on both sides, so the shape always fits.
                let _ = target.set_value(source.value().clone());
            }
        }
        true
    }

    /// Runs `validate()` on every collector and adds node-level checks
    /// (distinct security questions across `kba-create` collectors).
    #[must_use]
    pub fn validate(&self) -> BTreeMap<String, Vec<ValidationError>> {
        let mut report: BTreeMap<String, Vec<ValidationError>> = BTreeMap::new();

        for collector in &self.collectors {
            let errors = collector.validate();
            if !errors.is_empty() {
                report.insert(collector.id().to_string(), errors);
            }
        }

        let mut seen: HashMap<String, &str> = HashMap::new();
        for collector in self
            .collectors
            .iter()
            .filter(|c| *c.kind() == CollectorKind::KbaCreate)
        {
            let Some(question) = collector
                .value()
                .as_json()
                .and_then(|v| v["question"].as_str())
                .map(|q| q.trim().to_lowercase())
                .filter(|q| !q.is_empty())
            else {
                continue;
            };
            if seen.insert(question, collector.id()).is_some() {
                report
                    .entry(collector.id().to_string())
                    .or_default()
                    .push(ValidationError::new(
                        PolicyRequirement::Unique,
                        format!("{} must be unique", collector.prompt()),
                        Value::Null,
                    ));
            }
        }

        report
    }
}

/// Payload of a successful journey.
#[derive(Clone, Debug)]
pub struct SessionArtifact {
    pub token: SecretString,
    pub success_url: Option<String>,
    pub realm: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FailureCause {
    pub code: Option<u16>,
    pub reason: Option<String>,
    pub message: String,
    pub raw: Value,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ErrorDetails {
    pub code: Option<u16>,
    pub reason: Option<String>,
    pub raw: Value,
}
