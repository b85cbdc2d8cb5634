//! Classification of terminal nodes.
//!
//! The resolver only reads what the node carries (status code, reason,
//! message). Anything it cannot place is reported as [`CauseKind::Unknown`]
//! with the original message untouched.

use super::node::{Node, SessionArtifact};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CauseKind {
    /// Bad credentials or a server-side policy refusal.
    ServerRejected,
    /// Malformed or unexpected node shape.
    ProtocolError,
    /// The user aborted a prompt or the flow.
    Cancelled,
    Unknown,
}

impl fmt::Display for CauseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ServerRejected => "server rejected",
            Self::ProtocolError => "protocol error",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TerminalCause {
    pub kind: CauseKind,
    pub message: String,
    pub code: Option<u16>,
}

impl fmt::Display for TerminalCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} ({code}): {}", self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

#[derive(Clone, Debug)]
pub enum TerminalOutcome {
    Success(SessionArtifact),
    Failed(TerminalCause),
}

impl TerminalOutcome {
    #[must_use]
    pub fn cause(&self) -> Option<&TerminalCause> {
        match self {
            Self::Success(_) => None,
            Self::Failed(cause) => Some(cause),
        }
    }
}

/// Classifies a terminal node; `None` for continuing nodes.
#[must_use]
pub fn classify(node: &Node) -> Option<TerminalOutcome> {
    match node {
        Node::Continuing(_) => None,
        Node::Success(artifact) => Some(TerminalOutcome::Success(artifact.clone())),
        Node::Failure(cause) => Some(TerminalOutcome::Failed(classify_cause(
            &cause.message,
            cause.code,
            cause.reason.as_deref(),
        ))),
        Node::Error { message, details } => Some(TerminalOutcome::Failed(classify_cause(
            message,
            details.code,
            details.reason.as_deref(),
        ))),
    }
}

fn reason_kind(reason: Option<&str>) -> Option<CauseKind> {
    match reason?.to_ascii_lowercase().as_str() {
        "cancelled" | "canceled" => Some(CauseKind::Cancelled),
        "protocol" | "bad request" => Some(CauseKind::ProtocolError),
        "unauthorized" | "forbidden" => Some(CauseKind::ServerRejected),
        _ => None,
    }
}

fn code_kind(code: Option<u16>) -> Option<CauseKind> {
    match code? {
        401 | 403 => Some(CauseKind::ServerRejected),
        400 | 422 => Some(CauseKind::ProtocolError),
        _ => None,
    }
}

fn classify_cause(message: &str, code: Option<u16>, reason: Option<&str>) -> TerminalCause {
    TerminalCause {
        kind: reason_kind(reason)
            .or_else(|| code_kind(code))
            .unwrap_or(CauseKind::Unknown),
        message: message.to_string(),
        code,
    }
}
