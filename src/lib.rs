//! # Wayfarer (client engine for authentication journeys)
//!
//! `wayfarer` drives a server-directed authentication journey on behalf of a
//! user interface. The server models authentication as a sequence of opaque
//! nodes; each continuing node requests zero or more collectors (text, choices,
//! device actions, out-of-band secrets) that the client fills before asking the
//! server for the next node.
//!
//! ## Core
//!
//! - [`journey::FlowEngine`] owns the session (current node, previous node,
//!   loading flag), guarantees single-flight progression and is the only writer
//!   of that state. UIs observe it through a `tokio::sync::watch` receiver.
//! - [`journey::CallbackDispatcher`] maps each collector kind to a strategy:
//!   user-edited, autonomous background action, or prompt-suspended action.
//! - [`journey::PromptCoordinator`] lets an in-flight collector action hand
//!   control to the human for exactly one answer and resume afterwards.
//! - [`journey::resolver`] classifies terminal nodes into a stable taxonomy.
//!
//! ## Transport
//!
//! The engine only talks to a [`transport::Transport`]. [`transport::HttpTransport`]
//! speaks the AM `authenticate` JSON protocol; [`transport::ScriptedTransport`]
//! is an in-process bridge used by tests and embedders.
//!
//! Secrets (passwords, PINs, session tokens) are held in `secrecy::SecretString`
//! and never reach the logs.

pub mod cli;
pub mod journey;
pub mod transport;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
