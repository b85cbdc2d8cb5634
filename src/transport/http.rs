//! AM `authenticate` JSON protocol over reqwest.
//!
//! Each continuing step is the server's JSON body (`authId` + `callbacks`).
//! The body is kept verbatim as the node's opaque state; on submit the
//! callbacks' `input` entries are filled from the collectors and the whole
//! body is posted back.

use super::{StartOptions, Transport, TransportError};
use crate::journey::collector::{Collector, CollectorKind, CollectorValue, ValueShape};
use crate::journey::node::{ContinuingNode, ErrorDetails, FailureCause, Node, SessionArtifact};
use crate::journey::policy::{parse_policies, ValidationError};
use crate::APP_USER_AGENT;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::SecretString;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info_span, instrument, warn, Instrument};
use url::Url;

const ACCEPT_API_VERSION: &str = "Accept-API-Version";
const DEFAULT_API_VERSION: &str = "protocol=1.0,resource=2.1";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Debug)]
pub struct HttpTransportConfig {
    pub base_url: Url,
    pub realm: String,
    pub api_version: String,
    pub timeout: Duration,
}

impl HttpTransportConfig {
    #[must_use]
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            realm: "root".to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    #[must_use]
    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    #[must_use]
    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `{base}/json/realms/root[/realms/<sub>...]/authenticate`
    ///
    /// # Errors
    /// Returns `TransportError::Unsupported` if the base URL cannot carry a path.
    pub fn authenticate_url(&self) -> Result<Url, TransportError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|()| {
                TransportError::Unsupported(format!("base URL {} cannot be a base", self.base_url))
            })?;
            segments.pop_if_empty().extend(["json", "realms", "root"]);
            for realm in self
                .realm
                .split('/')
                .filter(|part| !part.is_empty() && *part != "root")
            {
                segments.extend(["realms", realm]);
            }
            segments.push("authenticate");
        }
        Ok(url)
    }
}

#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
    config: HttpTransportConfig,
}

impl HttpTransport {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    #[must_use]
    pub fn config(&self) -> &HttpTransportConfig {
        &self.config
    }

    async fn post(&self, url: Url, body: &Value) -> Result<Node, TransportError> {
        let span = info_span!("journey.authenticate", http.method = "POST", url = %url);

        let response = self
            .client
            .post(url)
            .header(ACCEPT_API_VERSION, &self.config.api_version)
            .json(body)
            .send()
            .instrument(span)
            .await?;

        let status = response.status();
        let text = response.text().await?;

        debug!(status = status.as_u16(), "authenticate response");

        parse_response(status, &text)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, options))]
    async fn start_flow(&self, journey: &str, options: &StartOptions) -> Result<Node, TransportError> {
        let mut url = self.config.authenticate_url()?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("authIndexType", "service")
                .append_pair("authIndexValue", journey);
            if options.force_auth {
                query.append_pair("ForceAuth", "true");
            }
            if options.no_session {
                query.append_pair("noSession", "true");
            }
            for (key, value) in &options.query {
                query.append_pair(key, value);
            }
        }
        self.post(url, &json!({})).await
    }

    #[instrument(skip(self, node), fields(node = %node.name))]
    async fn submit_node(&self, node: &ContinuingNode) -> Result<Node, TransportError> {
        let body = encode_submission(node)?;
        self.post(self.config.authenticate_url()?, &body).await
    }

    #[instrument(skip(self))]
    async fn resume(&self, resume_url: &Url) -> Result<Node, TransportError> {
        let mut url = self.config.authenticate_url()?;
        url.query_pairs_mut()
            .extend_pairs(resume_url.query_pairs());
        self.post(url, &json!({})).await
    }
}

/// Maps a status code and body to a node.
///
/// # Errors
/// `TransportError::Http` for 5xx responses; the current node stays valid.
pub fn parse_response(status: StatusCode, text: &str) -> Result<Node, TransportError> {
    let body: Option<Value> = serde_json::from_str(text).ok();

    if status.is_server_error() {
        let message = body
            .as_ref()
            .and_then(|b| b["message"].as_str())
            .map_or_else(|| status_text(status), ToString::to_string);
        return Err(TransportError::Http {
            status: status.as_u16(),
            message,
        });
    }

    let Some(body) = body else {
        warn!(status = status.as_u16(), "response body is not JSON");
        return Ok(protocol_error(
            format!("unexpected response body ({status})"),
            Some(status.as_u16()),
            Value::String(text.to_string()),
        ));
    };

    if status == StatusCode::UNAUTHORIZED {
        return Ok(Node::Failure(FailureCause {
            code: Some(status.as_u16()),
            reason: body["reason"].as_str().map(ToString::to_string),
            message: body["message"]
                .as_str()
                .map_or_else(|| status_text(status), ToString::to_string),
            raw: body,
        }));
    }

    if status.is_client_error() {
        return Ok(Node::Error {
            message: body["message"]
                .as_str()
                .map_or_else(|| status_text(status), ToString::to_string),
            details: ErrorDetails {
                code: Some(status.as_u16()),
                reason: body["reason"].as_str().map(ToString::to_string),
                raw: body,
            },
        });
    }

    if let Some(token) = body["tokenId"].as_str() {
        return Ok(Node::Success(SessionArtifact {
            token: SecretString::from(token.to_string()),
            success_url: body["successUrl"].as_str().map(ToString::to_string),
            realm: body["realm"].as_str().map(ToString::to_string),
        }));
    }

    let collectors: Option<Vec<Collector>> = body["callbacks"]
        .as_array()
        .filter(|_| body["authId"].is_string())
        .map(|callbacks| {
            callbacks
                .iter()
                .enumerate()
                .map(|(index, callback)| decode_callback(index, callback))
                .collect()
        });

    if let Some(collectors) = collectors {
        let name = body["stage"]
            .as_str()
            .or_else(|| body["header"].as_str())
            .filter(|name| !name.is_empty())
            .unwrap_or("step")
            .to_string();
        let description = body["description"].as_str().unwrap_or_default().to_string();
        return Ok(Node::Continuing(
            ContinuingNode::new(name, collectors)
                .with_description(description)
                .with_state(body),
        ));
    }

    Ok(protocol_error(
        "response is neither a step, a session nor an error".to_string(),
        Some(status.as_u16()),
        body,
    ))
}

fn status_text(status: StatusCode) -> String {
    status
        .canonical_reason()
        .unwrap_or("unexpected status")
        .to_string()
}

fn protocol_error(message: String, code: Option<u16>, raw: Value) -> Node {
    Node::Error {
        message,
        details: ErrorDetails {
            code,
            reason: Some("protocol".to_string()),
            raw,
        },
    }
}

fn collector_id(index: usize, callback: &Value) -> String {
    callback["_id"]
        .as_u64()
        .map_or_else(|| index.to_string(), |id| id.to_string())
}

/// Turns one AM callback into a collector. Outputs become attributes.
fn decode_callback(index: usize, callback: &Value) -> Collector {
    let kind = CollectorKind::from_callback_type(callback["type"].as_str().unwrap_or_default());

    let attributes: Map<String, Value> = callback["output"]
        .as_array()
        .map(|outputs| {
            outputs
                .iter()
                .filter_map(|o| Some((o["name"].as_str()?.to_string(), o["value"].clone())))
                .collect()
        })
        .unwrap_or_default();

    let prompt = ["prompt", "message", "id"]
        .iter()
        .find_map(|key| attributes.get(*key).and_then(Value::as_str))
        .filter(|prompt| !prompt.is_empty())
        .map_or_else(|| kind.tag().to_string(), ToString::to_string);

    let policies = attributes
        .get("policies")
        .map(parse_policies)
        .unwrap_or_default();

    let failed: Vec<ValidationError> = attributes
        .get("failedPolicies")
        .and_then(Value::as_array)
        .map(|failed| {
            failed
                .iter()
                .filter_map(|raw| ValidationError::from_failed_policy(raw, &prompt))
                .collect()
        })
        .unwrap_or_default();

    let required = attributes.get("required").and_then(Value::as_bool);
    let initial = initial_value(&kind, callback, &attributes);

    let mut collector = Collector::new(collector_id(index, callback), kind)
        .with_prompt(prompt)
        .with_policies(policies)
        .with_failed_policies(failed)
        .with_attributes(Value::Object(attributes));
    if let Some(required) = required {
        collector = collector.with_required(required);
    }
    if let Some(initial) = initial {
        collector = collector.with_value(initial);
    }
    collector
}

/// Server-side defaults (pre-filled text, default choice). Secrets are never
/// pre-filled.
fn initial_value(
    kind: &CollectorKind,
    callback: &Value,
    attributes: &Map<String, Value>,
) -> Option<CollectorValue> {
    let input = &callback["input"][0]["value"];
    match kind.value_shape() {
        ValueShape::Text => input
            .as_str()
            .filter(|text| !text.is_empty())
            .map(|text| CollectorValue::Text(text.to_string())),
        ValueShape::Index => input
            .as_u64()
            .or_else(|| attributes.get("defaultChoice").and_then(Value::as_u64))
            .or_else(|| attributes.get("defaultOption").and_then(Value::as_u64))
            .and_then(|index| usize::try_from(index).ok())
            .map(CollectorValue::Index),
        ValueShape::Bool => input
            .as_bool()
            .or_else(|| attributes.get("value").and_then(Value::as_bool))
            .map(CollectorValue::Bool),
        ValueShape::Number => input.as_f64().map(CollectorValue::Number),
        ValueShape::None | ValueShape::Secret | ValueShape::Any => None,
    }
}

/// Input name suffix after the `IDTokenN` prefix (`IDToken1question` -> `question`).
fn input_suffix(name: &str) -> &str {
    name.strip_prefix("IDToken")
        .map(|rest| rest.trim_start_matches(|c: char| c.is_ascii_digit()))
        .unwrap_or(name)
}

/// Copies collector values into the callbacks of the stored step body.
///
/// # Errors
/// `TransportError::Decode` if the node does not carry an AM step body.
pub fn encode_submission(node: &ContinuingNode) -> Result<Value, TransportError> {
    let mut body = node.state.clone();
    let callbacks = body["callbacks"]
        .as_array_mut()
        .ok_or_else(|| TransportError::Decode("node state has no callbacks".to_string()))?;

    for (index, callback) in callbacks.iter_mut().enumerate() {
        let id = collector_id(index, callback);
        let Some(collector) = node.collector(&id) else {
            continue;
        };
        let Some(inputs) = callback["input"].as_array_mut() else {
            continue;
        };
        fill_inputs(collector, inputs);
    }

    Ok(body)
}

fn fill_inputs(collector: &Collector, inputs: &mut [Value]) {
    if collector.kind().is_display_only() {
        return;
    }

    let value = collector.value();
    let mut primary_done = value.is_empty();

    if let Some(Value::Object(fields)) = value.as_json() {
        for input in inputs.iter_mut() {
            let suffix = input["name"].as_str().map(input_suffix).unwrap_or_default();
            if let Some(field) = fields.get(suffix).filter(|_| !suffix.is_empty()) {
                input["value"] = field.clone();
                primary_done = true;
            }
        }
    }

    for input in inputs.iter_mut() {
        let name = input["name"].as_str().unwrap_or_default().to_string();
        let suffix = input_suffix(&name);

        if suffix == "validateOnly" {
            input["value"] = Value::Bool(false);
        } else if suffix == "clientError" {
            if let Some(error) = collector.client_error() {
                input["value"] = Value::String(error.to_string());
            }
        } else if suffix.is_empty() && !primary_done {
            input["value"] = match value.to_wire() {
                // structured payloads go on the wire as a JSON string
                wire @ (Value::Object(_) | Value::Array(_)) => Value::String(wire.to_string()),
                wire => wire,
            };
            primary_done = true;
        }
    }
}
