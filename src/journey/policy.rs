//! Local, syntactic validation policies for collectors.
//!
//! Policies come from the server alongside validated collectors (username,
//! password, attribute inputs). They are evaluated locally so the UI can show
//! inline errors before submitting; the server stays authoritative and reports
//! its own verdict through `failedPolicies` on the next node. Evaluation never
//! touches the network and has no side effects.

use regex::Regex;
use serde_json::{json, Value};
use std::fmt;

const EMAIL_PATTERN: &str = r"^[^@\s]+@[^@\s]+\.[^@\s]+$";
const UPPERCASE: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWERCASE: &str = "abcdefghijklmnopqrstuvwxyz";
const DIGITS: &str = "0123456789";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PolicyRequirement {
    Required,
    LengthBased,
    CharacterSet,
    MatchRegexp,
    Unique,
    Other(String),
}

impl PolicyRequirement {
    #[must_use]
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "REQUIRED" => Self::Required,
            "LENGTH_BASED" | "MIN_LENGTH" | "MAX_LENGTH" => Self::LengthBased,
            "CHARACTER_SET" | "AT_LEAST_X_CAPITAL_LETTERS" | "AT_LEAST_X_NUMBERS" => {
                Self::CharacterSet
            }
            "MATCH_REGEXP" | "VALID_EMAIL_ADDRESS_FORMAT" => Self::MatchRegexp,
            "UNIQUE" => Self::Unique,
            other => Self::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Required => "REQUIRED",
            Self::LengthBased => "LENGTH_BASED",
            Self::CharacterSet => "CHARACTER_SET",
            Self::MatchRegexp => "MATCH_REGEXP",
            Self::Unique => "UNIQUE",
            Self::Other(raw) => raw,
        }
    }
}

impl fmt::Display for PolicyRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed policy, either computed locally or reported by the server.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
    pub requirement: PolicyRequirement,
    pub message: String,
    pub params: Value,
}

impl ValidationError {
    #[must_use]
    pub fn new(requirement: PolicyRequirement, message: impl Into<String>, params: Value) -> Self {
        Self {
            requirement,
            message: message.into(),
            params,
        }
    }

    /// Parses one entry of a server `failedPolicies` list. Entries are either
    /// JSON objects or JSON-encoded strings of the same object.
    #[must_use]
    pub fn from_failed_policy(raw: &Value, prompt: &str) -> Option<Self> {
        let object = match raw {
            Value::String(encoded) => serde_json::from_str::<Value>(encoded).ok()?,
            Value::Object(_) => raw.clone(),
            _ => return None,
        };

        let requirement = PolicyRequirement::from_wire(object["policyRequirement"].as_str()?);
        let params = object.get("params").cloned().unwrap_or(Value::Null);
        let message = describe_failure(&requirement, &params, prompt);

        Some(Self::new(requirement, message, params))
    }
}

/// Builds a user-facing sentence for a failed requirement.
fn describe_failure(requirement: &PolicyRequirement, params: &Value, prompt: &str) -> String {
    match requirement {
        PolicyRequirement::Required => format!("{prompt} is required"),
        PolicyRequirement::LengthBased => {
            let min = params["min-password-length"]
                .as_u64()
                .or_else(|| params["minLength"].as_u64());
            let max = params["max-password-length"]
                .as_u64()
                .or_else(|| params["maxLength"].as_u64())
                .filter(|max| *max > 0);
            match (min, max) {
                (Some(min), Some(max)) => {
                    format!("{prompt} must be between {min} and {max} characters")
                }
                (Some(min), None) => format!("{prompt} must be at least {min} characters"),
                (None, Some(max)) => format!("{prompt} must be at most {max} characters"),
                (None, None) => format!("{prompt} has an invalid length"),
            }
        }
        PolicyRequirement::CharacterSet => {
            format!("{prompt} must contain the required character classes")
        }
        PolicyRequirement::MatchRegexp => format!("{prompt} has an invalid format"),
        PolicyRequirement::Unique => format!("{prompt} must be unique"),
        PolicyRequirement::Other(_) => format!("Please check {prompt} for correctness"),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CharacterClass {
    pub min: usize,
    pub chars: String,
}

impl CharacterClass {
    /// Parses the `"<count>:<characters>"` encoding used by `CHARACTER_SET`.
    #[must_use]
    pub fn parse(encoded: &str) -> Option<Self> {
        let (count, chars) = encoded.split_once(':')?;
        Some(Self {
            min: count.trim().parse().ok()?,
            chars: chars.to_string(),
        })
    }

    fn satisfied_by(&self, input: &str) -> bool {
        input.chars().filter(|c| self.chars.contains(*c)).count() >= self.min
    }
}

#[derive(Clone, Debug)]
pub enum Policy {
    Required,
    Length {
        min: Option<usize>,
        max: Option<usize>,
    },
    CharacterSet(Vec<CharacterClass>),
    Pattern(Regex),
}

impl Policy {
    #[must_use]
    pub fn requirement(&self) -> PolicyRequirement {
        match self {
            Self::Required => PolicyRequirement::Required,
            Self::Length { .. } => PolicyRequirement::LengthBased,
            Self::CharacterSet(_) => PolicyRequirement::CharacterSet,
            Self::Pattern(_) => PolicyRequirement::MatchRegexp,
        }
    }

    fn params(&self) -> Value {
        match self {
            Self::Required => Value::Null,
            Self::Length { min, max } => json!({ "minLength": min, "maxLength": max }),
            Self::CharacterSet(classes) => json!({
                "character-sets": classes
                    .iter()
                    .map(|class| format!("{}:{}", class.min, class.chars))
                    .collect::<Vec<_>>()
            }),
            Self::Pattern(regex) => json!({ "regexp": regex.as_str() }),
        }
    }

    /// Evaluates the policy against the current textual input. Empty input only
    /// fails `Required`; the other policies apply once something was typed.
    #[must_use]
    pub fn check(&self, input: &str, prompt: &str) -> Option<ValidationError> {
        let passed = match self {
            Self::Required => !input.trim().is_empty(),
            _ if input.is_empty() => true,
            Self::Length { min, max } => {
                let len = input.chars().count();
                min.map_or(true, |min| len >= min) && max.map_or(true, |max| len <= max)
            }
            Self::CharacterSet(classes) => classes.iter().all(|class| class.satisfied_by(input)),
            Self::Pattern(regex) => regex.is_match(input),
        };

        if passed {
            return None;
        }

        let requirement = self.requirement();
        let params = self.params();
        let message = describe_failure(&requirement, &params, prompt);
        Some(ValidationError::new(requirement, message, params))
    }
}

/// Builds local policies from the `policies` output of a validated callback.
///
/// Both encodings seen in the wild are accepted: the policy-id list
/// (`minimum-length`, `at-least-X-capitals`, ...) and the requirement list with
/// `LENGTH_BASED` / `CHARACTER_SET` parameters. Unknown policies are skipped and
/// left to the server.
#[must_use]
pub fn parse_policies(raw: &Value) -> Vec<Policy> {
    let mut policies = Vec::new();

    let Some(entries) = raw["policies"].as_array().or_else(|| raw.as_array()) else {
        return policies;
    };

    for entry in entries {
        let params = &entry["params"];

        if let Some(policy_id) = entry["policyId"].as_str() {
            match policy_id {
                "required" | "not-empty" => policies.push(Policy::Required),
                "minimum-length" => policies.push(Policy::Length {
                    min: as_usize(&params["minLength"]),
                    max: None,
                }),
                "maximum-length" => policies.push(Policy::Length {
                    min: None,
                    max: as_usize(&params["maxLength"]),
                }),
                "at-least-X-capitals" => {
                    if let Some(min) = as_usize(&params["numCaps"]) {
                        policies.push(Policy::CharacterSet(vec![CharacterClass {
                            min,
                            chars: UPPERCASE.to_string(),
                        }]));
                    }
                }
                "at-least-X-numbers" => {
                    if let Some(min) = as_usize(&params["numNums"]) {
                        policies.push(Policy::CharacterSet(vec![CharacterClass {
                            min,
                            chars: DIGITS.to_string(),
                        }]));
                    }
                }
                "valid-email-address-format" => {
                    if let Ok(regex) = Regex::new(EMAIL_PATTERN) {
                        policies.push(Policy::Pattern(regex));
                    }
                }
                "regexpPattern" | "match-regexp" => {
                    if let Some(regex) = params["regexp"].as_str().and_then(|p| Regex::new(p).ok())
                    {
                        policies.push(Policy::Pattern(regex));
                    }
                }
                _ => {}
            }
            continue;
        }

        match entry["policyRequirement"].as_str().map(PolicyRequirement::from_wire) {
            Some(PolicyRequirement::Required) => policies.push(Policy::Required),
            Some(PolicyRequirement::LengthBased) => policies.push(Policy::Length {
                min: as_usize(&params["min-password-length"]),
                max: as_usize(&params["max-password-length"]).filter(|max| *max > 0),
            }),
            Some(PolicyRequirement::CharacterSet) => {
                let classes: Vec<CharacterClass> = params["character-sets"]
                    .as_array()
                    .map(|sets| {
                        sets.iter()
                            .filter_map(Value::as_str)
                            .filter_map(CharacterClass::parse)
                            .collect()
                    })
                    .unwrap_or_default();
                if !classes.is_empty() {
                    policies.push(Policy::CharacterSet(classes));
                }
            }
            _ => {}
        }
    }

    policies
}

/// A reasonable default password policy for local use when the server sends none.
#[must_use]
pub fn default_password_policy() -> Vec<Policy> {
    vec![
        Policy::Required,
        Policy::Length {
            min: Some(8),
            max: None,
        },
        Policy::CharacterSet(vec![
            CharacterClass {
                min: 1,
                chars: UPPERCASE.to_string(),
            },
            CharacterClass {
                min: 1,
                chars: LOWERCASE.to_string(),
            },
            CharacterClass {
                min: 1,
                chars: DIGITS.to_string(),
            },
        ]),
    ]
}

fn as_usize(value: &Value) -> Option<usize> {
    value.as_u64().and_then(|v| usize::try_from(v).ok())
}
