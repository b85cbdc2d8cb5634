//! Collectors: the individual inputs a continuing node requests.
//!
//! A collector's composition (id, kind, prompt, server attributes) is fixed
//! when the node arrives; only its value, client error and server validation
//! state change afterwards. Kinds are an open tag: anything the client does not
//! recognise becomes [`CollectorKind::Unsupported`] and never blocks the flow.

use super::error::{FlowError, Result};
use super::policy::{Policy, ValidationError};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CollectorKind {
    Name,
    Password,
    TextInput,
    TextOutput,
    SuspendedTextOutput,
    Choice,
    Confirmation,
    BooleanAttribute,
    NumberAttribute,
    StringAttribute,
    ValidatedUsername,
    ValidatedPassword,
    KbaCreate,
    TermsAndConditions,
    ConsentMapping,
    HiddenValue,
    PollingWait,
    DeviceProfile,
    ReCaptcha,
    ProtectInitialize,
    ProtectEvaluation,
    FidoRegistration,
    FidoAuthentication,
    DeviceBinding,
    SigningVerifier,
    SelectIdp,
    IdpRedirect,
    Unsupported(String),
}

impl CollectorKind {
    /// Stable kebab-case tag used in logs and registries.
    #[must_use]
    pub fn tag(&self) -> &str {
        match self {
            Self::Name => "name",
            Self::Password => "password",
            Self::TextInput => "text-input",
            Self::TextOutput => "text-output",
            Self::SuspendedTextOutput => "suspended-text-output",
            Self::Choice => "choice",
            Self::Confirmation => "confirmation",
            Self::BooleanAttribute => "boolean-attribute",
            Self::NumberAttribute => "number-attribute",
            Self::StringAttribute => "string-attribute",
            Self::ValidatedUsername => "validated-username",
            Self::ValidatedPassword => "validated-password",
            Self::KbaCreate => "kba-create",
            Self::TermsAndConditions => "terms-and-conditions",
            Self::ConsentMapping => "consent-mapping",
            Self::HiddenValue => "hidden-value",
            Self::PollingWait => "polling-wait",
            Self::DeviceProfile => "device-profile",
            Self::ReCaptcha => "recaptcha",
            Self::ProtectInitialize => "protect-initialize",
            Self::ProtectEvaluation => "protect-evaluation",
            Self::FidoRegistration => "fido-registration",
            Self::FidoAuthentication => "fido-authentication",
            Self::DeviceBinding => "device-binding",
            Self::SigningVerifier => "signing-verifier",
            Self::SelectIdp => "select-idp",
            Self::IdpRedirect => "idp-redirect",
            Self::Unsupported(raw) => raw,
        }
    }

    /// Parses a kebab-case tag; unknown tags map to `Unsupported`.
    #[must_use]
    pub fn from_tag(tag: &str) -> Self {
        Self::known()
            .into_iter()
            .find(|kind| kind.tag() == tag)
            .unwrap_or_else(|| Self::Unsupported(tag.to_string()))
    }

    /// Maps an AM callback `type` to a kind.
    #[must_use]
    pub fn from_callback_type(callback_type: &str) -> Self {
        match callback_type {
            "NameCallback" => Self::Name,
            "PasswordCallback" => Self::Password,
            "TextInputCallback" => Self::TextInput,
            "TextOutputCallback" => Self::TextOutput,
            "SuspendedTextOutputCallback" => Self::SuspendedTextOutput,
            "ChoiceCallback" => Self::Choice,
            "ConfirmationCallback" => Self::Confirmation,
            "BooleanAttributeInputCallback" => Self::BooleanAttribute,
            "NumberAttributeInputCallback" => Self::NumberAttribute,
            "StringAttributeInputCallback" => Self::StringAttribute,
            "ValidatedCreateUsernameCallback" => Self::ValidatedUsername,
            "ValidatedCreatePasswordCallback" => Self::ValidatedPassword,
            "KbaCreateCallback" => Self::KbaCreate,
            "TermsAndConditionsCallback" => Self::TermsAndConditions,
            "ConsentMappingCallback" => Self::ConsentMapping,
            "HiddenValueCallback" => Self::HiddenValue,
            "PollingWaitCallback" => Self::PollingWait,
            "DeviceProfileCallback" => Self::DeviceProfile,
            "ReCaptchaEnterpriseCallback" => Self::ReCaptcha,
            "PingOneProtectInitializeCallback" => Self::ProtectInitialize,
            "PingOneProtectEvaluationCallback" => Self::ProtectEvaluation,
            "WebAuthnRegistrationCallback" => Self::FidoRegistration,
            "WebAuthnAuthenticationCallback" => Self::FidoAuthentication,
            "DeviceBindingCallback" => Self::DeviceBinding,
            "DeviceSigningVerifierCallback" => Self::SigningVerifier,
            "SelectIdPCallback" => Self::SelectIdp,
            "IdPCallback" => Self::IdpRedirect,
            other => Self::Unsupported(other.to_string()),
        }
    }

    #[must_use]
    pub fn known() -> Vec<Self> {
        vec![
            Self::Name,
            Self::Password,
            Self::TextInput,
            Self::TextOutput,
            Self::SuspendedTextOutput,
            Self::Choice,
            Self::Confirmation,
            Self::BooleanAttribute,
            Self::NumberAttribute,
            Self::StringAttribute,
            Self::ValidatedUsername,
            Self::ValidatedPassword,
            Self::KbaCreate,
            Self::TermsAndConditions,
            Self::ConsentMapping,
            Self::HiddenValue,
            Self::PollingWait,
            Self::DeviceProfile,
            Self::ReCaptcha,
            Self::ProtectInitialize,
            Self::ProtectEvaluation,
            Self::FidoRegistration,
            Self::FidoAuthentication,
            Self::DeviceBinding,
            Self::SigningVerifier,
            Self::SelectIdp,
            Self::IdpRedirect,
        ]
    }

    /// Shape of the value the collector holds.
    #[must_use]
    pub fn value_shape(&self) -> ValueShape {
        match self {
            Self::Password | Self::ValidatedPassword => ValueShape::Secret,
            Self::Choice | Self::Confirmation => ValueShape::Index,
            Self::BooleanAttribute | Self::TermsAndConditions | Self::ConsentMapping => {
                ValueShape::Bool
            }
            Self::NumberAttribute => ValueShape::Number,
            Self::TextOutput | Self::SuspendedTextOutput => ValueShape::None,
            Self::Name
            | Self::TextInput
            | Self::StringAttribute
            | Self::ValidatedUsername
            | Self::HiddenValue
            | Self::SelectIdp => ValueShape::Text,
            Self::KbaCreate
            | Self::PollingWait
            | Self::DeviceProfile
            | Self::ReCaptcha
            | Self::ProtectInitialize
            | Self::ProtectEvaluation
            | Self::FidoRegistration
            | Self::FidoAuthentication
            | Self::DeviceBinding
            | Self::SigningVerifier
            | Self::IdpRedirect
            | Self::Unsupported(_) => ValueShape::Any,
        }
    }

    #[must_use]
    pub fn is_display_only(&self) -> bool {
        matches!(self, Self::TextOutput | Self::SuspendedTextOutput)
    }
}

impl fmt::Display for CollectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueShape {
    None,
    Text,
    Secret,
    Index,
    Bool,
    Number,
    Any,
}

#[derive(Clone, Debug, Default)]
pub enum CollectorValue {
    #[default]
    Empty,
    Text(String),
    Secret(SecretString),
    Index(usize),
    Bool(bool),
    Number(f64),
    Json(Value),
}

impl CollectorValue {
    #[must_use]
    pub fn secret(value: impl Into<String>) -> Self {
        Self::Secret(SecretString::from(value.into()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(text) => text.is_empty(),
            Self::Secret(secret) => secret.expose_secret().is_empty(),
            Self::Json(value) => value.is_null(),
            Self::Index(_) | Self::Bool(_) | Self::Number(_) => false,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Secret(secret) => Some(secret.expose_secret()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_index(&self) -> Option<usize> {
        match self {
            Self::Index(index) => Some(*index),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(flag) => Some(*flag),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    fn fits(&self, shape: ValueShape) -> bool {
        matches!(
            (shape, self),
            (_, Self::Empty)
                | (ValueShape::Any, _)
                | (ValueShape::Text, Self::Text(_))
                | (ValueShape::Secret, Self::Secret(_) | Self::Text(_))
                | (ValueShape::Index, Self::Index(_))
                | (ValueShape::Bool, Self::Bool(_))
                | (ValueShape::Number, Self::Number(_))
        )
    }

    /// Wire form of the value. Secrets are exposed here and only here.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Empty => Value::String(String::new()),
            Self::Text(text) => Value::String(text.clone()),
            Self::Secret(secret) => Value::String(secret.expose_secret().to_string()),
            Self::Index(index) => Value::from(*index),
            Self::Bool(flag) => Value::Bool(*flag),
            Self::Number(number) => Value::from(*number),
            Self::Json(value) => value.clone(),
        }
    }
}

/// One requested input unit of a continuing node.
#[derive(Clone, Debug)]
pub struct Collector {
    id: String,
    kind: CollectorKind,
    prompt: String,
    attributes: Value,
    policies: Vec<Policy>,
    required: bool,
    value: CollectorValue,
    client_error: Option<String>,
    failed_policies: Vec<ValidationError>,
}

impl Collector {
    #[must_use]
    pub fn new(id: impl Into<String>, kind: CollectorKind) -> Self {
        let required = matches!(
            kind,
            CollectorKind::Name
                | CollectorKind::Password
                | CollectorKind::ValidatedUsername
                | CollectorKind::ValidatedPassword
        );
        Self {
            id: id.into(),
            prompt: kind.tag().to_string(),
            kind,
            attributes: Value::Null,
            policies: Vec::new(),
            required,
            value: CollectorValue::Empty,
            client_error: None,
            failed_policies: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Server-provided attributes (choices, `waitTime`, challenge data, ...).
    #[must_use]
    pub fn with_attributes(mut self, attributes: Value) -> Self {
        self.attributes = attributes;
        self
    }

    #[must_use]
    pub fn with_policies(mut self, policies: Vec<Policy>) -> Self {
        self.policies = policies;
        self
    }

    #[must_use]
    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    #[must_use]
    pub fn with_failed_policies(mut self, failed: Vec<ValidationError>) -> Self {
        self.failed_policies = failed;
        self
    }

    /// Initial value supplied by the server (default choice, prefilled text).
    #[must_use]
    pub fn with_value(mut self, value: CollectorValue) -> Self {
        self.value = value;
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> &CollectorKind {
        &self.kind
    }

    #[must_use]
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    #[must_use]
    pub fn attributes(&self) -> &Value {
        &self.attributes
    }

    #[must_use]
    pub fn is_required(&self) -> bool {
        self.required
    }

    #[must_use]
    pub fn value(&self) -> &CollectorValue {
        &self.value
    }

    /// Sets the value, rejecting payloads that do not fit the collector kind.
    ///
    /// # Errors
    /// Returns `FlowError::InvalidState` on a shape mismatch or when the
    /// collector is display-only.
    pub fn set_value(&mut self, value: CollectorValue) -> Result<()> {
        let shape = self.kind.value_shape();
        if shape == ValueShape::None || !value.fits(shape) {
            return Err(FlowError::invalid_state(format!(
                "collector {} ({}) does not accept this value",
                self.id, self.kind
            )));
        }
        self.value = match (shape, value) {
            (ValueShape::Secret, CollectorValue::Text(text)) => CollectorValue::secret(text),
            (_, value) => value,
        };
        Ok(())
    }

    #[must_use]
    pub fn client_error(&self) -> Option<&str> {
        self.client_error.as_deref()
    }

    /// Records a client-side failure of the collector's action; transports
    /// submit it so the server can decide how to continue.
    pub fn set_client_error(&mut self, message: impl Into<String>) {
        self.client_error = Some(message.into());
    }

    /// Failed policies reported by the server for the previous submission.
    #[must_use]
    pub fn validation_state(&self) -> &[ValidationError] {
        &self.failed_policies
    }

    /// Choice labels for `choice`/`confirmation`/`select-idp` collectors.
    #[must_use]
    pub fn choices(&self) -> Vec<String> {
        ["choices", "options", "providers"]
            .iter()
            .find_map(|key| self.attributes[*key].as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        item.as_str()
                            .map(ToString::to_string)
                            .or_else(|| item["provider"].as_str().map(ToString::to_string))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// True once the collector holds something worth submitting or is
    /// display-only.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.kind.is_display_only() || !self.value.is_empty() || self.client_error.is_some()
    }

    /// Local, syntactic validation. Pure and idempotent: no side effects, and
    /// an unchanged value always yields the same list.
    #[must_use]
    pub fn validate(&self) -> Vec<ValidationError> {
        use super::policy::PolicyRequirement;

        // unknown kinds are left to the server
        if self.kind.is_display_only() || matches!(self.kind, CollectorKind::Unsupported(_)) {
            return Vec::new();
        }

        let mut errors = Vec::new();

        if self.required && self.value.is_empty() {
            errors.push(ValidationError::new(
                PolicyRequirement::Required,
                format!("{} is required", self.prompt),
                Value::Null,
            ));
        }

        if let Some(index) = self.value.as_index() {
            let choices = self.choices();
            if !choices.is_empty() && index >= choices.len() {
                errors.push(ValidationError::new(
                    PolicyRequirement::Other("CHOICE_RANGE".to_string()),
                    format!("{} has no option {index}", self.prompt),
                    Value::from(choices.len()),
                ));
            }
        }

        let text = self.value.as_text().unwrap_or_default();
        for policy in &self.policies {
            if matches!(policy, Policy::Required) && self.required {
                continue;
            }
            if let Some(error) = policy.check(text, &self.prompt) {
                errors.push(error);
            }
        }

        errors
    }

    /// Same composition (id and kind) as `other`.
    #[must_use]
    pub fn same_shape(&self, other: &Self) -> bool {
        self.id == other.id && self.kind == other.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journey::policy::PolicyRequirement;
    use serde_json::json;

    #[test]
    fn unknown_tags_are_unsupported() {
        assert_eq!(CollectorKind::from_tag("password"), CollectorKind::Password);
        assert_eq!(
            CollectorKind::from_tag("quantum-handshake"),
            CollectorKind::Unsupported("quantum-handshake".to_string())
        );
        assert_eq!(
            CollectorKind::from_callback_type("DeviceBindingCallback"),
            CollectorKind::DeviceBinding
        );
    }

    #[test]
    fn every_known_tag_round_trips() {
        for kind in CollectorKind::known() {
            assert_eq!(CollectorKind::from_tag(kind.tag()), kind);
        }
    }

    #[test]
    fn password_text_is_stored_as_secret() {
        let mut collector = Collector::new("cb-1", CollectorKind::Password);
        collector
            .set_value(CollectorValue::Text("secret".to_string()))
            .unwrap();
        assert!(matches!(collector.value(), CollectorValue::Secret(_)));
        assert_eq!(collector.value().as_text(), Some("secret"));
        assert!(!format!("{:?}", collector.value()).contains("secret\""));
    }

    #[test]
    fn rejects_shape_mismatch() {
        let mut choice = Collector::new("cb-0", CollectorKind::Choice);
        let err = choice
            .set_value(CollectorValue::Text("yes".to_string()))
            .unwrap_err();
        assert!(err.is_invalid_state());

        let mut output = Collector::new("cb-1", CollectorKind::TextOutput);
        assert!(output.set_value(CollectorValue::Text("x".into())).is_err());
    }

    #[test]
    fn validate_is_idempotent() {
        let collector = Collector::new("cb-0", CollectorKind::ValidatedPassword)
            .with_prompt("Password")
            .with_policies(crate::journey::policy::default_password_policy());
        let first = collector.validate();
        let second = collector.validate();
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].requirement, PolicyRequirement::Required);
    }

    #[test]
    fn unsupported_collectors_never_fail_validation() {
        let collector = Collector::new("x", CollectorKind::Unsupported("FooCallback".into()))
            .with_prompt("Foo")
            .with_required(true);
        assert!(collector.validate().is_empty());
    }

    #[test]
    fn validate_runs_policies_on_text() {
        let mut collector = Collector::new("cb-0", CollectorKind::ValidatedPassword)
            .with_prompt("Password")
            .with_policies(crate::journey::policy::default_password_policy());
        collector
            .set_value(CollectorValue::secret("short"))
            .unwrap();
        let requirements: Vec<_> = collector
            .validate()
            .into_iter()
            .map(|e| e.requirement)
            .collect();
        assert_eq!(
            requirements,
            vec![
                PolicyRequirement::LengthBased,
                PolicyRequirement::CharacterSet
            ]
        );

        collector
            .set_value(CollectorValue::secret("Sup3rSecret"))
            .unwrap();
        assert!(collector.validate().is_empty());
    }

    #[test]
    fn choice_index_out_of_range() {
        let mut collector = Collector::new("cb-0", CollectorKind::Choice)
            .with_prompt("Pick")
            .with_attributes(json!({ "choices": ["red", "blue"] }));
        collector.set_value(CollectorValue::Index(2)).unwrap();
        assert_eq!(collector.validate().len(), 1);
        collector.set_value(CollectorValue::Index(1)).unwrap();
        assert!(collector.validate().is_empty());
    }

    #[test]
    fn settled_states() {
        let mut profile = Collector::new("cb-0", CollectorKind::DeviceProfile);
        assert!(!profile.is_settled());
        profile.set_client_error("collection failed");
        assert!(profile.is_settled());
        assert!(Collector::new("cb-1", CollectorKind::TextOutput).is_settled());
    }
}
