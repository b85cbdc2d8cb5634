//! Device profile collection for the terminal front-end.

use crate::journey::{Collector, CollectorAction, CollectorValue, PromptCoordinator, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::env;
use tracing::debug;
use uuid::Uuid;

/// Reports platform metadata when the server asks for it. Location is never
/// available from a terminal and is left out.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    identifier: String,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }
}

impl DeviceProfile {
    #[must_use]
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }

    fn metadata() -> Value {
        let hostname = env::var("HOSTNAME")
            .or_else(|_| env::var("COMPUTERNAME"))
            .unwrap_or_default();
        json!({
            "platform": {
                "platform": env::consts::OS,
                "family": env::consts::FAMILY,
                "deviceName": hostname,
            },
            "hardware": {
                "architecture": env::consts::ARCH,
                "cpuCount": std::thread::available_parallelism().map_or(1, usize::from),
            },
            "browser": {
                "userAgent": crate::APP_USER_AGENT,
            },
        })
    }
}

#[async_trait]
impl CollectorAction for DeviceProfile {
    async fn execute(
        &self,
        collector: &Collector,
        _prompts: &PromptCoordinator,
    ) -> Result<CollectorValue> {
        let wants_metadata = collector.attributes()["metadata"].as_bool().unwrap_or(true);

        let mut profile = Map::new();
        profile.insert("identifier".to_string(), Value::String(self.identifier.clone()));
        if wants_metadata {
            profile.insert("metadata".to_string(), Self::metadata());
        }

        debug!(metadata = wants_metadata, "device profile collected");
        Ok(CollectorValue::Json(Value::Object(profile)))
    }
}
