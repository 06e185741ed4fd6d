//! Engine configuration.
//!
//! Configuration is a plain value handed to each engine component at call
//! time; nothing is read from global state while reconciling.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

const ENV_API_TIMEOUT_SECS: &str = "ADDON_ENGINE_API_TIMEOUT_SECS";
const ENV_FIELD_MANAGER: &str = "ADDON_ENGINE_FIELD_MANAGER";
const ENV_HELM_BIN: &str = "ADDON_ENGINE_HELM_BIN";

const DEFAULT_API_TIMEOUT_SECS: u64 = 30;
const DEFAULT_FIELD_MANAGER: &str = "addon-engine";
const DEFAULT_HELM_BIN: &str = "helm";

/// Settings shared by the deployer, the stale collector and the Helm client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Upper bound for every single cluster or helm call.
    #[serde(default = "default_api_timeout", with = "duration_secs")]
    pub api_timeout: Duration,

    /// Field manager name sent with writes.
    #[serde(default = "default_field_manager")]
    pub field_manager: String,

    /// Helm executable.
    #[serde(default = "default_helm_binary")]
    pub helm_binary: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_timeout: default_api_timeout(),
            field_manager: default_field_manager(),
            helm_binary: default_helm_binary(),
        }
    }
}

impl EngineConfig {
    /// Build from environment variables, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var(ENV_API_TIMEOUT_SECS) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.api_timeout = Duration::from_secs(secs),
                _ => warn!(value = %raw, "Ignoring invalid {ENV_API_TIMEOUT_SECS}"),
            }
        }
        if let Ok(manager) = std::env::var(ENV_FIELD_MANAGER) {
            if !manager.trim().is_empty() {
                config.field_manager = manager.trim().to_string();
            }
        }
        if let Ok(helm) = std::env::var(ENV_HELM_BIN) {
            if !helm.trim().is_empty() {
                config.helm_binary = helm.trim().to_string();
            }
        }

        config
    }

    #[must_use]
    pub fn with_api_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout = timeout;
        self
    }
}

fn default_api_timeout() -> Duration {
    Duration::from_secs(DEFAULT_API_TIMEOUT_SECS)
}

fn default_field_manager() -> String {
    DEFAULT_FIELD_MANAGER.to_string()
}

fn default_helm_binary() -> String {
    DEFAULT_HELM_BIN.to_string()
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Snapshot of the active scripting configuration: named snippets that are
/// prepended, in name order, to every evaluated script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ScriptConfig {
    #[serde(default)]
    pub snippets: BTreeMap<String, String>,
}

impl ScriptConfig {
    /// Build from the data of the configuration object holding the snippets.
    #[must_use]
    pub fn from_data(data: BTreeMap<String, String>) -> Self {
        Self { snippets: data }
    }

    /// Snippets followed by `body`, newline separated.
    #[must_use]
    pub fn assemble(&self, body: &str) -> String {
        let mut script = String::new();
        for snippet in self.snippets.values() {
            script.push_str(snippet);
            script.push('\n');
        }
        script.push_str(body);
        script
    }
}
