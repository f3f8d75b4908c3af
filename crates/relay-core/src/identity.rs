//! Agent identity reported in the first frame of a connection.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Placeholder for identity fields the agent did not report.
pub const UNKNOWN: &str = "Unknown";

/// Host and runtime details of a connected agent.
///
/// Parsing never fails on missing or null fields; they fall back to
/// [`UNKNOWN`] (or `None` for the CPU count).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default = "unknown", deserialize_with = "or_unknown")]
    pub hostname: String,
    #[serde(default = "unknown", deserialize_with = "or_unknown")]
    pub username: String,
    #[serde(default = "unknown", deserialize_with = "or_unknown")]
    pub os: String,
    #[serde(default = "unknown", deserialize_with = "or_unknown")]
    pub os_version: String,
    #[serde(default = "unknown", deserialize_with = "or_unknown")]
    pub architecture: String,
    /// Version of the agent's runtime.
    #[serde(
        default = "unknown",
        deserialize_with = "or_unknown",
        alias = "python_version"
    )]
    pub runtime_version: String,
    #[serde(default, deserialize_with = "lenient_count")]
    pub cpu_count: Option<u32>,
    /// Free-form platform description.
    #[serde(
        default = "unknown",
        deserialize_with = "or_unknown",
        alias = "platform_details"
    )]
    pub platform: String,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            hostname: unknown(),
            username: unknown(),
            os: unknown(),
            os_version: unknown(),
            architecture: unknown(),
            runtime_version: unknown(),
            cpu_count: None,
            platform: unknown(),
        }
    }
}

fn unknown() -> String {
    UNKNOWN.to_owned()
}

fn or_unknown<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) if !s.trim().is_empty() => s,
        None | Some(Value::Null | Value::String(_)) => unknown(),
        Some(other) => other.to_string(),
    })
}

fn lenient_count<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Value>::deserialize(deserializer)?
        .as_ref()
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok()))
}
