use std::fmt;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// One entry of an instance view `statuses` list.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    #[serde(default)]
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_status: Option<String>,
}

impl StatusRecord {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            display_status: None,
        }
    }

    /// Split `"Category/value"` into its two halves.
    fn split(&self) -> Option<(&str, &str)> {
        self.code.split_once('/')
    }
}

/// Coarse VM power state.  Absence of a `PowerState/*` code is `Unknown`,
/// never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowerState {
    Reported(String),
    Unknown,
}

impl PowerState {
    pub fn as_str(&self) -> &str {
        match self {
            PowerState::Reported(v) => v,
            PowerState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for PowerState {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

/// Value of the first status whose category is `category`.
pub fn status_value<'a>(statuses: &'a [StatusRecord], category: &str) -> Option<&'a str> {
    statuses
        .iter()
        .filter_map(StatusRecord::split)
        .find(|(cat, _)| *cat == category)
        .map(|(_, value)| value)
}

pub fn power_state(statuses: &[StatusRecord]) -> PowerState {
    status_value(statuses, "PowerState")
        .map(|v| PowerState::Reported(v.to_string()))
        .unwrap_or(PowerState::Unknown)
}

pub fn provisioning_state(statuses: &[StatusRecord]) -> Option<String> {
    status_value(statuses, "ProvisioningState").map(str::to_string)
}

/// Pull the `statuses` list out of an instance view body.  Missing or
/// malformed lists read as empty.
pub fn statuses_of(instance_view: &Value) -> Vec<StatusRecord> {
    instance_view
        .get("statuses")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}
