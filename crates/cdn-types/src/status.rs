use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity of a monitoring line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusLevel {
    Ok,
    Warn,
    Alert,
}

impl fmt::Display for StatusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("OK"),
            Self::Warn => f.write_str("WARN"),
            Self::Alert => f.write_str("ALERT"),
        }
    }
}

/// One (component, value) pair reported for aggregation by a monitoring
/// collector.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringStatusLine {
    pub component: String,
    pub value: String,
    pub status: StatusLevel,
}

impl MonitoringStatusLine {
    pub fn new(component: impl Into<String>, value: impl Into<String>, status: StatusLevel) -> Self {
        Self {
            component: component.into(),
            value: value.into(),
            status,
        }
    }

    pub fn ok(component: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(component, value, StatusLevel::Ok)
    }

    pub fn warn(component: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(component, value, StatusLevel::Warn)
    }

    pub fn alert(component: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(component, value, StatusLevel::Alert)
    }
}

impl fmt::Display for MonitoringStatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.status, self.component, self.value)
    }
}
