// Short operator-facing notices (toasts) raised by dashboard activity.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How long a notice stays visible unless the caller overrides it.
pub const DEFAULT_NOTICE_LIFE: Duration = Duration::from_millis(3_000);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Success,
    Info,
    Warn,
    Error,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notice {
    pub severity: Severity,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(with = "life_millis")]
    pub life: Duration,
}

impl Notice {
    pub fn new(severity: Severity, summary: impl Into<String>, detail: Option<&str>) -> Self {
        Self {
            severity,
            summary: summary.into(),
            detail: detail.map(str::to_owned),
            life: DEFAULT_NOTICE_LIFE,
        }
    }

    pub fn success(summary: impl Into<String>, detail: Option<&str>) -> Self {
        Self::new(Severity::Success, summary, detail)
    }

    pub fn info(summary: impl Into<String>, detail: Option<&str>) -> Self {
        Self::new(Severity::Info, summary, detail)
    }

    pub fn warn(summary: impl Into<String>, detail: Option<&str>) -> Self {
        Self::new(Severity::Warn, summary, detail)
    }

    pub fn error(summary: impl Into<String>, detail: Option<&str>) -> Self {
        Self::new(Severity::Error, summary, detail)
    }

    pub fn with_life(mut self, life: Duration) -> Self {
        self.life = life;
        self
    }

    /// Notice announcing a server-side data-change broadcast.
    ///
    /// Only bulk operations every operator should see get one: `reset`
    /// (all records wiped) and `upload` (records imported from a file).
    pub fn for_action(action: &str) -> Option<Self> {
        match action {
            "reset" => Some(Self::info("Data reset", Some("All records have been reset"))),
            "upload" => {
                Some(Self::info("Data imported", Some("Records have been updated from the import")))
            }
            _ => None,
        }
    }
}

mod life_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(life: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(life.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
