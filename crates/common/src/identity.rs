// Signed-in operator identity as returned by the backend.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identity of the signed-in operator.
///
/// The login endpoint returns a minimal record and the profile endpoint a
/// richer one; both are stored as-is. Fields beyond `id` and `username` are
/// kept verbatim in `profile`, so a newer record always replaces an older one
/// wholesale.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(flatten)]
    pub profile: Map<String, Value>,
}

impl SessionIdentity {
    pub fn new(username: impl Into<String>) -> Self {
        Self { id: None, username: Some(username.into()), profile: Map::new() }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.profile.insert(key.into(), value.into());
        self
    }

    /// A string-valued profile field, e.g. `email` or `nickname`.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.profile.get(key).and_then(Value::as_str)
    }

    /// Best name to greet the operator with.
    pub fn display_name(&self) -> Option<&str> {
        let first = self.field_str("first_name").filter(|name| !name.trim().is_empty());
        self.field_str("nickname")
            .filter(|name| !name.trim().is_empty())
            .or(first)
            .or(self.username.as_deref())
    }
}
