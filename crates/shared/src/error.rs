use serde::{Deserialize, Serialize};

/// Error body returned by the CSaaS API (`{"detail": "..."}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(serde_json::Value::String(detail.into())),
        }
    }

    /// Flattens `detail` to display text. Validation errors arrive as a list
    /// of objects with a `msg` field.
    pub fn message(&self) -> Option<String> {
        match self.detail.as_ref()? {
            serde_json::Value::String(text) => Some(text.clone()),
            serde_json::Value::Array(items) => {
                let parts: Vec<String> = items
                    .iter()
                    .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
                    .map(str::to_string)
                    .collect();
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join("; "))
                }
            }
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// Error body returned by the identity provider. Different endpoints fill
/// different fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ProviderErrorBody {
    pub fn message(&self) -> Option<String> {
        self.error_description
            .clone()
            .or_else(|| self.msg.clone())
            .or_else(|| self.message.clone())
            .or_else(|| self.error.clone())
    }
}
