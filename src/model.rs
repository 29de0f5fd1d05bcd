use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A canonical tool record aggregated from some backend.
///
/// Tools are value objects: mutation produces a new value which is
/// re-registered in the index. Identity is `id = namespace + ":" + name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Stable identifier, `namespace:name`.
    pub id: String,
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub description: String,
    /// Short one-line summary; falls back to the first sentence of the description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Normalized: lower-case, deduped, sorted.
    #[serde(default)]
    pub tags: Vec<String>,
    /// JSON Schema for the tool's input.
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<ToolExample>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_refs: Vec<String>,
    /// Open mapping for backend-specific extras.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
}

impl Tool {
    /// Build the canonical tool id from its parts.
    pub fn tool_id(namespace: &str, name: &str) -> String {
        format!("{namespace}:{name}")
    }

    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let name = name.into();
        Self {
            id: Self::tool_id(&namespace, &name),
            name,
            namespace,
            version: None,
            description: String::new(),
            summary: None,
            tags: Vec::new(),
            input_schema: serde_json::json!({"type": "object"}),
            output_schema: None,
            examples: Vec::new(),
            external_refs: Vec::new(),
            meta: Map::new(),
        }
    }

    /// Re-derive the id from namespace/name and normalize tags.
    pub fn normalize(&mut self) {
        self.id = Self::tool_id(&self.namespace, &self.name);
        self.tags = normalize_tags(std::mem::take(&mut self.tags));
    }

    /// One-line summary for search results: explicit summary, else the first
    /// sentence of the description.
    pub fn summary_line(&self) -> String {
        match &self.summary {
            Some(s) if !s.is_empty() => s.clone(),
            _ => first_sentence(&self.description),
        }
    }
}

/// A worked example attached to a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExample {
    pub title: String,
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// A source a tool is reachable through. A tool may carry several; the index
/// keeps them in insertion order and dedups by kind + name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendRef {
    Mcp { server_name: String },
    Provider { provider_id: String },
    Local { name: String },
}

impl BackendRef {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendRef::Mcp { .. } => "mcp",
            BackendRef::Provider { .. } => "provider",
            BackendRef::Local { .. } => "local",
        }
    }

    pub fn target(&self) -> &str {
        match self {
            BackendRef::Mcp { server_name } => server_name,
            BackendRef::Provider { provider_id } => provider_id,
            BackendRef::Local { name } => name,
        }
    }

    /// Key used for edge dedup and the backend→tools reverse map.
    pub fn edge_key(&self) -> String {
        format!("{}:{}", self.kind(), self.target())
    }
}

/// How a caller authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    None,
    Jwt,
    ApiKey,
    Mtls,
    Oauth2,
}

/// The authenticated principal attached to a single call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub principal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub method: AuthMethod,
    /// Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl Identity {
    /// The distinguished anonymous identity (method `none`).
    pub fn anonymous() -> Self {
        Self {
            principal: "anonymous".to_string(),
            tenant: None,
            roles: Vec::new(),
            permissions: Vec::new(),
            method: AuthMethod::None,
            issued_at: None,
            expires_at: None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.method == AuthMethod::None
    }
}

/// Normalize a tag set: lower-case, trim, drop empties, dedup, sort.
/// Idempotent: `normalize_tags(normalize_tags(t)) == normalize_tags(t)`.
pub fn normalize_tags(tags: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = tags
        .into_iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Extract the first sentence from a description string.
pub fn first_sentence(text: &str) -> String {
    if let Some(idx) = text.find(". ") {
        text[..=idx].to_string()
    } else if let Some(idx) = text.find(".\n") {
        text[..=idx].to_string()
    } else if text.len() > 200 {
        let mut end = 200;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    } else {
        text.to_string()
    }
}
