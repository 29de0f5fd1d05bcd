use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::backend::{BackendSettings, RefreshPolicy};
use crate::executor::ExecutorLimits;
use crate::middleware::auth::{ApiKeyPrincipal, RoleDef};
use crate::middleware::cache::CachePolicy;
use crate::middleware::ratelimit::RateLimitSettings;
use crate::middleware::resilience::{CircuitPolicy, RetryPolicy};
use crate::skills::{Skill, SkillLimits, Toolset};

/// The default middleware order, outermost first.
pub const DEFAULT_MIDDLEWARE_CHAIN: [&str; 7] = [
    "auth",
    "audit",
    "metrics",
    "ratelimit",
    "observe",
    "cache",
    "resilience",
];

/// Wire transport the server listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServeTransport {
    Stdio,
    Sse,
    Http,
}

/// Top-level metamux configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_transport")]
    pub transport: ServeTransport,

    /// Listen address for the sse/http transports.
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub backends: Vec<BackendSettings>,

    #[serde(default)]
    pub refresh: RefreshPolicy,

    #[serde(default)]
    pub middleware: MiddlewareOrder,

    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub audit: AuditSettings,

    #[serde(default)]
    pub cache: CachePolicy,

    #[serde(default)]
    pub resilience: ResilienceSettings,

    #[serde(default)]
    pub ratelimit: RateLimitSettings,

    #[serde(default)]
    pub toolsets: Vec<Toolset>,

    #[serde(default)]
    pub skills: Vec<Skill>,

    #[serde(default)]
    pub skill_limits: SkillLimits,

    #[serde(default)]
    pub executor: ExecutorLimits,

    /// Register the built-in `local:*` tools at init.
    #[serde(default = "default_true")]
    pub local_tools: bool,
}

impl Default for Config {
    fn default() -> Self {
        // An empty YAML document deserializes to all defaults.
        serde_yaml_ng::from_str("{}").expect("default config")
    }
}

/// Ordered middleware names, outermost first.
#[derive(Debug, Clone, Deserialize)]
pub struct MiddlewareOrder {
    #[serde(default = "default_chain")]
    pub chain: Vec<String>,
}

fn default_chain() -> Vec<String> {
    DEFAULT_MIDDLEWARE_CHAIN
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for MiddlewareOrder {
    fn default() -> Self {
        Self {
            chain: default_chain(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
    /// Permit unauthenticated callers with the anonymous identity.
    #[serde(default = "default_true")]
    pub anonymous: bool,

    #[serde(default)]
    pub authenticators: Vec<AuthenticatorConfig>,

    #[serde(default)]
    pub authorizer: Option<AuthorizerConfig>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            anonymous: true,
            authenticators: Vec::new(),
            authorizer: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthenticatorConfig {
    Jwt {
        secret: String,
        #[serde(default)]
        issuer: Option<String>,
    },
    ApiKey {
        #[serde(default)]
        header: Option<String>,
        keys: HashMap<String, ApiKeyPrincipal>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthorizerConfig {
    AllowAll,
    Rbac {
        roles: HashMap<String, RoleDef>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditSettings {
    /// Capture call arguments into audit entries. Off by default; arguments
    /// may carry user data.
    #[serde(default)]
    pub include_args: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResilienceSettings {
    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    #[serde(default)]
    pub circuit: Option<CircuitPolicy>,

    /// Overall per-call deadline; composes with the caller's cancellation,
    /// stricter wins.
    #[serde(default, with = "humantime_duration::option")]
    pub timeout: Option<Duration>,
}

// --- Defaults ---

fn default_transport() -> ServeTransport {
    ServeTransport::Stdio
}
fn default_listen() -> String {
    "127.0.0.1:8320".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

// --- humantime_duration serde helper ---

pub mod humantime_duration {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime_format(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime_parse(&s).map_err(serde::de::Error::custom)
    }

    /// `Option<Duration>` variant for optional humantime fields.
    pub mod option {
        use super::{humantime_format, humantime_parse};
        use serde::{self, Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        #[allow(dead_code)]
        pub fn serialize<S>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&humantime_format(d)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let value: Option<String> = Option::deserialize(deserializer)?;
            value
                .map(|s| humantime_parse(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }

    pub(super) fn humantime_format(d: &Duration) -> String {
        let secs = d.as_secs();
        if secs.is_multiple_of(60) && secs >= 60 {
            format!("{}m", secs / 60)
        } else if secs == 0 && d.subsec_millis() > 0 {
            format!("{}ms", d.subsec_millis())
        } else {
            format!("{}s", secs)
        }
    }

    pub(super) fn humantime_parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(n) = s.strip_suffix("ms") {
            n.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else if let Some(n) = s.strip_suffix('s') {
            n.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else if let Some(n) = s.strip_suffix('m') {
            n.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else if let Some(n) = s.strip_suffix('h') {
            n.parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else {
            s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
                format!("invalid duration '{s}': expected format like '500ms', '30s', '5m', '1h'")
            })
        }
    }
}

// --- Loading ---

impl Config {
    /// Load config from a YAML file: read → `${VAR}` expansion → parse →
    /// validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let expanded = shellexpand::env(&raw)
            .map_err(|e| anyhow::anyhow!("env var interpolation failed: {e}"))?;

        let config: Config = serde_yaml_ng::from_str(&expanded)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names: HashSet<&str> = HashSet::new();
        for backend in &self.backends {
            anyhow::ensure!(!backend.name.is_empty(), "backend with empty name");
            anyhow::ensure!(
                names.insert(backend.name.as_str()),
                "duplicate backend name '{}'",
                backend.name
            );
            anyhow::ensure!(
                !backend.url.is_empty(),
                "backend '{}' has an empty url",
                backend.name
            );
        }

        for name in &self.middleware.chain {
            anyhow::ensure!(
                DEFAULT_MIDDLEWARE_CHAIN.contains(&name.as_str()),
                "unknown middleware '{name}' in chain"
            );
        }

        let toolset_ids: HashSet<&str> = self.toolsets.iter().map(|t| t.id.as_str()).collect();
        anyhow::ensure!(
            toolset_ids.len() == self.toolsets.len(),
            "duplicate toolset ids"
        );
        let skill_ids: HashSet<&str> = self.skills.iter().map(|s| s.id.as_str()).collect();
        anyhow::ensure!(skill_ids.len() == self.skills.len(), "duplicate skill ids");
        for skill in &self.skills {
            if let Some(toolset) = &skill.toolset {
                anyhow::ensure!(
                    toolset_ids.contains(toolset.as_str()),
                    "skill '{}' references unknown toolset '{}'",
                    skill.id,
                    toolset
                );
            }
        }

        Ok(())
    }
}
