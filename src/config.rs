//! Gateway configuration
//!
//! A single TOML file describes the gateway: listener settings, the backend
//! registry (inline or in a separate file), the task route table, health probing,
//! adapter policies and preflight requirements.

use crate::registry::validator::is_duplicate_key_error;
use crate::registry::RawRegistry;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Locations searched when no config path is given
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["gateway.toml", "config/gateway.toml"];

/// Environment variable overriding `gateway.listen_port`
pub const PORT_ENV_VAR: &str = "GATEWAY_PORT";

static TABLE_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\[\[?\s*([A-Za-z0-9_.\-]+)\s*\]\]?\s*(?:#.*)?$")
        .expect("table header pattern is valid")
});

/// Main gateway configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    pub gateway: GatewaySection,
    /// Inline registry, used when `gateway.registry_file` is not set
    #[serde(default)]
    pub registry: RawRegistry,
    #[serde(default)]
    pub routes: BTreeMap<String, RouteConfig>,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub adapters: AdaptersSection,
    #[serde(default)]
    pub preflight: PreflightSection,
}

/// Gateway section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewaySection {
    /// Gateway identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Deadline applied to each dispatch attempt when the request has none
    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: u64,
    /// External registry document (TOML or JSON), relative to the config file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_file: Option<PathBuf>,
}

fn default_listen_port() -> u16 {
    8080
}

fn default_deadline_ms() -> u64 {
    30_000
}

/// Route table entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RouteConfig {
    /// Simple form: task_type = "backend_key"
    Simple(String),
    /// Complex form: task_type = { backend = "key", fallback = "other_key" }
    Complex {
        backend: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fallback: Option<String>,
    },
}

impl RouteConfig {
    pub fn backend(&self) -> &str {
        match self {
            RouteConfig::Simple(backend) => backend,
            RouteConfig::Complex { backend, .. } => backend,
        }
    }

    pub fn fallback(&self) -> Option<&str> {
        match self {
            RouteConfig::Simple(_) => None,
            RouteConfig::Complex { fallback, .. } => fallback.as_deref(),
        }
    }
}

/// Health probing section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default = "default_health_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Candidate probe paths; the first is the primary path
    #[serde(default = "default_probe_paths")]
    pub probe_paths: Vec<String>,
    #[serde(default = "default_max_alternate_paths")]
    pub max_alternate_paths: usize,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_health_ttl(),
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_paths: default_probe_paths(),
            max_alternate_paths: default_max_alternate_paths(),
        }
    }
}

fn default_health_ttl() -> u64 {
    30
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_probe_paths() -> Vec<String> {
    vec![
        "/health".to_string(),
        "/healthz".to_string(),
        "/ready".to_string(),
    ]
}

fn default_max_alternate_paths() -> usize {
    2
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AdaptersSection {
    #[serde(default)]
    pub local: LocalAdapterSection,
    #[serde(default)]
    pub adapted: AdaptedAdapterSection,
}

/// Policy for backends speaking the canonical shape
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalAdapterSection {
    #[serde(default = "default_local_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_dispatch_path")]
    pub dispatch_path: String,
    #[serde(default = "default_true")]
    pub retry_idempotent_timeouts: bool,
}

impl Default for LocalAdapterSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_local_timeout_ms(),
            dispatch_path: default_dispatch_path(),
            retry_idempotent_timeouts: true,
        }
    }
}

fn default_local_timeout_ms() -> u64 {
    30_000
}

fn default_dispatch_path() -> String {
    "/dispatch".to_string()
}

fn default_true() -> bool {
    true
}

/// Policy and transform rules for backends on the hosted agent platform
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdaptedAdapterSection {
    #[serde(default = "default_adapted_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_wait_path")]
    pub wait_path: String,
    #[serde(default = "default_stream_path")]
    pub stream_path: String,
    /// Environment variable containing the platform API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    #[serde(default = "default_true")]
    pub retry_idempotent_timeouts: bool,
    /// Transform rules keyed by backend key
    #[serde(default)]
    pub rules: HashMap<String, TransformRuleConfig>,
}

impl Default for AdaptedAdapterSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_adapted_timeout_ms(),
            wait_path: default_wait_path(),
            stream_path: default_stream_path(),
            api_key_env: None,
            api_key_header: default_api_key_header(),
            retry_idempotent_timeouts: true,
            rules: HashMap::new(),
        }
    }
}

impl AdaptedAdapterSection {
    /// Get the platform API key from its environment variable, if configured and set
    pub fn api_key(&self) -> Option<String> {
        get_env_var_optional(self.api_key_env.as_ref())
    }
}

fn default_adapted_timeout_ms() -> u64 {
    60_000
}

fn default_wait_path() -> String {
    "/runs/wait".to_string()
}

fn default_stream_path() -> String {
    "/runs/stream".to_string()
}

fn default_api_key_header() -> String {
    "x-api-key".to_string()
}

/// Per-backend request transform for the hosted platform
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TransformRuleConfig {
    /// Assistant used when the task type has no entry in `assistants`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_id: Option<String>,
    /// Assistant id per task type
    #[serde(default)]
    pub assistants: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_prefix: Option<String>,
    /// Metadata field carrying the request id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_field: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PreflightSection {
    /// Backend keys that must be registered and routable for preflight to pass
    #[serde(default)]
    pub mandatory: Vec<String>,
}

/// Where the registry document is read from on startup and on reload
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrySource {
    /// Fixed document, never re-read
    Inline(RawRegistry),
    /// Standalone registry document, TOML or JSON by extension
    File(PathBuf),
    /// The `[registry]` table of a gateway config file
    ConfigFile(PathBuf),
}

impl RegistrySource {
    /// Read the current raw registry document
    pub fn load(&self) -> Result<RawRegistry, ConfigError> {
        match self {
            RegistrySource::Inline(raw) => Ok(raw.clone()),
            RegistrySource::File(path) | RegistrySource::ConfigFile(path) => {
                self.parse(&std::fs::read_to_string(path)?)
            }
        }
    }

    /// [`RegistrySource::load`] for async callers; the read does not block the runtime
    pub async fn load_async(&self) -> Result<RawRegistry, ConfigError> {
        match self {
            RegistrySource::Inline(raw) => Ok(raw.clone()),
            RegistrySource::File(path) | RegistrySource::ConfigFile(path) => {
                self.parse(&tokio::fs::read_to_string(path).await?)
            }
        }
    }

    fn parse(&self, content: &str) -> Result<RawRegistry, ConfigError> {
        match self {
            RegistrySource::Inline(raw) => Ok(raw.clone()),
            RegistrySource::File(path) => {
                let is_json = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("json"));
                if is_json {
                    Ok(RawRegistry::from_json_str(content)?)
                } else {
                    Ok(RawRegistry::from_toml_str(content)?)
                }
            }
            RegistrySource::ConfigFile(_) => match toml::from_str::<RegistryTable>(content) {
                Ok(document) => Ok(document.registry),
                Err(e) if is_duplicate_key_error(&e) => match split_registry_table(content) {
                    Some((_, body)) => Ok(RawRegistry::from_toml_str(&body)?),
                    None => Err(e.into()),
                },
                Err(e) => Err(e.into()),
            },
        }
    }

    pub fn describe(&self) -> String {
        match self {
            RegistrySource::Inline(_) => "inline".to_string(),
            RegistrySource::File(path) => path.display().to_string(),
            RegistrySource::ConfigFile(path) => format!("{} [registry]", path.display()),
        }
    }
}

#[derive(Deserialize)]
struct RegistryTable {
    #[serde(default)]
    registry: RawRegistry,
}

/// Cut the `[registry]` table out of a config document
///
/// Returns the rest of the document and the table body, or `None` unless
/// there is exactly one plain `[registry]` table.
fn split_registry_table(content: &str) -> Option<(String, String)> {
    let mut rest = String::new();
    let mut body = String::new();
    let mut in_registry = false;
    let mut found = false;

    for line in content.lines() {
        if let Some(caps) = TABLE_HEADER.captures(line) {
            let name = &caps[1];
            if name == "registry" {
                if found {
                    return None;
                }
                found = true;
                in_registry = true;
                continue;
            }
            if name.starts_with("registry.") {
                return None;
            }
            in_registry = false;
        }
        let target = if in_registry { &mut body } else { &mut rest };
        target.push_str(line);
        target.push('\n');
    }

    found.then_some((rest, body))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("Invalid gateway ID format: {0}")]
    InvalidGatewayId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("No config file found (searched: {0})")]
    NotFound(String),
}

impl GatewayConfig {
    /// Load configuration from TOML file and apply environment overrides
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;

        // A relative registry_file is relative to the config file
        if let Some(file) = &config.gateway.registry_file {
            if file.is_relative() {
                if let Some(dir) = path.parent() {
                    config.gateway.registry_file = Some(dir.join(file));
                }
            }
        }

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Parse and validate configuration without touching the environment
    ///
    /// A key repeated inside `[registry]` is kept, so registry validation can
    /// report it alongside any other registry issue.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config = match toml::from_str::<GatewayConfig>(content) {
            Ok(config) => config,
            Err(e) if is_duplicate_key_error(&e) => {
                let (rest, body) = split_registry_table(content).ok_or(e)?;
                let mut config: GatewayConfig = toml::from_str(&rest)?;
                config.registry = RawRegistry::from_toml_str(&body)?;
                config
            }
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_gateway_id(&self.gateway.id)?;

        if self.gateway.default_deadline_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "gateway.default_deadline_ms must be greater than zero".to_string(),
            ));
        }

        for (task_type, route) in &self.routes {
            if task_type.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "route with an empty task type".to_string(),
                ));
            }
            if route.backend().trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "route '{task_type}' has an empty backend key"
                )));
            }
            if let Some(fallback) = route.fallback() {
                if fallback.trim().is_empty() {
                    return Err(ConfigError::InvalidConfig(format!(
                        "route '{task_type}' has an empty fallback key"
                    )));
                }
                if fallback == route.backend() {
                    return Err(ConfigError::InvalidConfig(format!(
                        "route '{task_type}' uses '{fallback}' as both backend and fallback"
                    )));
                }
            }
        }

        if self.health.ttl_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "health.ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.health.probe_paths.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "health.probe_paths must list at least one path".to_string(),
            ));
        }
        if let Some(bad) = self
            .health
            .probe_paths
            .iter()
            .find(|p| !p.starts_with('/'))
        {
            return Err(ConfigError::InvalidConfig(format!(
                "health probe path '{bad}' must start with '/'"
            )));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = std::env::var(PORT_ENV_VAR) {
            self.gateway.listen_port = port.trim().parse().map_err(|_| {
                ConfigError::InvalidConfig(format!("{PORT_ENV_VAR}='{port}' is not a valid port"))
            })?;
        }
        Ok(())
    }

    /// Where the registry is loaded from, given the file this config came from
    pub fn registry_source(&self, config_path: Option<&Path>) -> RegistrySource {
        match (&self.gateway.registry_file, config_path) {
            (Some(file), _) => RegistrySource::File(file.clone()),
            (None, Some(path)) => RegistrySource::ConfigFile(path.to_path_buf()),
            (None, None) => RegistrySource::Inline(self.registry.clone()),
        }
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[gateway]
id = "test-gateway"

[registry]
stats = "http://stats.internal:8000"
drafting = { location = "https://platform.example.com/drafting", kind = "adapted" }

[routes]
summarize = "stats"
draft = { backend = "drafting", fallback = "stats" }
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

/// Resolve the config path: the explicit one, else the first default that exists
pub fn find_config_file(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    DEFAULT_CONFIG_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .ok_or_else(|| ConfigError::NotFound(DEFAULT_CONFIG_PATHS.join(", ")))
}

/// Helper to get an optional environment variable
fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}

/// Validate gateway ID format
fn validate_gateway_id(gateway_id: &str) -> Result<(), ConfigError> {
    let valid_chars = gateway_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if gateway_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidGatewayId(format!(
            "Gateway ID '{gateway_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
