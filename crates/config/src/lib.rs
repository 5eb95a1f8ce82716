//! Configuration loading, validation, and management for toolmux.
//!
//! Loads configuration from `~/.toolmux/config.toml` with environment
//! variable overrides. Validates all settings at startup, before any peer
//! process is launched.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable carrying the search API credential.
pub const SEARCH_API_KEY_ENV: &str = "TAVILY_API_KEY";

/// Environment variable overriding the search endpoint inside the search peer.
pub const SEARCH_URL_ENV: &str = "TOOLMUX_SEARCH_URL";

/// Environment variable carrying the search request timeout, in seconds.
pub const SEARCH_TIMEOUT_ENV: &str = "TOOLMUX_SEARCH_TIMEOUT_SECS";

/// Parent variables every builtin peer inherits.
pub const BUILTIN_INHERITED_ENV: &[&str] = &["PATH", "HOME", "RUST_LOG"];

pub const DEFAULT_SYSTEM_PROMPT: &str = "You have access to multiple tools that can help answer queries. \
Use them dynamically and efficiently based on the user's request. \
The search tools can search the web or recent news, giving you access to up-to-date information. \
For questions about current information like news or exchange rates, use the search_web tool to get the most recent data. \
Use the calculate tool for arithmetic instead of computing results yourself.";

/// The root configuration structure.
///
/// Maps directly to `~/.toolmux/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the reasoning provider (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default reasoning provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per model response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Reasoning loop budgets and instruction
    #[serde(default)]
    pub agent: AgentConfig,

    /// Peer supervision timeouts
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Search peer settings
    #[serde(default)]
    pub search: SearchConfig,

    /// Weather peer settings
    #[serde(default)]
    pub weather: WeatherConfig,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Explicit peer set. Empty means the builtin peers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<PeerConfig>,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.0
}
fn default_max_tokens() -> u32 {
    4096
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("agent", &self.agent)
            .field("supervisor", &self.supervisor)
            .field("search", &self.search)
            .field("weather", &self.weather)
            .field("providers", &self.providers)
            .field("peers", &self.peers)
            .finish()
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

impl std::fmt::Debug for SearchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &redact(&self.api_key))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum Thinking → Acting rounds before the loop gives up
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Wall-clock budget for the whole loop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_budget_secs: Option<u64>,

    /// The fixed system instruction seeded at Init
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_max_iterations() -> u32 {
    10
}
fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.into()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            time_budget_secs: None,
            system_prompt: default_system_prompt(),
        }
    }
}

impl AgentConfig {
    pub fn time_budget(&self) -> Option<Duration> {
        self.time_budget_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// How long a peer may take to answer the handshake
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_secs: u64,

    /// How long a single tool call may take
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Grace period per termination step (EOF, then SIGTERM, then SIGKILL)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_discovery_timeout() -> u64 {
    10
}
fn default_call_timeout() -> u64 {
    60
}
fn default_shutdown_grace() -> u64 {
    3
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_secs: default_discovery_timeout(),
            call_timeout_secs: default_call_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl SupervisorConfig {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_url")]
    pub api_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_search_timeout")]
    pub timeout_secs: u64,
}

fn default_search_url() -> String {
    "https://api.tavily.com/search".into()
}
fn default_search_timeout() -> u64 {
    30
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_url: default_search_url(),
            api_key: None,
            timeout_secs: default_search_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    /// Simulated lookup latency
    #[serde(default = "default_weather_delay")]
    pub delay_ms: u64,
}

fn default_weather_delay() -> u64 {
    1000
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_weather_delay(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

/// How the orchestrator talks to a peer. Only stdio pipes are supported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Stdio,
}

/// One tool-provider subprocess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Unique key for this peer
    pub name: String,

    /// Program to launch
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub transport: Transport,

    /// Explicit variables set in the child. The child starts from an empty
    /// environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Parent variables copied into the child when present
    #[serde(default = "default_inherit_env")]
    pub inherit_env: Vec<String>,
}

fn default_inherit_env() -> Vec<String> {
    vec!["PATH".into(), "HOME".into()]
}

impl PeerConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            transport: Transport::Stdio,
            env: BTreeMap::new(),
            inherit_env: default_inherit_env(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn inheriting(mut self, names: &[&str]) -> Self {
        self.inherit_env = names.iter().map(|n| n.to_string()).collect();
        self
    }
}

/// Check a peer set before anything is launched.
pub fn validate_peers(peers: &[PeerConfig]) -> Result<(), ConfigError> {
    if peers.is_empty() {
        return Err(ConfigError::ValidationError("no peers configured".into()));
    }
    let mut seen = HashSet::new();
    for peer in peers {
        if peer.name.trim().is_empty() {
            return Err(ConfigError::ValidationError("peer name must not be empty".into()));
        }
        if peer.command.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "peer '{}' has an empty command",
                peer.name
            )));
        }
        if !seen.insert(peer.name.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "duplicate peer name '{}'",
                peer.name
            )));
        }
    }
    Ok(())
}

impl AppConfig {
    /// Load from `path`, then apply environment overrides and validate.
    ///
    /// Environment variables:
    /// - `TOOLMUX_API_KEY` (highest priority), `OPENAI_API_KEY`, `OPENROUTER_API_KEY`
    /// - `TOOLMUX_PROVIDER`, `TOOLMUX_MODEL`
    /// - `TAVILY_API_KEY` for the search peer
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.api_key.is_none() {
            self.api_key = lookup("TOOLMUX_API_KEY")
                .or_else(|| lookup("OPENAI_API_KEY"))
                .or_else(|| lookup("OPENROUTER_API_KEY"));
        }

        if let Some(provider) = lookup("TOOLMUX_PROVIDER") {
            self.default_provider = provider;
        }

        if let Some(model) = lookup("TOOLMUX_MODEL") {
            self.default_model = model;
        }

        if self.search.api_key.is_none() {
            self.search.api_key = lookup(SEARCH_API_KEY_ENV).filter(|k| !k.trim().is_empty());
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".toolmux")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }

        if self.agent.time_budget_secs == Some(0) {
            return Err(ConfigError::ValidationError(
                "agent.time_budget_secs must be > 0".into(),
            ));
        }

        if self.search.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "search.timeout_secs must be > 0".into(),
            ));
        }

        let s = &self.supervisor;
        if s.discovery_timeout_secs == 0 || s.call_timeout_secs == 0 || s.shutdown_grace_secs == 0 {
            return Err(ConfigError::ValidationError(
                "supervisor timeouts must be > 0".into(),
            ));
        }

        if !self.peers.is_empty() {
            validate_peers(&self.peers)?;
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn has_search_key(&self) -> bool {
        self.search.api_key.is_some()
    }

    /// The peer set for a session.
    ///
    /// Configured peers win. Otherwise the builtin peers are launched from
    /// `exe` (this program) as `exe peer <kind>`; the search peer is only
    /// included when a search key is available.
    pub fn resolve_peers(&self, exe: &Path) -> Vec<PeerConfig> {
        if !self.peers.is_empty() {
            return self.peers.clone();
        }

        let exe = exe.to_string_lossy().into_owned();
        let builtin = |kind: &str| {
            PeerConfig::new(kind, exe.clone())
                .with_args(["peer", kind])
                .inheriting(BUILTIN_INHERITED_ENV)
        };

        let mut peers = vec![
            builtin("math"),
            builtin("weather").with_env("TOOLMUX_WEATHER_DELAY_MS", self.weather.delay_ms.to_string()),
        ];

        match &self.search.api_key {
            Some(key) => peers.push(
                builtin("search")
                    .with_env(SEARCH_API_KEY_ENV, key.clone())
                    .with_env(SEARCH_URL_ENV, self.search.api_url.clone())
                    .with_env(SEARCH_TIMEOUT_ENV, self.search.timeout_secs.to_string()),
            ),
            None => tracing::warn!(
                "{SEARCH_API_KEY_ENV} is not set; starting without the search peer"
            ),
        }

        peers
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            agent: AgentConfig::default(),
            supervisor: SupervisorConfig::default(),
            search: SearchConfig::default(),
            weather: WeatherConfig::default(),
            providers: HashMap::new(),
            peers: vec![],
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
