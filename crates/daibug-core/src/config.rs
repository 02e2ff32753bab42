use crate::error::CoreError;
use crate::event::{Level, Source};
use crate::glob::GlobMatcher;
use crate::watch::WatchConditions;
use serde::{Deserialize, Serialize};

pub const DEFAULT_HTTP_PORT: u16 = 5000;
pub const DEFAULT_WS_PORT: u16 = 4999;
pub const DEFAULT_MAX_BODY_SIZE: u64 = 51_200;

const CONSOLE_LEVELS: [&str; 4] = ["log", "debug", "warn", "error"];

/// Active configuration. Every section has defaults so a missing or empty
/// document yields a working hub.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub console: ConsoleConfig,
    pub network: NetworkConfig,
    pub watch: Vec<WatchRuleSpec>,
    pub redact: RedactConfig,
    pub hub: HubConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub include: Vec<String>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            include: vec!["error".into(), "warn".into(), "log".into()],
        }
    }
}

impl ConsoleConfig {
    /// Expand aliases and drop unknown names, preserving first-seen order.
    pub fn normalized_include(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for entry in &self.include {
            for level in expand_console_alias(entry) {
                if !out.contains(&level) {
                    out.push(level);
                }
            }
        }
        out
    }
}

/// Expand one console level name or alias into concrete levels. Unknown
/// names expand to nothing.
pub fn expand_console_alias(name: &str) -> Vec<String> {
    match name {
        "all" | "verbose" => CONSOLE_LEVELS.iter().map(|s| s.to_string()).collect(),
        "errors" => vec!["error".into()],
        "errors-and-warnings" => vec!["error".into(), "warn".into()],
        level if CONSOLE_LEVELS.contains(&level) => vec![level.to_string()],
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkConfig {
    pub capture_body: bool,
    pub max_body_size: u64,
    pub ignore: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            capture_body: true,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            ignore: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RedactConfig {
    pub fields: Vec<String>,
    pub url_patterns: Vec<String>,
}

impl Default for RedactConfig {
    fn default() -> Self {
        Self {
            fields: vec![
                "password".into(),
                "token".into(),
                "authorization".into(),
                "cookie".into(),
            ],
            url_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HubConfig {
    pub http_port: u16,
    pub ws_port: u16,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            ws_port: DEFAULT_WS_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    pub auto_start: bool,
    pub capture_storage: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_start: false,
            capture_storage: true,
        }
    }
}

/// Declarative watch rule as written in config.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WatchRuleSpec {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_codes: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub levels: Option<Vec<Level>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_contains: Option<String>,
}

impl WatchRuleSpec {
    pub fn conditions(&self) -> WatchConditions {
        WatchConditions {
            status_codes: self.status_codes.clone(),
            url_pattern: self.url_pattern.clone(),
            methods: self.methods.clone(),
            levels: self.levels.clone(),
            message_contains: self.message_contains.clone(),
            payload_contains: None,
        }
    }
}

impl Config {
    pub fn from_json(text: &str) -> Result<Self, CoreError> {
        serde_json::from_str(text).map_err(|err| CoreError::InvalidFormat(err.to_string()))
    }

    /// Collect every validation error; an empty list means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.hub.http_port == 0 {
            errors.push("hub.httpPort must be between 1 and 65535".to_string());
        }
        if self.hub.ws_port == 0 {
            errors.push("hub.wsPort must be between 1 and 65535".to_string());
        }
        if self.hub.http_port != 0 && self.hub.http_port == self.hub.ws_port {
            errors.push("hub.httpPort and hub.wsPort must differ".to_string());
        }
        for (index, rule) in self.watch.iter().enumerate() {
            if rule.label.trim().is_empty() {
                errors.push(format!("watch[{index}]: label must not be empty"));
            }
            if rule.conditions().is_empty() {
                errors.push(format!(
                    "watch[{index}] ({}): at least one condition is required",
                    rule.label
                ));
            }
            if let Some(pattern) = &rule.url_pattern {
                if let Err(err) = GlobMatcher::new(pattern) {
                    errors.push(format!("watch[{index}] ({}): {err}", rule.label));
                }
            }
        }
        for pattern in &self.redact.url_patterns {
            if let Err(err) = GlobMatcher::new(pattern) {
                errors.push(format!("redact.urlPatterns: {err}"));
            }
        }
        for pattern in &self.network.ignore {
            if let Err(err) = GlobMatcher::new(pattern) {
                errors.push(format!("network.ignore: {err}"));
            }
        }
        errors
    }
}
