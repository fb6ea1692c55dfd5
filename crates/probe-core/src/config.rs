//! Configuration parsing for the exploration agent.
//!
//! `key=value` lines, `#` comments, optional quotes around values.
//! Precedence: CLI flags and environment > `--config` file > defaults.

use crate::types::ReselectPolicy;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Lines of a compile-error banner some MUD drivers print on every command.
pub const COMPILER_WARNING_NOISE: &str = r".*编译时段错误.*line \d+: Warning: Unu.*";
/// Leftovers of telnet option negotiation rendered as text.
pub const TELNET_GARBAGE_NOISE: &str = r".*VF\*Z.*";

/// Agent configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Target service
    pub target_host: String,
    pub target_port: u16,
    pub read_timeout_ms: u64,
    pub reconnect_delay_sec: u64,

    // Scheduling
    /// Interaction history entries kept in memory and shown to the oracle.
    pub max_history: usize,
    /// Cycles a task may spend `in_progress` before it is declared stuck.
    pub max_task_attempts: u32,
    pub reselect_attempts: ReselectPolicy,
    /// Pause after every send.
    pub act_pacing_ms: u64,

    // Knowledge
    pub knowledge_dir: PathBuf,
    /// Fact-review cycles between full rewrites of the phase's list.
    pub consolidation_interval: u32,
    pub join_timeout_sec: u64,
    /// Most recent entries included in oracle prompts.
    pub knowledge_prompt_limit: usize,

    // Journal
    pub journal_enabled: bool,
    pub journal_path: PathBuf,

    // Oracle
    pub oracle_base_url: String,
    pub oracle_model: String,
    pub oracle_reasoner_model: String,
    pub oracle_timeout_sec: u64,
    pub oracle_initial_backoff_ms: u64,
    pub oracle_max_backoff_ms: u64,
    pub api_key_file: Option<PathBuf>,

    // Output cleanup
    /// Regexes; a cleaned line matching any of them is dropped.
    pub noise_patterns: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_host: "127.0.0.1".to_string(),
            target_port: 4000,
            read_timeout_ms: 5000,
            reconnect_delay_sec: 5,
            max_history: 50,
            max_task_attempts: 50,
            reselect_attempts: ReselectPolicy::Preserve,
            act_pacing_ms: 1000,
            knowledge_dir: PathBuf::from("knowledge_bases"),
            consolidation_interval: 20,
            join_timeout_sec: 120,
            knowledge_prompt_limit: 30,
            journal_enabled: true,
            journal_path: dirs::data_local_dir().map_or_else(
                || PathBuf::from("probed/journal.db"),
                |d| d.join("probed/journal.db"),
            ),
            oracle_base_url: "https://api.deepseek.com".to_string(),
            oracle_model: "deepseek-chat".to_string(),
            oracle_reasoner_model: "deepseek-reasoner".to_string(),
            oracle_timeout_sec: 600,
            oracle_initial_backoff_ms: 2000,
            oracle_max_backoff_ms: 60_000,
            api_key_file: None,
            noise_patterns: vec![
                COMPILER_WARNING_NOISE.to_string(),
                TELNET_GARBAGE_NOISE.to_string(),
            ],
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());
            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "target_host" => self.target_host = value.to_string(),
            "target_port" => self.target_port = Self::parse_int(key, value)?,
            "read_timeout_ms" => self.read_timeout_ms = Self::parse_int(key, value)?,
            "reconnect_delay_sec" => self.reconnect_delay_sec = Self::parse_int(key, value)?,
            "max_history" => self.max_history = Self::parse_int(key, value)?,
            "max_task_attempts" => self.max_task_attempts = Self::parse_int(key, value)?,
            "reselect_attempts" => {
                self.reselect_attempts = match value {
                    "preserve" => ReselectPolicy::Preserve,
                    "reset" => ReselectPolicy::Reset,
                    _ => {
                        return Err(ConfigError::InvalidValue {
                            key: key.to_string(),
                            reason: format!("must be 'preserve' or 'reset', got '{value}'"),
                        })
                    }
                }
            }
            "act_pacing_ms" => self.act_pacing_ms = Self::parse_int(key, value)?,
            "knowledge_dir" => self.knowledge_dir = PathBuf::from(value),
            "consolidation_interval" => self.consolidation_interval = Self::parse_int(key, value)?,
            "join_timeout_sec" => self.join_timeout_sec = Self::parse_int(key, value)?,
            "knowledge_prompt_limit" => self.knowledge_prompt_limit = Self::parse_int(key, value)?,
            "journal_enabled" => self.journal_enabled = Self::parse_bool(key, value)?,
            "journal_path" => self.journal_path = PathBuf::from(value),
            "oracle_base_url" => self.oracle_base_url = value.trim_end_matches('/').to_string(),
            "oracle_model" => self.oracle_model = value.to_string(),
            "oracle_reasoner_model" => self.oracle_reasoner_model = value.to_string(),
            "oracle_timeout_sec" => self.oracle_timeout_sec = Self::parse_int(key, value)?,
            "oracle_initial_backoff_ms" => {
                self.oracle_initial_backoff_ms = Self::parse_int(key, value)?;
            }
            "oracle_max_backoff_ms" => self.oracle_max_backoff_ms = Self::parse_int(key, value)?,
            "api_key_file" => {
                self.api_key_file = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "noise_patterns" => self.noise_patterns = split_patterns(value),
            _ => {
                warn!(key, "unknown config key");
            }
        }
        Ok(())
    }

    fn parse_int<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_history", self.max_history as u64),
            ("max_task_attempts", u64::from(self.max_task_attempts)),
            ("consolidation_interval", u64::from(self.consolidation_interval)),
            ("read_timeout_ms", self.read_timeout_ms),
            ("join_timeout_sec", self.join_timeout_sec),
            ("oracle_initial_backoff_ms", self.oracle_initial_backoff_ms),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.oracle_max_backoff_ms < self.oracle_initial_backoff_ms {
            return Err(ConfigError::InvalidValue {
                key: "oracle_max_backoff_ms".to_string(),
                reason: "must not be below oracle_initial_backoff_ms".to_string(),
            });
        }
        Ok(())
    }

    /// Resolve relative paths against a base directory.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.knowledge_dir.is_relative() {
            self.knowledge_dir = base.join(&self.knowledge_dir);
        }
        if self.journal_path.is_relative() {
            self.journal_path = base.join(&self.journal_path);
        }
        if let Some(ref key_file) = self.api_key_file {
            if key_file.is_relative() {
                self.api_key_file = Some(base.join(key_file));
            }
        }
    }

    /// `host:port` of the target service.
    pub fn target(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }
}

/// Split a `|`-separated pattern list. `\|` stays inside a pattern.
fn split_patterns(value: &str) -> Vec<String> {
    let mut patterns = Vec::new();
    let mut current = String::new();
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'|') => {
                current.push('\\');
                current.push('|');
                chars.next();
            }
            '|' => patterns.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    patterns.push(current);
    patterns
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}
