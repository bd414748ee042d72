use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::relay::{CoordinatorConfig, SweepPolicy};
use crate::upstream::model::ModelSettings;

pub const DEFAULT_PORT: u16 = 1011;

const DEFAULT_CALLBACK_PREFIXES: [&str; 2] = ["https://imtwo.zdxlz.com/", "https://im.zdxlz.com/"];

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub relay: CoordinatorConfig,
    pub model: ModelSettings,
    pub admin: Option<AdminCredentials>,
    pub group_config_file: PathBuf,
    pub notify_timeout: Duration,
    pub log_file: Option<String>,
    pub rotation: RotationConfig,
    pub log_stdout: bool,
    pub max_request_bytes: Option<usize>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            relay: CoordinatorConfig::default(),
            model: ModelSettings::default(),
            admin: None,
            group_config_file: PathBuf::from("./group_configs.json"),
            notify_timeout: Duration::from_secs(10),
            log_file: None,
            rotation: RotationConfig {
                max_bytes: None,
                keep: 1,
                compress: false,
            },
            log_stdout: false,
            max_request_bytes: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = CoordinatorConfig::default();

        let allowed_callback_prefixes = env::var("CALLBACK_ALLOWED_PREFIXES")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
            })
            .filter(|list: &Vec<String>| !list.is_empty())
            .unwrap_or_else(|| DEFAULT_CALLBACK_PREFIXES.iter().map(|s| s.to_string()).collect());

        let session_timeout = secs_or("SESSION_TIMEOUT_SECS", defaults.session_timeout)?;
        let max_wait = secs_or("MAX_WAIT_SECS", defaults.max_wait)?;
        let grace = secs_or("STALE_GRACE_SECS", Duration::from_secs(30))?;
        let min_interval = parse_optional_u64("RATE_LIMIT_MIN_INTERVAL_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.min_interval);

        let sweep = SweepPolicy {
            session_threshold: usize_or("SESSION_SWEEP_THRESHOLD", defaults.sweep.session_threshold)?,
            active_threshold: usize_or("ACTIVE_SWEEP_THRESHOLD", defaults.sweep.active_threshold)?,
            rate_threshold: usize_or("RATE_SWEEP_THRESHOLD", defaults.sweep.rate_threshold)?,
            session_timeout,
            stale_after: max_wait + grace,
            rate_expire: secs_or("RATE_LIMIT_EXPIRE_SECS", defaults.sweep.rate_expire)?,
        };

        let relay = CoordinatorConfig {
            allowed_callback_prefixes,
            min_interval,
            session_timeout,
            max_wait,
            history_limit: usize_or("HISTORY_LIMIT", defaults.history_limit)?,
            reasoning_workers: usize_or("REASONING_WORKERS", defaults.reasoning_workers)?.max(1),
            sweep,
        };

        let model_defaults = ModelSettings::default();
        let model = ModelSettings {
            base_url: non_empty_var("MODEL_BASE_URL").unwrap_or(model_defaults.base_url),
            api_key: non_empty_var("DASHSCOPE_API_KEY"),
            timeout: secs_or("MODEL_TIMEOUT_SECS", model_defaults.timeout)?,
        };

        let admin = match (non_empty_var("APP_USERNAME"), non_empty_var("APP_PASSWORD")) {
            (Some(username), Some(password)) => Some(AdminCredentials { username, password }),
            _ => None,
        };

        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
            keep: parse_optional_u64("LOG_ROTATE_KEEP")?.unwrap_or(1) as usize,
            compress: parse_bool_env("LOG_ROTATE_COMPRESS")?.unwrap_or(false),
        };

        let port = match parse_optional_u64("PORT")? {
            Some(raw) => u16::try_from(raw)
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| anyhow!("PORT must be between 1 and 65535"))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            port,
            relay,
            model,
            admin,
            group_config_file: non_empty_var("GROUP_CONFIG_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./group_configs.json")),
            notify_timeout: parse_optional_u64("NOTIFY_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_secs(10)),
            log_file: non_empty_var("LOG_FILE"),
            rotation,
            log_stdout: parse_bool_env("RELAY_LOG_STDOUT")?.unwrap_or(false),
            max_request_bytes: parse_optional_u64("MAX_REQUEST_BYTES")?.map(|v| v as usize),
        })
    }
}

/// Per-group model selection and prompt.  Every field falls back to the
/// default group's value when omitted from the JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    pub model: String,
    pub reasoning_model: String,
    pub system_prompt: String,
    pub use_knowledge_base: bool,
    pub knowledge_base_dir: Option<PathBuf>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            model: "qwen-plus-latest".to_string(),
            reasoning_model: "qwen-plus-latest".to_string(),
            system_prompt:
                "请简洁明了地回答问题，且不要使用Markdown等格式（如*、**等符号）来强调文本。"
                    .to_string(),
            use_knowledge_base: false,
            knowledge_base_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupConfigs {
    default: GroupConfig,
    groups: HashMap<String, GroupConfig>,
}

impl GroupConfigs {
    pub fn new(groups: HashMap<String, GroupConfig>) -> Self {
        Self {
            default: GroupConfig::default(),
            groups,
        }
    }

    /// Load the group map from a JSON file.  A missing or unreadable file is
    /// not fatal: the service runs with the default configuration only.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "group config file not found, using defaults");
            return Self::default();
        }
        match Self::read(path) {
            Ok(groups) => {
                tracing::info!(path = %path.display(), groups = groups.len(), "loaded group configs");
                Self::new(groups)
            }
            Err(err) => {
                tracing::error!(path = %path.display(), error = %format!("{err:#}"), "invalid group config file, using defaults");
                Self::default()
            }
        }
    }

    fn read(path: &Path) -> Result<HashMap<String, GroupConfig>> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read group config '{}'", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse group config '{}'", path.display()))
    }

    pub fn get(&self, group_id: &str) -> &GroupConfig {
        self.groups.get(group_id).unwrap_or(&self.default)
    }

    pub fn default_config(&self) -> &GroupConfig {
        &self.default
    }

    pub fn groups(&self) -> &HashMap<String, GroupConfig> {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn secs_or(var: &str, default: Duration) -> Result<Duration> {
    Ok(parse_optional_u64(var)?
        .map(Duration::from_secs)
        .unwrap_or(default))
}

fn usize_or(var: &str, default: usize) -> Result<usize> {
    Ok(parse_optional_u64(var)?
        .map(|v| v as usize)
        .unwrap_or(default))
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
