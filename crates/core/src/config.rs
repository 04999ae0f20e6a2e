use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use cron::Schedule;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::CoreError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_opt(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key = %key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

// ── Interval settings ─────────────────────────────────────────

/// Normalize a 5-field cron expression to 6-field by prepending "0 " for seconds.
pub fn normalize_cron(expr: &str) -> String {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// Parse a human-readable duration: plain seconds (`"90"`) or unit
/// components (`"2h30m"`, `"1d12h"`, `"45s"`).
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total_secs: u64 = 0;
    let mut num_buf = String::new();
    for ch in s.chars() {
        if ch.is_ascii_digit() {
            num_buf.push(ch);
            continue;
        }
        let n: u64 = num_buf.parse().ok()?;
        num_buf.clear();
        total_secs += match ch {
            'd' => n * 86_400,
            'h' => n * 3_600,
            'm' => n * 60,
            's' => n,
            _ => return None,
        };
    }
    // trailing digits after a unit ("30m15") are ambiguous
    if !num_buf.is_empty() {
        return None;
    }
    Some(Duration::from_secs(total_secs))
}

/// How often resources are re-evaluated: per resource on a fixed period, or
/// globally on a cron schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawInterval", into = "RawInterval")]
pub enum IntervalSetting {
    Disabled,
    Every(Duration),
    /// Normalized 6-field cron expression.
    Cron(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawInterval {
    Seconds(u64),
    Text(String),
}

impl IntervalSetting {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        if let Some(period) = parse_duration(raw) {
            return Ok(Self::from_period(period));
        }
        let normalized = normalize_cron(raw);
        Schedule::from_str(&normalized)
            .map_err(|e| CoreError::Config(format!("invalid interval '{raw}': {e}")))?;
        Ok(Self::Cron(normalized))
    }

    fn from_period(period: Duration) -> Self {
        if period.is_zero() {
            Self::Disabled
        } else {
            Self::Every(period)
        }
    }

    /// The per-resource period, if this setting is one.
    pub fn period(&self) -> Option<Duration> {
        match self {
            Self::Every(period) => Some(*period),
            _ => None,
        }
    }

    pub fn cron_schedule(&self) -> Option<Schedule> {
        match self {
            Self::Cron(expr) => Schedule::from_str(expr).ok(),
            _ => None,
        }
    }
}

impl TryFrom<RawInterval> for IntervalSetting {
    type Error = CoreError;

    fn try_from(raw: RawInterval) -> Result<Self, Self::Error> {
        match raw {
            RawInterval::Seconds(secs) => Ok(Self::from_period(Duration::from_secs(secs))),
            RawInterval::Text(text) => Self::parse(&text),
        }
    }
}

impl From<IntervalSetting> for RawInterval {
    fn from(setting: IntervalSetting) -> Self {
        match setting {
            IntervalSetting::Disabled => RawInterval::Seconds(0),
            IntervalSetting::Every(period) => RawInterval::Seconds(period.as_secs()),
            IntervalSetting::Cron(expr) => RawInterval::Text(expr),
        }
    }
}

impl fmt::Display for IntervalSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Every(period) => write!(f, "every {}s", period.as_secs()),
            Self::Cron(expr) => write!(f, "cron '{expr}'"),
        }
    }
}

// ── Agent config ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorMode {
    /// Deploy code runs in child processes speaking the framed transport.
    Process,
    /// Deploy code runs inside the agent process.
    InProcess,
}

/// Settings of the deployment engine for one environment, typically parsed from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "Uuid::new_v4")]
    pub environment: Uuid,
    #[serde(default = "default_deploy_interval")]
    pub deploy_interval: IntervalSetting,
    #[serde(default = "default_repair_interval")]
    pub repair_interval: IntervalSetting,
    /// Live executors per agent.
    #[serde(default = "default_executor_cap")]
    pub executor_cap: usize,
    /// Idle seconds before an executor is stopped.
    #[serde(default = "default_executor_retention")]
    pub executor_retention_time: u64,
    /// Idle seconds before an unused package environment is removed.
    #[serde(default = "default_venv_retention")]
    pub executor_venv_retention_time: u64,
    /// Timeout in seconds for a single executor call.
    #[serde(default = "default_rpc_timeout")]
    pub executor_rpc_timeout: u64,
    /// Seconds a stopping executor process gets before it is killed.
    #[serde(default = "default_grace_time")]
    pub process_grace_time: u64,
    #[serde(default = "default_executor_mode")]
    pub executor_mode: ExecutorMode,
    #[serde(default = "default_executor_binary")]
    pub executor_binary: PathBuf,
    #[serde(default = "default_venv_dir")]
    pub venv_dir: PathBuf,
    #[serde(default)]
    pub paused_agents: Vec<String>,
}

fn default_deploy_interval() -> IntervalSetting { IntervalSetting::Every(Duration::from_secs(600)) }
fn default_repair_interval() -> IntervalSetting { IntervalSetting::Every(Duration::from_secs(86_400)) }
fn default_executor_cap() -> usize { 3 }
fn default_executor_retention() -> u64 { 60 }
fn default_venv_retention() -> u64 { 3_600 }
fn default_rpc_timeout() -> u64 { 300 }
fn default_grace_time() -> u64 { 5 }
fn default_executor_mode() -> ExecutorMode { ExecutorMode::Process }
fn default_executor_binary() -> PathBuf { PathBuf::from("converge-executor") }
fn default_venv_dir() -> PathBuf { env::temp_dir().join("converge").join("envs") }

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            environment: Uuid::new_v4(),
            deploy_interval: default_deploy_interval(),
            repair_interval: default_repair_interval(),
            executor_cap: default_executor_cap(),
            executor_retention_time: default_executor_retention(),
            executor_venv_retention_time: default_venv_retention(),
            executor_rpc_timeout: default_rpc_timeout(),
            process_grace_time: default_grace_time(),
            executor_mode: default_executor_mode(),
            executor_binary: default_executor_binary(),
            venv_dir: default_venv_dir(),
            paused_agents: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Parse config from a TOML string, then apply `CONVERGE_*` overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, CoreError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(env_id) = env_parse("CONVERGE_ENVIRONMENT") {
            self.environment = env_id;
        }
        for (key, target) in [
            ("CONVERGE_DEPLOY_INTERVAL", &mut self.deploy_interval),
            ("CONVERGE_REPAIR_INTERVAL", &mut self.repair_interval),
        ] {
            if let Some(raw) = env_opt(key) {
                match IntervalSetting::parse(&raw) {
                    Ok(setting) => *target = setting,
                    Err(e) => warn!(key = %key, error = %e, "ignoring invalid interval override"),
                }
            }
        }
        if let Some(cap) = env_parse("CONVERGE_EXECUTOR_CAP") {
            self.executor_cap = cap;
        }
        if let Some(secs) = env_parse("CONVERGE_EXECUTOR_RETENTION_TIME") {
            self.executor_retention_time = secs;
        }
        if let Some(secs) = env_parse("CONVERGE_EXECUTOR_VENV_RETENTION_TIME") {
            self.executor_venv_retention_time = secs;
        }
        if let Some(mode) = env_opt("CONVERGE_EXECUTOR_MODE") {
            match mode.as_str() {
                "process" => self.executor_mode = ExecutorMode::Process,
                "in_process" => self.executor_mode = ExecutorMode::InProcess,
                other => warn!(value = %other, "ignoring unknown executor mode override"),
            }
        }
        if let Some(path) = env_opt("CONVERGE_EXECUTOR_BINARY") {
            self.executor_binary = PathBuf::from(path);
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.executor_cap == 0 {
            return Err(CoreError::Config("executor_cap must be at least 1".into()));
        }
        if self.executor_rpc_timeout == 0 {
            return Err(CoreError::Config("executor_rpc_timeout must be positive".into()));
        }
        for name in &self.paused_agents {
            if name.trim().is_empty() {
                return Err(CoreError::Config("paused_agents contains an empty name".into()));
            }
        }
        Ok(())
    }

    pub fn executor_retention(&self) -> Duration {
        Duration::from_secs(self.executor_retention_time)
    }

    pub fn venv_retention(&self) -> Duration {
        Duration::from_secs(self.executor_venv_retention_time)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.executor_rpc_timeout)
    }

    pub fn grace_time(&self) -> Duration {
        Duration::from_secs(self.process_grace_time)
    }
}
