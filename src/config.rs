//! Configuration types, read from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};
use crate::moderation::{PolicyThresholds, ProcessorConfig};

const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";

/// Where photos and the audit trail are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    File(PathBuf),
    Memory,
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub database: DatabaseLocation,
    /// Bearer token for reviewer endpoints.
    pub admin_token: SecretString,
    /// Daily rolling log files go here when set.
    pub log_dir: Option<PathBuf>,
    pub llm: LlmConfig,
    pub processor: ProcessorConfig,
    /// Local image references are resolved under this directory.
    pub upload_dir: PathBuf,
    pub max_image_bytes: u64,
    /// How often pending photos are picked up.
    pub sweep_interval: Duration,
    /// Photos analysed per sweep.
    pub sweep_batch_size: usize,
    /// Photos stuck in `analyzing` longer than this are reset.
    pub stale_analysis_after: Duration,
    pub analyze_on_submit: bool,
    /// Image hosts whose photos are rejected without analysis.
    pub blocked_hosts: Vec<String>,
}

impl ServiceConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let host: std::net::IpAddr = parse_or(&var, "OPEN_DRAFT_HOST", [0, 0, 0, 0].into())?;
        let port: u16 = parse_or(&var, "OPEN_DRAFT_PORT", 8080)?;

        let database = match var("OPEN_DRAFT_DB_PATH").as_deref() {
            Some(":memory:") => DatabaseLocation::Memory,
            Some(path) => DatabaseLocation::File(PathBuf::from(path)),
            None => DatabaseLocation::File(PathBuf::from("./data/moderation.db")),
        };

        let admin_token = var("OPEN_DRAFT_ADMIN_TOKEN")
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingEnvVar("OPEN_DRAFT_ADMIN_TOKEN".into()))?;

        let backend: LlmBackend = parse_or(&var, "OPEN_DRAFT_LLM_BACKEND", LlmBackend::Anthropic)?;
        let (key_var, default_model) = match backend {
            LlmBackend::Anthropic => ("ANTHROPIC_API_KEY", DEFAULT_ANTHROPIC_MODEL),
            LlmBackend::OpenAi => ("OPENAI_API_KEY", DEFAULT_OPENAI_MODEL),
        };
        let api_key = var(key_var)
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingEnvVar(key_var.into()))?;

        let llm = LlmConfig {
            backend,
            api_key,
            model: var("OPEN_DRAFT_MODEL").unwrap_or_else(|| default_model.to_string()),
            base_url: var("OPEN_DRAFT_LLM_BASE_URL"),
            request_timeout: Duration::from_secs(parse_or(
                &var,
                "OPEN_DRAFT_LLM_TIMEOUT_SECS",
                60,
            )?),
            max_attempts: parse_or(&var, "OPEN_DRAFT_LLM_MAX_ATTEMPTS", 3)?,
            retry_base_delay: Duration::from_millis(parse_or(
                &var,
                "OPEN_DRAFT_LLM_RETRY_DELAY_MS",
                500,
            )?),
        };

        let defaults = PolicyThresholds::default();
        let thresholds = PolicyThresholds {
            auto_approve: parse_or(
                &var,
                "OPEN_DRAFT_AUTO_APPROVE_THRESHOLD",
                defaults.auto_approve,
            )?,
            auto_reject: parse_or(&var, "OPEN_DRAFT_AUTO_REJECT_THRESHOLD", defaults.auto_reject)?,
            human_review: parse_or(
                &var,
                "OPEN_DRAFT_HUMAN_REVIEW_THRESHOLD",
                defaults.human_review,
            )?,
            approve_min_confidence: parse_or(
                &var,
                "OPEN_DRAFT_APPROVE_MIN_CONFIDENCE",
                defaults.approve_min_confidence,
            )?,
            review_min_confidence: parse_or(
                &var,
                "OPEN_DRAFT_REVIEW_MIN_CONFIDENCE",
                defaults.review_min_confidence,
            )?,
        };
        thresholds.validate()?;

        let processor = ProcessorConfig {
            thresholds,
            max_analysis_attempts: positive_or(&var, "OPEN_DRAFT_MAX_ANALYSIS_ATTEMPTS", 3)?,
            analysis_concurrency: positive_or(&var, "OPEN_DRAFT_ANALYSIS_CONCURRENCY", 4)?,
        };

        let blocked_hosts = var("OPEN_DRAFT_BLOCKED_HOSTS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            bind_addr: SocketAddr::new(host, port),
            database,
            admin_token,
            log_dir: var("OPEN_DRAFT_LOG_DIR").map(PathBuf::from),
            llm,
            processor,
            upload_dir: var("OPEN_DRAFT_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./uploads")),
            max_image_bytes: parse_or(&var, "OPEN_DRAFT_MAX_IMAGE_BYTES", 10 * 1024 * 1024)?,
            sweep_interval: Duration::from_secs(positive_or(
                &var,
                "OPEN_DRAFT_SWEEP_INTERVAL_SECS",
                30,
            )?),
            sweep_batch_size: positive_or(&var, "OPEN_DRAFT_SWEEP_BATCH_SIZE", 20)?,
            stale_analysis_after: Duration::from_secs(positive_or(
                &var,
                "OPEN_DRAFT_STALE_ANALYSIS_SECS",
                600,
            )?),
            analyze_on_submit: parse_or(&var, "OPEN_DRAFT_ANALYZE_ON_SUBMIT", true)?,
            blocked_hosts,
        })
    }
}

/// Parse `key` if set, otherwise return `default`.
fn parse_or<T>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.into(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Like `parse_or`, but zero is rejected.
fn positive_or<T>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let value = parse_or(var, key, default)?;
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            key: key.into(),
            message: "must be greater than zero".into(),
        })
    }
}
