//! Runtime configuration
//!
//! `AppConfig` is read once from the environment (after `.env` is loaded).
//! `OrchestratorConfig` is the loop policy handed to every turn explicitly.

use crate::error::OrchestrationError;
use crate::llm::LlmProviderKind;
use crate::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Loop policy for one orchestration turn.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum planning rounds before synthesis is forced.
    pub max_rounds: u32,
    /// Timeout applied to each individual tool call.
    pub tool_timeout: Duration,
    /// Wall-clock budget for the whole turn.
    pub turn_budget: Duration,
    /// Calls beyond this in a single round are rejected as invalid.
    pub max_calls_per_round: usize,
    /// Tool payloads longer than this are truncated before the planner sees them.
    pub max_tool_output_chars: usize,
    /// Most recent messages handed to the planner; `None` keeps the whole history.
    pub history_window: Option<usize>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            tool_timeout: Duration::from_secs(120),
            turn_budget: Duration::from_secs(300),
            max_calls_per_round: 16,
            max_tool_output_chars: 50_000,
            history_window: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            max_rounds: parse_var("SPECTRA_MAX_ROUNDS")?.unwrap_or(defaults.max_rounds),
            tool_timeout: parse_var::<u64>("SPECTRA_TOOL_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.tool_timeout),
            turn_budget: parse_var::<u64>("SPECTRA_TURN_BUDGET_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.turn_budget),
            max_calls_per_round: parse_var("SPECTRA_MAX_CALLS_PER_ROUND")?
                .unwrap_or(defaults.max_calls_per_round),
            max_tool_output_chars: parse_var("SPECTRA_MAX_TOOL_OUTPUT_CHARS")?
                .unwrap_or(defaults.max_tool_output_chars),
            history_window: parse_var("SPECTRA_HISTORY_WINDOW")?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_rounds == 0 {
            return Err(OrchestrationError::ConfigError(
                "max_rounds must be at least 1".to_string(),
            ));
        }
        if self.max_calls_per_round == 0 {
            return Err(OrchestrationError::ConfigError(
                "max_calls_per_round must be at least 1".to_string(),
            ));
        }
        if self.tool_timeout.is_zero() || self.turn_budget.is_zero() {
            return Err(OrchestrationError::ConfigError(
                "timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Process-level settings for the binaries.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mcp_server_url: String,
    pub llm_provider: LlmProviderKind,
    pub llm_api_key: String,
    pub llm_model: String,
    pub port: u16,
    pub database_url: Option<String>,
    pub orchestrator: OrchestratorConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let llm_provider = match env::var("LLM_PROVIDER") {
            Ok(value) => value.parse()?,
            Err(_) => LlmProviderKind::OpenAi,
        };

        let llm_api_key = env::var("LLM_API_KEY")
            .or_else(|_| env::var(llm_provider.key_env_var()))
            .unwrap_or_default();

        let llm_model = env::var("LLM_MODEL")
            .unwrap_or_else(|_| llm_provider.default_model().to_string());

        let port = env::var("PORT")
            .or_else(|_| env::var("API_PORT"))
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()
            .map_err(|e| OrchestrationError::ConfigError(format!("invalid PORT: {}", e)))?;

        let database_url = env::var("DATABASE_URL")
            .or_else(|_| env::var("POSTGRES_URL"))
            .ok()
            .filter(|url| !url.trim().is_empty());

        let orchestrator = OrchestratorConfig::from_env()?;
        orchestrator.validate()?;

        Ok(Self {
            mcp_server_url: env::var("MCP_SERVER_URL")
                .unwrap_or_else(|_| "http://localhost:10000".to_string()),
            llm_provider,
            llm_api_key,
            llm_model,
            port,
            database_url,
            orchestrator,
        })
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| OrchestrationError::ConfigError(format!("invalid {}: {}", name, e))),
        _ => Ok(None),
    }
}
