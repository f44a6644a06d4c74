pub mod merge;
pub mod schema;

pub use schema::*;

use crate::agent::{AgentSettings, SubAgentConfig};
use crate::cli::Cli;
use crate::context::Compactor;
use crate::error::ConfigError;
use crate::provider::{ProviderSettings, RetryPolicy};
use crate::tasks::RetryDefaults;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "tasker.toml";

/// Load configuration by merging global, workspace, and CLI sources.
/// Precedence: CLI > workspace config > global config > defaults.
///
/// Missing config files are handled gracefully (defaults apply).
pub fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let common = cli.command.common();

    // Layer 1: Global config (~/.config/tasker/tasker.toml or platform equivalent)
    let global = load_global_config();

    // Workspace path decides where the workspace config lives.
    let workspace_path = common
        .workspace
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));

    // Layer 2: Workspace config, or the explicit --config file in its place
    let workspace_file = common
        .config
        .clone()
        .unwrap_or_else(|| workspace_path.join(CONFIG_FILE_NAME));
    let workspace = load_toml_file(&workspace_file).unwrap_or_default();

    // Layer 3: CLI args
    let cli_partial = PartialConfig {
        model: common.model.clone(),
        workspace: common.workspace.clone(),
        shell_timeout_secs: common.timeout,
        ..Default::default()
    };

    let config = cli_partial
        .with_fallback(workspace)
        .with_fallback(global)
        .finalize();

    Ok(config)
}

/// Load global config from the platform-specific config directory.
/// Returns empty PartialConfig if file not found.
fn load_global_config() -> PartialConfig {
    match global_config_dir() {
        Some(dir) => load_toml_file(&dir.join(CONFIG_FILE_NAME)).unwrap_or_default(),
        None => {
            tracing::debug!("Could not determine global config directory");
            PartialConfig::default()
        }
    }
}

/// Load and parse a TOML config file into a PartialConfig.
/// Returns None on file-not-found; parse errors are logged and ignored.
fn load_toml_file(path: &Path) -> Option<PartialConfig> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            match toml::from_str::<ConfigFile>(&contents)
                .context(format!("Failed to parse {}", path.display()))
            {
                Ok(config_file) => {
                    tracing::info!("Loaded config from {}", path.display());
                    Some(config_file.to_partial())
                }
                Err(e) => {
                    tracing::warn!("Config parse error: {:#}", e);
                    None
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config file at {}, using defaults", path.display());
            None
        }
        Err(e) => {
            tracing::warn!("Failed to read config at {}: {}", path.display(), e);
            None
        }
    }
}

/// Platform-specific config directory.
/// Linux: ~/.config/tasker
/// macOS: ~/Library/Application Support/tasker
pub fn global_config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "tasker").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Platform-specific data directory, used for saved sessions.
pub fn data_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "tasker").map(|dirs| dirs.data_dir().to_path_buf())
}

impl AppConfig {
    /// Provider settings with the API key read from `api_key_env`.
    pub fn provider_settings(&self) -> Result<ProviderSettings, ConfigError> {
        let api_key = std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingApiKey {
                var: self.api_key_env.clone(),
            })?;

        Ok(ProviderSettings {
            base_url: self.base_url.clone(),
            api_key,
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                base_delay: Duration::from_millis(self.retry_base_ms),
                max_delay: Duration::from_millis(self.retry_max_ms),
            },
        })
    }

    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            max_iterations: self.max_iterations,
            compaction_threshold: self.compaction_threshold,
            compactor: Compactor::new(self.preserve_recent),
        }
    }

    pub fn sub_agent_config(&self) -> SubAgentConfig {
        SubAgentConfig {
            max_iterations: self.sub_agent_max_iterations,
            timeout: Duration::from_secs(self.sub_agent_timeout_secs),
            ..SubAgentConfig::default()
        }
    }

    pub fn retry_defaults(&self) -> RetryDefaults {
        RetryDefaults {
            max_retries: self.task_max_retries,
            retry_delay: Duration::from_millis(self.task_retry_delay_ms),
        }
    }
}
