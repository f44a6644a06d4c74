use super::schema::{AppConfig, ConfigFile, PartialConfig};
use crate::tools::builtin::default_blocklist;
use crate::tools::permission::default_policies;
use std::path::PathBuf;

impl ConfigFile {
    /// Flatten the file's sections into a PartialConfig.
    pub fn to_partial(self) -> PartialConfig {
        let mut partial = PartialConfig::default();

        if let Some(p) = self.provider {
            partial.base_url = p.base_url;
            partial.model = p.model;
            partial.api_key_env = p.api_key_env;
            partial.max_retries = p.max_retries;
            partial.retry_base_ms = p.retry_base_ms;
            partial.retry_max_ms = p.retry_max_ms;
            partial.request_timeout_secs = p.request_timeout_secs;
            partial.temperature = p.temperature;
            partial.max_tokens = p.max_tokens;
        }
        if let Some(a) = self.agent {
            partial.max_iterations = a.max_iterations;
            partial.compaction_threshold = a.compaction_threshold;
            partial.preserve_recent = a.preserve_recent;
            partial.sub_agent_timeout_secs = a.sub_agent_timeout_secs;
            partial.sub_agent_max_iterations = a.sub_agent_max_iterations;
        }
        if let Some(t) = self.tasks {
            partial.max_concurrent = t.max_concurrent;
            partial.max_queue_size = t.max_queue_size;
            partial.task_max_retries = t.max_retries;
            partial.task_retry_delay_ms = t.retry_delay_ms;
        }
        if let Some(s) = self.safety {
            partial.shell_timeout_secs = s.shell_timeout_secs;
            partial.blocked_patterns = s
                .blocked_patterns
                .map(|entries| entries.into_iter().map(|e| (e.pattern, e.reason)).collect());
        }
        partial.permissions = self.permissions;
        partial
    }
}

impl PartialConfig {
    /// Merge self with a lower-priority fallback.
    /// Self's non-None values take precedence.
    /// For blocked_patterns: REPLACE semantics (if self has Some, use it entirely).
    /// For permissions: per-key merge, self's entries win.
    pub fn with_fallback(self, fallback: PartialConfig) -> PartialConfig {
        let permissions = match (self.permissions, fallback.permissions) {
            (Some(mine), Some(mut theirs)) => {
                theirs.extend(mine);
                Some(theirs)
            }
            (mine, theirs) => mine.or(theirs),
        };

        PartialConfig {
            workspace: self.workspace.or(fallback.workspace),
            base_url: self.base_url.or(fallback.base_url),
            model: self.model.or(fallback.model),
            api_key_env: self.api_key_env.or(fallback.api_key_env),
            max_retries: self.max_retries.or(fallback.max_retries),
            retry_base_ms: self.retry_base_ms.or(fallback.retry_base_ms),
            retry_max_ms: self.retry_max_ms.or(fallback.retry_max_ms),
            request_timeout_secs: self.request_timeout_secs.or(fallback.request_timeout_secs),
            temperature: self.temperature.or(fallback.temperature),
            max_tokens: self.max_tokens.or(fallback.max_tokens),
            max_iterations: self.max_iterations.or(fallback.max_iterations),
            compaction_threshold: self.compaction_threshold.or(fallback.compaction_threshold),
            preserve_recent: self.preserve_recent.or(fallback.preserve_recent),
            sub_agent_timeout_secs: self.sub_agent_timeout_secs.or(fallback.sub_agent_timeout_secs),
            sub_agent_max_iterations: self
                .sub_agent_max_iterations
                .or(fallback.sub_agent_max_iterations),
            max_concurrent: self.max_concurrent.or(fallback.max_concurrent),
            max_queue_size: self.max_queue_size.or(fallback.max_queue_size),
            task_max_retries: self.task_max_retries.or(fallback.task_max_retries),
            task_retry_delay_ms: self.task_retry_delay_ms.or(fallback.task_retry_delay_ms),
            shell_timeout_secs: self.shell_timeout_secs.or(fallback.shell_timeout_secs),
            blocked_patterns: self.blocked_patterns.or(fallback.blocked_patterns),
            permissions,
        }
    }

    /// Convert to AppConfig, filling any remaining gaps with defaults.
    pub fn finalize(self) -> AppConfig {
        let mut permissions = default_policies();
        permissions.extend(self.permissions.unwrap_or_default());

        AppConfig {
            workspace: self.workspace.unwrap_or_else(|| PathBuf::from(".")),
            base_url: self
                .base_url
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: self.model.unwrap_or_else(|| "gpt-4o-mini".to_string()),
            api_key_env: self
                .api_key_env
                .unwrap_or_else(|| "OPENAI_API_KEY".to_string()),
            max_retries: self.max_retries.unwrap_or(3),
            retry_base_ms: self.retry_base_ms.unwrap_or(1000),
            retry_max_ms: self.retry_max_ms.unwrap_or(30_000),
            request_timeout_secs: self.request_timeout_secs.unwrap_or(120),
            temperature: self.temperature.unwrap_or(0.7),
            max_tokens: self.max_tokens.unwrap_or(4096),
            max_iterations: self.max_iterations.unwrap_or(50),
            compaction_threshold: self.compaction_threshold.unwrap_or(100_000),
            preserve_recent: self.preserve_recent.unwrap_or(10),
            sub_agent_timeout_secs: self.sub_agent_timeout_secs.unwrap_or(300),
            sub_agent_max_iterations: self.sub_agent_max_iterations.unwrap_or(20),
            max_concurrent: self.max_concurrent.unwrap_or(3),
            max_queue_size: self.max_queue_size.unwrap_or(100),
            task_max_retries: self.task_max_retries.unwrap_or(0),
            task_retry_delay_ms: self.task_retry_delay_ms.unwrap_or(1000),
            shell_timeout_secs: self.shell_timeout_secs.unwrap_or(30),
            blocked_patterns: self.blocked_patterns.unwrap_or_else(default_blocklist),
            permissions,
        }
    }
}
