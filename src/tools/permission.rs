//! Permission gate in front of tool dispatch.
//!
//! Policy lookup order is `tool:resource`, then `tool`, then the default
//! level (`confirm`). Confirm-level calls consult a decision cache first and
//! only then the caller-supplied [`PermissionPrompt`]. Decisions are cached
//! according to their [`PermissionScope`]; permanent ones are also written
//! through a [`PermissionStore`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncWriteExt, Lines};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentStatus, StatusHandle};
use crate::error::ConfigError;
use crate::provider::ToolCall;

/// Error text for a tool whose policy is `deny`.
pub const DENIED_BY_POLICY: &str = "Permission denied: tool is disabled by policy";

/// Error text for a call the user declined.
pub const DENIED_BY_USER: &str = "Permission denied by user";

/// Error text when the turn is cancelled while the user is being asked.
pub const PROMPT_CANCELLED: &str = "Permission request cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Auto,
    Confirm,
    Deny,
}

impl std::str::FromStr for PermissionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(PermissionLevel::Auto),
            "confirm" => Ok(PermissionLevel::Confirm),
            "deny" => Ok(PermissionLevel::Deny),
            other => Err(format!("unknown permission level '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionScope {
    Once,
    Session,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionDecision {
    pub allowed: bool,
    pub scope: PermissionScope,
}

impl PermissionDecision {
    pub fn allow(scope: PermissionScope) -> Self {
        Self {
            allowed: true,
            scope,
        }
    }

    pub fn deny(scope: PermissionScope) -> Self {
        Self {
            allowed: false,
            scope,
        }
    }
}

/// Asynchronous approval callback for confirm-level tools.
///
/// `cancel` is the token of the turn that issued the call; a prompt that
/// blocks on a human should stop waiting when it fires.
#[async_trait]
pub trait PermissionPrompt: Send + Sync {
    async fn decide(
        &self,
        call: &ToolCall,
        tool_name: &str,
        detail: &str,
        cancel: &CancellationToken,
    ) -> PermissionDecision;
}

/// Grants every request for the session. Used by sub-agents and `--yes`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysGrant;

#[async_trait]
impl PermissionPrompt for AlwaysGrant {
    async fn decide(
        &self,
        _call: &ToolCall,
        _tool_name: &str,
        _detail: &str,
        _cancel: &CancellationToken,
    ) -> PermissionDecision {
        PermissionDecision::allow(PermissionScope::Session)
    }
}

/// Asks on stderr and reads the answer as one line from a shared reader.
///
/// The reader is shared with whatever else consumes the same input (the chat
/// loop reads user messages from it). While waiting, the attached status
/// handle reports `waiting_input`; the previous status is restored after.
pub struct LinePrompt<R> {
    input: Arc<Mutex<Lines<R>>>,
    status: Option<StatusHandle>,
}

impl<R> LinePrompt<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(input: Arc<Mutex<Lines<R>>>) -> Self {
        Self { input, status: None }
    }

    pub fn with_status(mut self, status: StatusHandle) -> Self {
        self.status = Some(status);
        self
    }

    fn parse(answer: &str) -> PermissionDecision {
        match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => PermissionDecision::allow(PermissionScope::Once),
            "s" | "session" => PermissionDecision::allow(PermissionScope::Session),
            "a" | "always" => PermissionDecision::allow(PermissionScope::Permanent),
            _ => PermissionDecision::deny(PermissionScope::Once),
        }
    }
}

#[async_trait]
impl<R> PermissionPrompt for LinePrompt<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn decide(
        &self,
        _call: &ToolCall,
        tool_name: &str,
        detail: &str,
        cancel: &CancellationToken,
    ) -> PermissionDecision {
        let question = format!("\nAllow {tool_name}: {detail}\n[y]es once / [s]ession / [a]lways / [n]o > ");
        let mut stderr = tokio::io::stderr();
        let _ = stderr.write_all(question.as_bytes()).await;
        let _ = stderr.flush().await;

        let previous = self.status.as_ref().map(|s| s.set(AgentStatus::WaitingInput));
        let answer = tokio::select! {
            _ = cancel.cancelled() => None,
            line = async { self.input.lock().await.next_line().await } => {
                Some(line.ok().flatten().unwrap_or_default())
            }
        };
        if let (Some(status), Some(previous)) = (&self.status, previous) {
            status.set(previous);
        }

        match answer {
            Some(answer) => Self::parse(&answer),
            None => {
                tracing::info!(tool = tool_name, "Approval prompt cancelled");
                PermissionDecision::deny(PermissionScope::Once)
            }
        }
    }
}

/// Backing store for permanent decisions.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    async fn load(&self) -> Result<HashMap<String, bool>, ConfigError>;
    async fn save(&self, key: &str, allowed: bool) -> Result<(), ConfigError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PermissionFile {
    #[serde(default)]
    decisions: BTreeMap<String, bool>,
}

/// Permanent decisions kept in a TOML file:
///
/// ```toml
/// [decisions]
/// shell_exec = true
/// ```
#[derive(Debug, Clone)]
pub struct TomlPermissionStore {
    path: PathBuf,
}

impl TomlPermissionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<PermissionFile, ConfigError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                path: self.path.clone(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PermissionFile::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl PermissionStore for TomlPermissionStore {
    async fn load(&self) -> Result<HashMap<String, bool>, ConfigError> {
        Ok(self.read().await?.decisions.into_iter().collect())
    }

    async fn save(&self, key: &str, allowed: bool) -> Result<(), ConfigError> {
        let mut file = self.read().await?;
        file.decisions.insert(key.to_string(), allowed);
        let contents = toml::to_string(&file).map_err(|e| ConfigError::ParseError {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, contents).await?;
        Ok(())
    }
}

/// Policies shipped for the built-in tools.
pub fn default_policies() -> HashMap<String, PermissionLevel> {
    HashMap::from([
        ("file_read".to_string(), PermissionLevel::Auto),
        ("list_dir".to_string(), PermissionLevel::Auto),
        ("file_write".to_string(), PermissionLevel::Confirm),
        ("shell_exec".to_string(), PermissionLevel::Confirm),
        ("background".to_string(), PermissionLevel::Auto),
        ("background:start".to_string(), PermissionLevel::Confirm),
        ("spawn_agent".to_string(), PermissionLevel::Confirm),
    ])
}

#[derive(Debug, Clone, Copy)]
struct CachedDecision {
    allowed: bool,
    scope: PermissionScope,
}

/// Policy table plus the process-wide decision cache.
///
/// The cache sits behind a lock so concurrently running agents can share one
/// manager.
pub struct PermissionManager {
    policies: HashMap<String, PermissionLevel>,
    default_level: PermissionLevel,
    cache: RwLock<HashMap<String, CachedDecision>>,
    prompt: Option<Arc<dyn PermissionPrompt>>,
    store: Option<Arc<dyn PermissionStore>>,
}

impl PermissionManager {
    pub fn new(policies: HashMap<String, PermissionLevel>) -> Self {
        Self {
            policies,
            default_level: PermissionLevel::Confirm,
            cache: RwLock::new(HashMap::new()),
            prompt: None,
            store: None,
        }
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn PermissionPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Attach a permanent store and preload its decisions into the cache.
    /// A store that cannot be read is logged and otherwise ignored.
    pub async fn with_store(mut self, store: Arc<dyn PermissionStore>) -> Self {
        match store.load().await {
            Ok(saved) => {
                let mut cache = self.cache.write();
                for (key, allowed) in saved {
                    cache.insert(
                        key,
                        CachedDecision {
                            allowed,
                            scope: PermissionScope::Permanent,
                        },
                    );
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to load saved permissions"),
        }
        self.store = Some(store);
        self
    }

    /// Same policy table, fresh cache, no store, the given prompt. Used to
    /// give a sub-agent its own approval behaviour.
    pub fn derive(&self, prompt: Arc<dyn PermissionPrompt>) -> Self {
        Self {
            policies: self.policies.clone(),
            default_level: self.default_level,
            cache: RwLock::new(HashMap::new()),
            prompt: Some(prompt),
            store: None,
        }
    }

    pub fn set_policy(&mut self, key: impl Into<String>, level: PermissionLevel) {
        self.policies.insert(key.into(), level);
    }

    /// Effective level for a call: `tool:resource`, then `tool`, then default.
    pub fn level_for(&self, tool_name: &str, resource: Option<&str>) -> PermissionLevel {
        resource
            .and_then(|r| self.policies.get(&format!("{tool_name}:{r}")))
            .or_else(|| self.policies.get(tool_name))
            .copied()
            .unwrap_or(self.default_level)
    }

    /// Gate one call. `Err` carries the message for the failed tool result.
    pub async fn check(
        &self,
        call: &ToolCall,
        tool_name: &str,
        resource: Option<&str>,
        detail: &str,
        cancel: &CancellationToken,
    ) -> Result<(), String> {
        match self.level_for(tool_name, resource) {
            PermissionLevel::Auto => return Ok(()),
            PermissionLevel::Deny => return Err(DENIED_BY_POLICY.to_string()),
            PermissionLevel::Confirm => {}
        }

        let cached = self.cache.read().get(tool_name).copied();
        if let Some(cached) = cached {
            return if cached.allowed {
                Ok(())
            } else {
                Err(DENIED_BY_USER.to_string())
            };
        }

        let Some(prompt) = &self.prompt else {
            return Err(format!(
                "Tool '{tool_name}' requires confirmation but no approval handler is configured"
            ));
        };

        let decision = prompt.decide(call, tool_name, detail, cancel).await;
        if cancel.is_cancelled() {
            return Err(PROMPT_CANCELLED.to_string());
        }
        self.remember(tool_name, decision).await;

        if decision.allowed {
            Ok(())
        } else {
            Err(DENIED_BY_USER.to_string())
        }
    }

    async fn remember(&self, tool_name: &str, decision: PermissionDecision) {
        if decision.scope == PermissionScope::Once {
            return;
        }
        self.cache.write().insert(
            tool_name.to_string(),
            CachedDecision {
                allowed: decision.allowed,
                scope: decision.scope,
            },
        );
        if decision.scope == PermissionScope::Permanent {
            if let Some(store) = &self.store {
                if let Err(e) = store.save(tool_name, decision.allowed).await {
                    tracing::warn!(tool = tool_name, error = %e, "Failed to persist permission");
                }
            }
        }
    }

    /// Drop session-scoped decisions; permanent ones survive.
    pub fn clear_session(&self) {
        self.cache
            .write()
            .retain(|_, d| d.scope == PermissionScope::Permanent);
    }
}

impl std::fmt::Debug for PermissionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionManager")
            .field("policies", &self.policies)
            .field("cached", &self.cache.read().len())
            .field("has_prompt", &self.prompt.is_some())
            .finish()
    }
}
