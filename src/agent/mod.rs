//! Conversational agent: the tool-calling loop, its events, session
//! persistence, prompts and the bounded sub-agent used by tasks.

pub mod agent_loop;
pub mod events;
pub mod session;
pub mod sub_agent;
pub mod system_prompt;

pub use agent_loop::{Agent, AgentSettings};
pub use events::{AgentEvent, AgentStatus, StatusHandle, StopReason, TurnOutcome};
pub use session::{JsonSessionStore, Session, SessionStore};
pub use sub_agent::{SubAgent, SubAgentConfig, SubAgentResult};
pub use system_prompt::{SubAgentKind, build_sub_agent_prompt, build_system_prompt};
