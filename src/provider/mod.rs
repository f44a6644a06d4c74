//! Chat-completions provider: conversation types, the event-stream decoder,
//! retry policy and the HTTP client.

pub mod client;
pub mod retry;
pub mod stream;
pub mod types;

pub use client::{ChatProvider, OpenAiClient, ProviderSettings};
pub use retry::RetryPolicy;
pub use stream::{StreamAccumulator, StreamChunk, ToolCallFragment};
pub use types::{Message, Role, ToolCall};
