#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use tasker::agent::{AgentEvent, SubAgentResult};
use tasker::error::ProviderError;
use tasker::provider::{ChatProvider, Message, StreamChunk};
use tasker::tasks::{RetryDefaults, TaskDefinition, TaskExecutor, TaskRunner};
use tasker::tools::ToolDefinition;

// ─── Scripted provider ────────────────────────────────────────────────

/// Replays canned assistant messages; falls back to `fallback` once empty.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Message>>,
    fallback: Message,
    pub calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<Message>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            fallback: Message::assistant("done"),
            calls: AtomicUsize::new(0),
        })
    }

    /// Every reply is the same message.
    pub fn repeating(reply: Message) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: reply,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn chat(
        &self,
        _: &[Message],
        _: &[ToolDefinition],
        cancel: &CancellationToken,
    ) -> Result<Message, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone()))
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        cancel: &CancellationToken,
        on_chunk: &mut (dyn for<'c> FnMut(&'c StreamChunk) + Send),
    ) -> Result<Message, ProviderError> {
        let reply = self.chat(messages, tools, cancel).await?;
        if !reply.content.is_empty() {
            on_chunk(&StreamChunk::Text(reply.content.clone()));
        }
        Ok(reply)
    }
}

// ─── Scripted task executor ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Script {
    pub succeed: bool,
    pub delay: Duration,
}

/// Task executor whose outcome per task id is fixed up front. Records the
/// order tasks started in and the peak number running at once.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: HashMap<String, Script>,
    default_delay: Duration,
    started: Mutex<Vec<String>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn failing(mut self, id: &str) -> Self {
        self.scripts.insert(
            id.to_string(),
            Script {
                succeed: false,
                delay: self.default_delay,
            },
        );
        self
    }

    pub fn slow(mut self, id: &str, delay: Duration) -> Self {
        self.scripts.insert(
            id.to_string(),
            Script {
                succeed: true,
                delay,
            },
        );
        self
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        task: &TaskDefinition,
        cancel: CancellationToken,
        _: UnboundedSender<AgentEvent>,
    ) -> SubAgentResult {
        let script = self.scripts.get(&task.id).cloned().unwrap_or(Script {
            succeed: true,
            delay: self.default_delay,
        });
        self.started.lock().push(task.id.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let cancelled = tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(script.delay) => false,
        };
        self.running.fetch_sub(1, Ordering::SeqCst);

        SubAgentResult {
            success: script.succeed && !cancelled,
            output: if cancelled {
                "Cancelled".to_string()
            } else if script.succeed {
                format!("{} done", task.id)
            } else {
                format!("{} failed", task.id)
            },
            iterations: 1,
            cancelled,
            elapsed: script.delay,
        }
    }
}

pub fn runner(executor: Arc<ScriptedExecutor>) -> TaskRunner {
    TaskRunner::new(executor, RetryDefaults::default())
}

// ─── HTTP responder ───────────────────────────────────────────────────

/// Serves the given `(status, body)` responses in order, one per
/// connection, and counts the requests it saw. Returns the base URL.
pub async fn serve(responses: Vec<(u16, String)>) -> (String, Arc<AtomicUsize>) {
    let raw = responses
        .into_iter()
        .map(|(status, body)| {
            let content_type = if body.starts_with("data:") {
                "text/event-stream"
            } else {
                "application/json"
            };
            format!(
                "HTTP/1.1 {status} Status\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            )
        })
        .collect();
    serve_raw(raw).await
}

/// Like [`serve`], but each entry is written to the socket verbatim before
/// the connection is closed. Lets a test send a truncated body.
pub async fn serve_raw(responses: Vec<String>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        let mut responses = VecDeque::from(responses);
        while let Ok((mut socket, _)) = listener.accept().await {
            read_request(&mut socket).await;
            counter.fetch_add(1, Ordering::SeqCst);
            let reply = responses.pop_front().unwrap_or_else(|| {
                "HTTP/1.1 500 Status\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{}".to_string()
            });
            let _ = socket.write_all(reply.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    (format!("http://{addr}/v1"), hits)
}

async fn read_request(socket: &mut tokio::net::TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);
        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
        let length = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= end + 4 + length {
            return;
        }
    }
}
