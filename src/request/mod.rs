//! Request lifecycle
//!
//! Owns the cancellable streaming request: single-flight admission (a new
//! send supersedes any in-flight one), retry with a fixed delay, and the
//! taxonomy separating user cancellation from transient failure.
//!
//! Cancellation is cooperative: the abort signal is a watch channel checked
//! between chunk reads and inside retry sleeps. The decoder and splitter are
//! pure, so the effective granularity is "stop before the next chunk", which
//! is safe because every chunk's effect is an idempotent overwrite.

use crate::content::{ContentSplitter, SplitOutput};
use crate::sse::{SseDecoder, StreamEvent};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Additional attempts after the first failure.
pub const MAX_RETRIES: u32 = 2;

/// Fixed delay between attempts.
pub const RETRY_DELAY: Duration = Duration::from_millis(800);

/// Transport-level failure, before classification against the retry policy.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request aborted")]
    Aborted,
    #[error("network error: {0}")]
    Network(String),
    #[error("upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },
}

pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Outbound chat request payload (see the wire contract in the crate docs).
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub user: String,
    pub inputs: serde_json::Value,
    pub query: String,
    pub response_mode: String,
}

impl ChatRequest {
    pub fn streaming(user: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            inputs: serde_json::json!({}),
            query: query.into(),
            response_mode: "streaming".to_string(),
        }
    }
}

/// Seam to the streaming HTTP layer. Implementations should observe the
/// abort receiver between reads so cancellation lands promptly.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open(
        &self,
        request: &ChatRequest,
        abort: watch::Receiver<bool>,
    ) -> Result<ByteStream, TransportError>;
}

#[derive(Debug, Deserialize)]
struct UpstreamErrorBody {
    message: String,
}

/// Production transport: POST with a bearer credential, response consumed
/// as a byte stream.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<REDACTED>")
            .finish()
    }
}

#[async_trait]
impl StreamTransport for HttpTransport {
    async fn open(
        &self,
        request: &ChatRequest,
        _abort: watch::Receiver<bool>,
    ) -> Result<ByteStream, TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<UpstreamErrorBody>(&body)
                .map(|b| b.message)
                .unwrap_or(body);
            return Err(TransportError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| TransportError::Network(err.to_string())))
            .boxed())
    }
}

/// Outcome taxonomy surfaced to the orchestrator.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The user cancelled the turn. Not a failure: never retried, and no
    /// error message is injected for it.
    #[error("terminated by user")]
    Cancelled,
    /// Transport failure that survived the whole retry budget.
    #[error("network failure after {attempts} attempts: {message}")]
    Network { attempts: u32, message: String },
    /// Non-2xx response, with the upstream explanation when parseable.
    #[error("upstream rejected the request ({status}): {message}")]
    Upstream { status: u16, message: String },
}

/// Final snapshot of one completed turn.
#[derive(Debug, Clone, Default)]
pub struct TurnReply {
    pub final_text: String,
    pub reasoning: String,
    pub suggestions: Vec<String>,
    pub conversation_id: Option<String>,
}

#[derive(Default)]
struct ActiveSlot {
    generation: u64,
    abort: Option<watch::Sender<bool>>,
}

/// Single-flight streaming request driver.
pub struct RequestController {
    transport: Arc<dyn StreamTransport>,
    splitter: ContentSplitter,
    user: String,
    active: Mutex<ActiveSlot>,
    retrying: AtomicBool,
}

impl RequestController {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        splitter: ContentSplitter,
        user: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            splitter,
            user: user.into(),
            active: Mutex::new(ActiveSlot::default()),
            retrying: AtomicBool::new(false),
        }
    }

    /// Whether an attempt beyond the first is currently in progress.
    pub fn is_retrying(&self) -> bool {
        self.retrying.load(Ordering::SeqCst)
    }

    /// Cancel the in-flight request, if any.
    pub fn cancel(&self) {
        let mut slot = self.active.lock().expect("controller state poisoned");
        if let Some(abort) = slot.abort.take() {
            let _ = abort.send(true);
        }
    }

    /// Issue one streaming turn. Any in-flight request is cancelled first.
    ///
    /// Both callbacks receive the *latest* full reasoning / final string on
    /// every decoded event ("replace with latest", never "append"); each
    /// attempt starts by invoking them with the empty string so a retried
    /// turn never shows stale partial text.
    pub async fn send<F, G>(
        &self,
        query: &str,
        mut on_final: F,
        mut on_reasoning: G,
    ) -> Result<TurnReply, RequestError>
    where
        F: FnMut(&str),
        G: FnMut(&str),
    {
        let (abort_tx, abort_rx) = watch::channel(false);
        let generation = {
            let mut slot = self.active.lock().expect("controller state poisoned");
            slot.generation += 1;
            if let Some(previous) = slot.abort.replace(abort_tx) {
                let _ = previous.send(true);
            }
            slot.generation
        };
        self.retrying.store(false, Ordering::SeqCst);

        let request = ChatRequest::streaming(self.user.clone(), query);
        let result = self
            .run_attempts(&request, abort_rx, &mut on_final, &mut on_reasoning)
            .await;

        self.retrying.store(false, Ordering::SeqCst);
        {
            let mut slot = self.active.lock().expect("controller state poisoned");
            if slot.generation == generation {
                slot.abort = None;
            }
        }
        result
    }

    async fn run_attempts<F, G>(
        &self,
        request: &ChatRequest,
        mut abort: watch::Receiver<bool>,
        on_final: &mut F,
        on_reasoning: &mut G,
    ) -> Result<TurnReply, RequestError>
    where
        F: FnMut(&str),
        G: FnMut(&str),
    {
        let mut last_error: Option<TransportError> = None;
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                self.retrying.store(true, Ordering::SeqCst);
                tracing::info!(attempt, "retrying chat request");
                tokio::select! {
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                    _ = wait_cancelled(&mut abort) => return Err(RequestError::Cancelled),
                }
            }

            // Clean slate per attempt.
            on_reasoning("");
            on_final("");

            match self
                .attempt(request, &mut abort, on_final, on_reasoning)
                .await
            {
                Ok(reply) => return Ok(reply),
                Err(TransportError::Aborted) => return Err(RequestError::Cancelled),
                Err(err) => {
                    tracing::warn!(error = %err, attempt, "chat request attempt failed");
                    last_error = Some(err);
                }
            }
        }

        Err(
            match last_error.unwrap_or(TransportError::Network("request failed".to_string())) {
                TransportError::Upstream { status, message } => {
                    RequestError::Upstream { status, message }
                }
                other => RequestError::Network {
                    attempts: MAX_RETRIES + 1,
                    message: other.to_string(),
                },
            },
        )
    }

    async fn attempt<F, G>(
        &self,
        request: &ChatRequest,
        abort: &mut watch::Receiver<bool>,
        on_final: &mut F,
        on_reasoning: &mut G,
    ) -> Result<TurnReply, TransportError>
    where
        F: FnMut(&str),
        G: FnMut(&str),
    {
        let mut stream = tokio::select! {
            opened = self.transport.open(request, abort.clone()) => opened?,
            _ = wait_cancelled(abort) => return Err(TransportError::Aborted),
        };

        let mut decoder = SseDecoder::new();
        let mut answer = String::new();
        let mut conversation_id: Option<String> = None;
        let mut event_suggestions: Vec<String> = Vec::new();
        let mut snapshot = SplitOutput::default();

        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = wait_cancelled(abort) => return Err(TransportError::Aborted),
            };
            let Some(chunk) = chunk else { break };
            for event in decoder.feed(&chunk?) {
                self.apply_event(
                    event,
                    &mut answer,
                    &mut conversation_id,
                    &mut event_suggestions,
                    &mut snapshot,
                    on_final,
                    on_reasoning,
                );
            }
        }
        if let Some(event) = decoder.finish() {
            self.apply_event(
                event,
                &mut answer,
                &mut conversation_id,
                &mut event_suggestions,
                &mut snapshot,
                on_final,
                on_reasoning,
            );
        }

        // Suggestions parsed out of the answer text win; the backend's own
        // suggested_questions field is the fallback.
        let suggestions = if snapshot.suggestions.is_empty() {
            event_suggestions
        } else {
            snapshot.suggestions.clone()
        };

        Ok(TurnReply {
            final_text: snapshot.final_text,
            reasoning: snapshot.reasoning,
            suggestions,
            conversation_id,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_event<F, G>(
        &self,
        event: StreamEvent,
        answer: &mut String,
        conversation_id: &mut Option<String>,
        event_suggestions: &mut Vec<String>,
        snapshot: &mut SplitOutput,
        on_final: &mut F,
        on_reasoning: &mut G,
    ) where
        F: FnMut(&str),
        G: FnMut(&str),
    {
        if let Some(id) = event.conversation_id {
            *conversation_id = Some(id);
        }
        if let Some(questions) = event.suggested_questions {
            *event_suggestions = questions;
        }
        if let Some(delta) = event.answer {
            answer.push_str(&delta);
            // Always re-classify the whole cumulative text: later chunks
            // can rewrite earlier deliberation into answer form.
            *snapshot = self.splitter.split(answer);
            on_reasoning(&snapshot.reasoning);
            on_final(&snapshot.final_text);
        }
    }
}

/// Resolves once the abort flag flips to true; never resolves otherwise.
async fn wait_cancelled(abort: &mut watch::Receiver<bool>) {
    loop {
        if *abort.borrow() {
            return;
        }
        if abort.changed().await.is_err() {
            // Sender gone without an abort: nothing left to wait for.
            std::future::pending::<()>().await;
        }
    }
}
