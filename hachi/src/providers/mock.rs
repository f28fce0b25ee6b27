//! Mock provider implementation for testing.
//!
//! Returns scripted [`ChatResponse`]s in sequence, cycling through them,
//! and records every request it receives so tests can assert on the exact
//! prompt the core assembled.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::chat::{ChatProvider, ChatRequest, ChatResponse, ChunkStream};
use crate::error::{Error, Result};
use crate::stream::StreamChunk;

/// A scripted provider for tests.
///
/// Responses are returned in order and cycle when exhausted, so a single
/// scripted tool-call response can drive an unbounded loop (bounded only
/// by the run's turn budget).
#[derive(Debug)]
pub struct MockProvider {
    responses: Vec<ChatResponse>,
    index: AtomicUsize,
    delay: Option<Duration>,
    streaming: bool,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockProvider {
    /// Create a provider with scripted responses.
    #[must_use]
    pub fn new(responses: Vec<ChatResponse>) -> Self {
        Self {
            responses,
            index: AtomicUsize::new(0),
            delay: None,
            streaming: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Sleep this long before answering each call.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Advertise and implement streaming support.
    #[must_use]
    pub const fn with_streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// Number of calls served so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.index.load(Ordering::SeqCst)
    }

    /// Snapshot of every request received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().expect("requests poisoned").clone()
    }

    fn next_response(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.requests
            .lock()
            .expect("requests poisoned")
            .push(request.clone());

        if self.responses.is_empty() {
            return Err(Error::model("mock provider has no scripted responses"));
        }
        let index = self.index.fetch_add(1, Ordering::SeqCst);
        Ok(self.responses[index % self.responses.len()].clone())
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next_response(request)
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChunkStream> {
        if !self.streaming {
            return Err(Error::model("streaming not supported"));
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let response = self.next_response(request)?;

        let mut chunks: Vec<Result<StreamChunk>> = Vec::new();
        if let Some(text) = response.text().filter(|t| !t.is_empty()) {
            // Split roughly in half so consumers observe real deltas.
            let mid = text.len() / 2;
            let split = text
                .char_indices()
                .map(|(i, _)| i)
                .min_by_key(|i| i.abs_diff(mid))
                .unwrap_or(0);
            let (head, tail) = text.split_at(split);
            if !head.is_empty() {
                chunks.push(Ok(StreamChunk::text(head)));
            }
            if !tail.is_empty() {
                chunks.push(Ok(StreamChunk::text(tail)));
            }
        }
        if let Some(calls) = response.tool_calls() {
            for (index, call) in calls.iter().enumerate() {
                chunks.push(Ok(StreamChunk::ToolUseStart {
                    index,
                    id: call.id.clone(),
                    name: call.name.clone(),
                }));
                chunks.push(Ok(StreamChunk::ToolUseDelta {
                    index,
                    partial_json: call.arguments.to_string(),
                }));
            }
        }
        if let Some(usage) = response.usage {
            chunks.push(Ok(StreamChunk::Usage(usage)));
        }
        chunks.push(Ok(StreamChunk::Done {
            stop_reason: Some(response.stop_reason),
        }));

        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    fn provider_name(&self) -> &'static str {
        "mock"
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }
}
