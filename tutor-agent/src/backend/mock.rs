//! Mock LLM backend for testing.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::traits::*;

/// One scripted reply, consumed in order by successive `complete` calls.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Return this response
    Respond(CompletionResponse),
    /// Fail with `LlmError::RequestFailed`
    Fail(String),
}

/// Mock backend for testing.
///
/// Replies are taken from a script queue; once the queue is empty every call
/// returns the default response text. Every request is recorded so tests can
/// inspect what the orchestrator sent.
pub struct MockBackend {
    model_id: String,
    available: AtomicBool,
    capabilities: ModelCapabilities,
    response_content: String,
    script: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<CompletionRequest>>,
    delay: Option<Duration>,
    call_count: AtomicU32,
}

impl MockBackend {
    /// Create a new mock backend.
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            available: AtomicBool::new(true),
            capabilities: ModelCapabilities::default(),
            response_content: "Mock response".to_string(),
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            delay: None,
            call_count: AtomicU32::new(0),
        }
    }

    /// Set the fallback response content.
    pub fn with_response(mut self, content: impl Into<String>) -> Self {
        self.response_content = content.into();
        self
    }

    /// Queue a scripted reply.
    pub fn with_reply(self, reply: CompletionResponse) -> Self {
        self.push_reply(ScriptedReply::Respond(reply));
        self
    }

    /// Queue a scripted failure.
    pub fn with_failure(self, message: impl Into<String>) -> Self {
        self.push_reply(ScriptedReply::Fail(message.into()));
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Set availability.
    pub fn with_available(self, available: bool) -> Self {
        self.available.store(available, Ordering::SeqCst);
        self
    }

    /// Queue a scripted reply on a shared backend.
    pub fn push_reply(&self, reply: ScriptedReply) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(reply);
        }
    }

    /// Get the number of times complete was called.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn next_reply(&self) -> Option<ScriptedReply> {
        self.script.lock().ok().and_then(|mut s| s.pop_front())
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new("mock-model")
    }
}

#[async_trait]
impl LlmBackend for MockBackend {
    fn id(&self) -> &str {
        &self.model_id
    }

    fn provider(&self) -> &str {
        "mock"
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);

        if !self.available.load(Ordering::SeqCst) {
            return Err(LlmError::Unavailable("Mock backend disabled".to_string()));
        }

        // Estimate token counts
        let prompt_tokens: u32 = request
            .messages
            .iter()
            .map(|m| m.content.len() as u32 / 4)
            .sum();

        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut response = match self.next_reply() {
            Some(ScriptedReply::Respond(response)) => response,
            Some(ScriptedReply::Fail(message)) => return Err(LlmError::RequestFailed(message)),
            None => CompletionResponse::text(self.response_content.clone()),
        };

        if response.usage == Usage::default() {
            response.usage = Usage {
                prompt_tokens,
                completion_tokens: response.content.len() as u32 / 4,
            };
        }

        Ok(response)
    }

    fn capabilities(&self) -> &ModelCapabilities {
        &self.capabilities
    }
}
