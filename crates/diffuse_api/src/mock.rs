//! Mock generation backend for testing.
//!
//! Captures every call and answers from scripted replies, so the
//! coordinator can be exercised without a running backend.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::client::GenerationBackend;
use crate::error::{ApiError, ApiResult};
use crate::payload::Txt2ImgPayload;

/// Scripted answer to a txt2img call.
#[derive(Debug, Clone)]
pub enum MockReply {
    Images(Vec<String>),
    Error(ApiError),
    /// Never completes. Stands in for a request that hangs until timeout.
    Pending,
}

impl MockReply {
    pub fn images(images: &[&str]) -> Self {
        Self::Images(images.iter().map(|s| s.to_string()).collect())
    }
}

/// Captured call information for verification.
#[derive(Debug, Clone)]
pub struct CapturedCall {
    pub method: String,
    pub base_url: String,
    pub payload: Option<Txt2ImgPayload>,
    pub checkpoint: Option<String>,
}

/// Mock backend. Clones share state.
#[derive(Clone, Default)]
pub struct MockBackend {
    replies: Arc<RwLock<VecDeque<MockReply>>>,
    delay: Arc<RwLock<Option<Duration>>>,
    progress: Arc<RwLock<VecDeque<f64>>>,
    checkpoint_failure: Arc<RwLock<Option<ApiError>>>,
    captured_calls: Arc<RwLock<Vec<CapturedCall>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for the next txt2img call.
    pub fn add_reply(self, reply: MockReply) -> Self {
        self.replies.write().push_back(reply);
        self
    }

    /// Delay every txt2img reply by `delay`.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.write() = Some(delay);
        self
    }

    /// Values returned by successive progress calls. The last one repeats.
    pub fn with_progress(self, values: &[f64]) -> Self {
        *self.progress.write() = values.iter().copied().collect();
        self
    }

    /// Make checkpoint switches fail.
    pub fn fail_checkpoint(self, error: ApiError) -> Self {
        *self.checkpoint_failure.write() = Some(error);
        self
    }

    /// Get all captured calls.
    pub fn get_calls(&self) -> Vec<CapturedCall> {
        self.captured_calls.read().clone()
    }

    /// Get calls to a specific method.
    pub fn get_method_calls(&self, method: &str) -> Vec<CapturedCall> {
        self.captured_calls
            .read()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    /// Number of calls to a specific method.
    pub fn call_count(&self, method: &str) -> usize {
        self.captured_calls
            .read()
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    fn record_call(&self, call: CapturedCall) {
        self.captured_calls.write().push(call);
    }

    fn next_reply(&self) -> MockReply {
        self.replies
            .write()
            .pop_front()
            .unwrap_or_else(|| MockReply::images(&["iVBORw0KGgo="]))
    }
}

#[async_trait]
impl GenerationBackend for MockBackend {
    async fn txt2img(&self, base_url: &str, payload: &Txt2ImgPayload) -> ApiResult<Vec<String>> {
        self.record_call(CapturedCall {
            method: "txt2img".to_string(),
            base_url: base_url.to_string(),
            payload: Some(payload.clone()),
            checkpoint: None,
        });

        let reply = self.next_reply();
        let delay = *self.delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match reply {
            MockReply::Images(images) if images.is_empty() => Err(ApiError::EmptyResult),
            MockReply::Images(images) => Ok(images),
            MockReply::Error(e) => Err(e),
            MockReply::Pending => std::future::pending().await,
        }
    }

    async fn progress(&self, base_url: &str) -> ApiResult<f64> {
        self.record_call(CapturedCall {
            method: "progress".to_string(),
            base_url: base_url.to_string(),
            payload: None,
            checkpoint: None,
        });

        let mut values = self.progress.write();
        let value = if values.len() > 1 {
            values.pop_front()
        } else {
            values.front().copied()
        };
        value.ok_or_else(|| ApiError::Network("no progress scripted".to_string()))
    }

    async fn set_checkpoint(&self, base_url: &str, checkpoint: &str) -> ApiResult<()> {
        self.record_call(CapturedCall {
            method: "set_checkpoint".to_string(),
            base_url: base_url.to_string(),
            payload: None,
            checkpoint: Some(checkpoint.to_string()),
        });

        match self.checkpoint_failure.read().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
