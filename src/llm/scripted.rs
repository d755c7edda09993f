use super::{GenerativeBackend, ImageBlob, LlmError};
use async_trait::async_trait;
use std::{collections::VecDeque, sync::Mutex};

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub vision: bool,
    pub prompt: String,
    pub image_count: usize,
}

/// Replays queued replies in order and records every call.
#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<Result<String, LlmError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    fn next(&self, vision: bool, prompt: &str, image_count: usize) -> Result<String, LlmError> {
        self.calls.lock().unwrap().push(RecordedCall {
            vision,
            prompt: prompt.to_string(),
            image_count,
        });
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Http("script exhausted".into())))
    }
}

#[async_trait]
impl GenerativeBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn generate_text(&self, prompt: &str) -> Result<String, LlmError> {
        self.next(false, prompt, 0)
    }

    async fn generate_vision(
        &self,
        prompt: &str,
        images: &[ImageBlob],
    ) -> Result<String, LlmError> {
        self.next(true, prompt, images.len())
    }
}
