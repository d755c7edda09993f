use super::{GenerativeBackend, ImageBlob, LlmError};
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_root: String,
    pub api_key: Option<String>,
    pub text_model: String,
    pub vision_model: String,
}

impl GeminiConfig {
    pub fn from_env() -> Self {
        let text_model =
            std::env::var("GEMINI_TEXT_MODEL").unwrap_or_else(|_| "gemini-1.5-flash".into());
        Self {
            api_root: std::env::var("GEMINI_API_ROOT")
                .unwrap_or_else(|_| "https://generativelanguage.googleapis.com".into()),
            api_key: std::env::var("GEMINI_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            vision_model: std::env::var("GEMINI_VISION_MODEL")
                .unwrap_or_else(|_| text_model.clone()),
            text_model,
        }
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{model}:generateContent",
            self.api_root.trim_end_matches('/')
        )
    }
}

pub struct GeminiClient {
    http: Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }

    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        images: &[ImageBlob],
    ) -> Result<String, LlmError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(LlmError::MissingApiKey)?;

        let body = GenerateRequest::new(prompt, images);
        debug!(
            target = "gemiturn.llm",
            model,
            images = images.len(),
            prompt_chars = prompt.len(),
            "gemini_generate"
        );

        let response = self
            .http
            .post(self.config.endpoint(model))
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<GenerateResponse>(&raw)
                .ok()
                .and_then(|payload| payload.error)
                .map(|err| err.message)
                .unwrap_or(raw);
            return Err(LlmError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let payload: GenerateResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        payload.into_text()
    }
}

#[async_trait]
impl GenerativeBackend for GeminiClient {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn generate_text(&self, prompt: &str) -> Result<String, LlmError> {
        self.generate(&self.config.text_model, prompt, &[]).await
    }

    async fn generate_vision(
        &self,
        prompt: &str,
        images: &[ImageBlob],
    ) -> Result<String, LlmError> {
        self.generate(&self.config.vision_model, prompt, images)
            .await
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

impl GenerateRequest {
    fn new(prompt: &str, images: &[ImageBlob]) -> Self {
        let mut parts = vec![Part::Text {
            text: prompt.to_string(),
        }];
        parts.extend(images.iter().map(|image| Part::InlineData {
            inline_data: InlineData {
                mime_type: image.mime_type.to_string(),
                data: image.to_base64(),
            },
        }));
        Self {
            contents: vec![Content {
                role: "user".into(),
                parts,
            }],
        }
    }
}

#[derive(Debug, Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Debug, Serialize)]
struct InlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "promptFeedback", default)]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

impl GenerateResponse {
    fn into_text(self) -> Result<String, LlmError> {
        if let Some(err) = self.error {
            return Err(LlmError::InvalidResponse(err.message));
        }
        let text = self
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .filter(|text| !text.trim().is_empty());
        match (text, self.prompt_feedback) {
            (Some(text), _) => Ok(text),
            (None, Some(PromptFeedback {
                block_reason: Some(reason),
            })) => Err(LlmError::InvalidResponse(format!("prompt blocked: {reason}"))),
            (None, _) => Err(LlmError::InvalidResponse("missing text".into())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromptFeedback {
    #[serde(rename = "blockReason", default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}
