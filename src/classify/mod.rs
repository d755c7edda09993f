pub mod normalize;
pub mod taxonomy;

use crate::llm::{GenerativeBackend, ImageBlob};
use crate::models::ProductMetadata;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, sync::Arc, time::Instant};
use tracing::{debug, info, warn};

use normalize::NormalizeError;
use taxonomy::{DISPOSITIONS, FALLBACK_CATEGORY, FALLBACK_RECOMMENDATION, RETURN_CATEGORIES};

const MAX_TAGS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationResult {
    pub category: String,
    pub reason: String,
    pub recommendation: String,
    pub confidence: f64,
}

impl ClassificationResult {
    pub fn fallback() -> Self {
        Self::fallback_with_reason("")
    }

    pub fn fallback_with_reason(reason: impl Into<String>) -> Self {
        Self {
            category: FALLBACK_CATEGORY.to_string(),
            reason: reason.into(),
            recommendation: FALLBACK_RECOMMENDATION.to_string(),
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClassificationRequest<'a> {
    pub description: &'a str,
    pub product: &'a ProductMetadata,
    pub images: &'a [ImageBlob],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationOutcome {
    Model,
    BackendFailed,
    Unparseable,
}

impl ClassificationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationOutcome::Model => "model",
            ClassificationOutcome::BackendFailed => "backend_failed",
            ClassificationOutcome::Unparseable => "unparseable",
        }
    }

    pub fn is_fallback(&self) -> bool {
        !matches!(self, ClassificationOutcome::Model)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub result: ClassificationResult,
    pub outcome: ClassificationOutcome,
}

/// Builds the triage prompt, calls the backend once and normalizes the reply.
/// Backend errors and unusable replies both end in the fallback result.
#[derive(Clone)]
pub struct Classifier {
    backend: Arc<dyn GenerativeBackend>,
}

impl Classifier {
    pub fn new(backend: Arc<dyn GenerativeBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn classify(
        &self,
        description: &str,
        product: &ProductMetadata,
        images: &[ImageBlob],
    ) -> ClassificationResult {
        self.classify_request(ClassificationRequest {
            description,
            product,
            images,
        })
        .await
        .result
    }

    pub async fn classify_request(&self, request: ClassificationRequest<'_>) -> Classification {
        let started = Instant::now();
        let prompt = build_prompt(&request);
        let reply = if request.images.is_empty() {
            self.backend.generate_text(&prompt).await
        } else {
            self.backend.generate_vision(&prompt, request.images).await
        };

        let classification = match reply {
            Ok(text) => match normalize::try_normalize(&text) {
                Ok(result) => {
                    if !taxonomy::is_known_category(&result.category) {
                        debug!(
                            target = "gemiturn.classify",
                            category = %result.category,
                            "category_outside_taxonomy"
                        );
                    }
                    if !taxonomy::is_known_disposition(&result.recommendation) {
                        debug!(
                            target = "gemiturn.classify",
                            recommendation = %result.recommendation,
                            "recommendation_outside_taxonomy"
                        );
                    }
                    Classification {
                        result,
                        outcome: ClassificationOutcome::Model,
                    }
                }
                Err(err) => {
                    if matches!(err, NormalizeError::Unstructured) {
                        warn!(
                            target = "gemiturn.classify",
                            preview = %preview(&text),
                            "classification_response_unstructured"
                        );
                    }
                    Classification {
                        result: ClassificationResult::fallback(),
                        outcome: ClassificationOutcome::Unparseable,
                    }
                }
            },
            Err(err) => {
                warn!(
                    target = "gemiturn.classify",
                    backend = self.backend.name(),
                    error = %err,
                    "classification_backend_failed"
                );
                Classification {
                    result: ClassificationResult::fallback_with_reason(format!(
                        "Analysis failed: {err}"
                    )),
                    outcome: ClassificationOutcome::BackendFailed,
                }
            }
        };

        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::classification(classification.outcome.as_str(), elapsed_ms);
        info!(
            target = "gemiturn.classify",
            outcome = classification.outcome.as_str(),
            category = %classification.result.category,
            confidence = classification.result.confidence,
            images = request.images.len(),
            elapsed_ms = elapsed_ms as u64,
            "return_classified"
        );
        classification
    }

    /// Up to ten short tags for a return. Empty when the backend fails.
    pub async fn generate_tags(&self, text: &str, images: &[ImageBlob]) -> Vec<String> {
        let prompt = format!(
            "Generate up to {MAX_TAGS} short tags describing this product return.\n\nDescription:\n{}\n\nReply with the tags only, separated by commas.",
            text.trim()
        );
        let reply = if images.is_empty() {
            self.backend.generate_text(&prompt).await
        } else {
            self.backend.generate_vision(&prompt, images).await
        };
        match reply {
            Ok(text) => parse_tags(&text),
            Err(err) => {
                warn!(target = "gemiturn.classify", error = %err, "tag_generation_failed");
                Vec::new()
            }
        }
    }
}

fn build_prompt(request: &ClassificationRequest<'_>) -> String {
    let product = request.product.prompt_lines();
    let evidence = if request.images.is_empty() {
        "Use the customer description and product information."
    } else {
        "Use the attached photos together with the customer description and product information."
    };
    format!(
        "You are a returns triage analyst for an e-commerce warehouse.\n\
         {evidence}\n\n\
         Product information:\n{product}\n\n\
         Customer description:\n{description}\n\n\
         Choose the return category from:\n{categories}\n\n\
         Choose the recommended disposition from:\n{dispositions}\n\n\
         Respond with a single JSON object and nothing else:\n\
         {{\"category\": \"<category>\", \"reason\": \"<one sentence>\", \"recommendation\": \"<disposition>\", \"confidence\": <number between 0 and 1>}}",
        description = if request.description.trim().is_empty() {
            "(none provided)"
        } else {
            request.description.trim()
        },
        categories = taxonomy::prompt_block(&RETURN_CATEGORIES),
        dispositions = taxonomy::prompt_block(&DISPOSITIONS),
    )
}

fn parse_tags(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.split([',', '\n', '，'])
        .map(|tag| tag.trim().trim_matches(|ch: char| matches!(ch, '*' | '-' | '"' | '#')).trim())
        .filter(|tag| !tag.is_empty())
        .filter(|tag| seen.insert(tag.to_lowercase()))
        .take(MAX_TAGS)
        .map(str::to_string)
        .collect()
}

fn preview(text: &str) -> String {
    text.chars().take(120).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::llm::scripted::ScriptedBackend;

    const GOOD_REPLY: &str = r#"{"category":"Quality Issues","reason":"cracked screen","recommendation":"Repair and Resell","confidence":0.9}"#;

    fn phone() -> ProductMetadata {
        ProductMetadata {
            product_id: Some("PROD00003".into()),
            name: "Phone X".into(),
            category: "Electronics".into(),
            price: Some(499.0),
        }
    }

    #[tokio::test]
    async fn text_path_used_without_images() {
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(GOOD_REPLY.into())]));
        let classifier = Classifier::new(backend.clone());
        let result = classifier
            .classify("screen cracked on arrival", &phone(), &[])
            .await;
        assert_eq!(result.category, "Quality Issues");
        assert_eq!(result.confidence, 0.9);
        let calls = backend.calls();
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].vision);
        assert!(calls[0].prompt.contains("screen cracked on arrival"));
        assert!(calls[0].prompt.contains("product_name: Phone X"));
        assert!(calls[0].prompt.contains("- Repair and Resell:"));
    }

    #[tokio::test]
    async fn vision_path_used_with_images() {
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(GOOD_REPLY.into())]));
        let classifier = Classifier::new(backend.clone());
        let images = vec![ImageBlob::new(vec![0xFF, 0xD8, 0xFF, 0xE0])];
        let outcome = classifier
            .classify_request(ClassificationRequest {
                description: "see photo",
                product: &phone(),
                images: &images,
            })
            .await;
        assert_eq!(outcome.outcome, ClassificationOutcome::Model);
        let calls = backend.calls();
        assert!(calls[0].vision);
        assert_eq!(calls[0].image_count, 1);
    }

    #[tokio::test]
    async fn backend_error_becomes_fallback_with_reason() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err(LlmError::Http(
            "connection reset".into(),
        ))]));
        let classifier = Classifier::new(backend);
        let outcome = classifier
            .classify_request(ClassificationRequest {
                description: "broken",
                product: &phone(),
                images: &[],
            })
            .await;
        assert_eq!(outcome.outcome, ClassificationOutcome::BackendFailed);
        assert_eq!(outcome.result.category, "Uncategorized");
        assert_eq!(outcome.result.recommendation, "Manual review");
        assert_eq!(outcome.result.confidence, 0.0);
        assert!(outcome.result.reason.starts_with("Analysis failed:"));
        assert!(outcome.result.reason.contains("connection reset"));
    }

    #[tokio::test]
    async fn missing_api_key_never_raises() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err(LlmError::MissingApiKey)]));
        let classifier = Classifier::new(backend);
        let result = classifier.classify("anything", &phone(), &[]).await;
        assert_eq!(result.category, "Uncategorized");
    }

    #[tokio::test]
    async fn unparseable_reply_is_reported() {
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(
            "I cannot determine a category.".into(),
        )]));
        let classifier = Classifier::new(backend);
        let outcome = classifier
            .classify_request(ClassificationRequest {
                description: "?",
                product: &phone(),
                images: &[],
            })
            .await;
        assert_eq!(outcome.outcome, ClassificationOutcome::Unparseable);
        assert_eq!(outcome.result, ClassificationResult::fallback());
    }

    #[tokio::test]
    async fn tags_are_split_deduplicated_and_capped() {
        let reply = "screen, Crack, crack, phone,\n- damaged, a, b, c, d, e, f, g, h";
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(reply.into())]));
        let classifier = Classifier::new(backend);
        let tags = classifier.generate_tags("cracked phone", &[]).await;
        assert_eq!(tags.len(), 10);
        assert_eq!(&tags[..4], &["screen", "Crack", "phone", "damaged"]);
    }

    #[tokio::test]
    async fn tags_empty_on_backend_failure() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err(LlmError::Http("down".into()))]));
        let classifier = Classifier::new(backend);
        assert!(classifier.generate_tags("x", &[]).await.is_empty());
    }
}
