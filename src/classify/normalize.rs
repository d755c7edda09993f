//! Turns free-form model output into a [`ClassificationResult`].
//!
//! Structured parsing is tried first: the whole reply, then each fenced code
//! block, then the widest `{ ... }` span, then the first complete object that
//! starts at any `{`. When none of those yields a JSON object, labeled lines
//! (`Category: ...`, `类别：...`) are scanned instead. Every path must produce
//! all four fields; [`super::Classifier`] substitutes the fallback otherwise.

use super::ClassificationResult;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

pub const FIELDS: [&str; 4] = ["category", "reason", "recommendation", "confidence"];

const CATEGORY_LABELS: &[&str] = &["category", "类别"];
const REASON_LABELS: &[&str] = &["reason", "原因"];
const RECOMMENDATION_LABELS: &[&str] = &["recommendation", "recommended", "建议"];
const CONFIDENCE_LABELS: &[&str] = &["confidence", "置信度"];

const MAX_LABEL_CHARS: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("response has no structured object or labeled fields")]
    Unstructured,
    #[error("response is missing fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
}

pub fn try_normalize(raw: &str) -> Result<ClassificationResult, NormalizeError> {
    let outcome = match structured_object(raw) {
        Some((strategy, object)) => {
            debug!(target = "gemiturn.classify", strategy, "structured_response_parsed");
            from_object(&object)
        }
        None => scan_labeled_lines(raw).into_result(),
    };
    if let Err(NormalizeError::MissingFields(missing)) = &outcome {
        warn!(
            target = "gemiturn.classify",
            missing = %missing.join(","),
            "classification_fields_missing"
        );
    }
    outcome
}

fn structured_object(raw: &str) -> Option<(&'static str, Map<String, Value>)> {
    if let Some(object) = parse_object(raw) {
        return Some(("direct", object));
    }
    if let Some(object) = fenced_segments(raw)
        .into_iter()
        .find_map(|segment| parse_object(strip_language_tag(segment)))
    {
        return Some(("fenced", object));
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if start < end
        && let Some(object) = parse_object(&raw[start..=end])
    {
        return Some(("braces", object));
    }
    embedded_object(raw).map(|object| ("embedded", object))
}

/// First complete object found at any `{`, read as a stream so trailing text
/// is ignored. An object with a `category` key wins over earlier ones.
fn embedded_object(raw: &str) -> Option<Map<String, Value>> {
    let mut first = None;
    for (idx, _) in raw.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&raw[idx..]).into_iter::<Value>();
        if let Some(Ok(Value::Object(object))) = stream.next() {
            if field(&object, "category").is_some() {
                return Some(object);
            }
            first.get_or_insert(object);
        }
    }
    first
}

fn parse_object(candidate: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(Value::Object(object)) => Some(object),
        _ => None,
    }
}

/// Contents of each ```-delimited block. An unterminated final fence still
/// counts as a block.
fn fenced_segments(raw: &str) -> Vec<&str> {
    if !raw.contains("```") {
        return Vec::new();
    }
    raw.split("```")
        .enumerate()
        .filter(|(idx, _)| idx % 2 == 1)
        .map(|(_, segment)| segment)
        .collect()
}

fn strip_language_tag(segment: &str) -> &str {
    let body = segment.trim_start_matches([' ', '\t']);
    match body.split_once('\n') {
        Some((first, rest)) if is_language_tag(first) => rest,
        _ => body,
    }
}

fn is_language_tag(line: &str) -> bool {
    let line = line.trim();
    !line.is_empty()
        && line
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '+'))
}

fn from_object(object: &Map<String, Value>) -> Result<ClassificationResult, NormalizeError> {
    let category = field(object, "category").map(text_value);
    let reason = field(object, "reason").map(text_value);
    let recommendation = field(object, "recommendation").map(text_value);
    let confidence = field(object, "confidence").map(coerce_confidence);

    match (category, reason, recommendation, confidence) {
        (Some(category), Some(reason), Some(recommendation), Some(confidence)) => {
            Ok(ClassificationResult {
                category,
                reason,
                recommendation,
                confidence,
            })
        }
        (category, reason, recommendation, confidence) => {
            let present = [
                category.is_some(),
                reason.is_some(),
                recommendation.is_some(),
                confidence.is_some(),
            ];
            Err(NormalizeError::MissingFields(missing_fields(present)))
        }
    }
}

fn field<'a>(object: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    object
        .get(name)
        .or_else(|| {
            object
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
        .filter(|value| !value.is_null())
}

fn text_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn missing_fields(present: [bool; 4]) -> Vec<&'static str> {
    FIELDS
        .iter()
        .zip(present)
        .filter(|(_, found)| !found)
        .map(|(name, _)| *name)
        .collect()
}

/// Numbers and numeric strings pass through (clamped to `[0, 1]`); anything
/// else becomes `0.0`.
pub fn coerce_confidence(value: &Value) -> f64 {
    let raw = match value {
        Value::Number(number) => number.as_f64().unwrap_or(0.0),
        Value::String(text) => parse_confidence_text(text),
        _ => 0.0,
    };
    bound_confidence(raw)
}

fn parse_confidence_text(text: &str) -> f64 {
    let trimmed = text.trim();
    if let Some(percent) = trimmed.strip_suffix('%') {
        return percent
            .trim()
            .parse::<f64>()
            .map(|value| value / 100.0)
            .unwrap_or(0.0);
    }
    trimmed.parse::<f64>().unwrap_or(0.0)
}

fn bound_confidence(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[derive(Debug, Default)]
struct LabeledFields {
    category: Option<String>,
    reason: Option<String>,
    recommendation: Option<String>,
    confidence: Option<String>,
}

impl LabeledFields {
    fn is_empty(&self) -> bool {
        self.category.is_none()
            && self.reason.is_none()
            && self.recommendation.is_none()
            && self.confidence.is_none()
    }

    fn into_result(self) -> Result<ClassificationResult, NormalizeError> {
        if self.is_empty() {
            return Err(NormalizeError::Unstructured);
        }
        match self {
            LabeledFields {
                category: Some(category),
                reason: Some(reason),
                recommendation: Some(recommendation),
                confidence: Some(confidence),
            } => {
                debug!(target = "gemiturn.classify", strategy = "labeled_lines", "structured_response_parsed");
                Ok(ClassificationResult {
                    category,
                    reason,
                    recommendation,
                    confidence: bound_confidence(parse_confidence_text(&confidence)),
                })
            }
            partial => Err(NormalizeError::MissingFields(missing_fields([
                partial.category.is_some(),
                partial.reason.is_some(),
                partial.recommendation.is_some(),
                partial.confidence.is_some(),
            ]))),
        }
    }
}

fn scan_labeled_lines(text: &str) -> LabeledFields {
    let mut fields = LabeledFields::default();
    for line in text.lines() {
        let Some((label, value)) = split_label(line) else {
            continue;
        };
        if label.chars().count() > MAX_LABEL_CHARS {
            continue;
        }
        let value = clean_value(value);
        if value.is_empty() {
            continue;
        }
        let label = label.to_lowercase();
        let slot = if matches_any(&label, CATEGORY_LABELS) {
            &mut fields.category
        } else if matches_any(&label, REASON_LABELS) {
            &mut fields.reason
        } else if matches_any(&label, RECOMMENDATION_LABELS) {
            &mut fields.recommendation
        } else if matches_any(&label, CONFIDENCE_LABELS) {
            &mut fields.confidence
        } else {
            continue;
        };
        if slot.is_none() {
            *slot = Some(value.to_string());
        }
    }
    fields
}

fn split_label(line: &str) -> Option<(&str, &str)> {
    let (idx, sep) = line
        .char_indices()
        .find(|(_, ch)| matches!(ch, ':' | '：'))?;
    Some((&line[..idx], &line[idx + sep.len_utf8()..]))
}

fn clean_value(value: &str) -> &str {
    value.trim_matches(|ch: char| ch.is_whitespace() || matches!(ch, '*' | '"' | '\'' | ','))
}

fn matches_any(label: &str, candidates: &[&str]) -> bool {
    candidates.iter().any(|candidate| label.contains(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalize(raw: &str) -> ClassificationResult {
        try_normalize(raw).unwrap_or_else(|_| ClassificationResult::fallback())
    }

    fn expected(category: &str, reason: &str, recommendation: &str, confidence: f64) -> ClassificationResult {
        ClassificationResult {
            category: category.into(),
            reason: reason.into(),
            recommendation: recommendation.into(),
            confidence,
        }
    }

    #[test]
    fn fenced_json_inside_prose_is_extracted() {
        let raw = "Some text ```json\n{\"category\":\"Quality Issues\",\"reason\":\"cracked screen\",\"recommendation\":\"Repair and Resell\",\"confidence\":0.9}\n``` trailing";
        assert_eq!(
            normalize(raw),
            expected("Quality Issues", "cracked screen", "Repair and Resell", 0.9)
        );
    }

    #[test]
    fn plain_refusal_yields_fallback() {
        let result = normalize("I cannot determine a category.");
        assert_eq!(result, ClassificationResult::fallback());
        assert_eq!(result.category, "Uncategorized");
        assert_eq!(result.reason, "");
        assert_eq!(result.recommendation, "Manual review");
        assert_eq!(result.confidence, 0.0);
        assert_eq!(
            try_normalize("I cannot determine a category."),
            Err(NormalizeError::Unstructured)
        );
    }

    #[test]
    fn bare_json_parses_directly() {
        let raw = r#"  {"category":"Size Mismatch","reason":"too small","recommendation":"Direct Resale","confidence":0.75}  "#;
        assert_eq!(
            normalize(raw),
            expected("Size Mismatch", "too small", "Direct Resale", 0.75)
        );
    }

    #[test]
    fn second_fence_is_used_when_first_is_not_an_object() {
        let raw = "```text\nnot json\n```\nand then\n```\n{\"category\":\"Logistics Issues\",\"reason\":\"box crushed\",\"recommendation\":\"Discounted Sale\",\"confidence\":\"0.6\"}\n```";
        assert_eq!(
            normalize(raw),
            expected("Logistics Issues", "box crushed", "Discounted Sale", 0.6)
        );
    }

    #[test]
    fn unterminated_fence_still_parses() {
        let raw = "```json\n{\"category\":\"Delayed Delivery\",\"reason\":\"late\",\"recommendation\":\"Direct Resale\",\"confidence\":1}";
        assert_eq!(
            normalize(raw),
            expected("Delayed Delivery", "late", "Direct Resale", 1.0)
        );
    }

    #[test]
    fn brace_span_is_last_structured_attempt() {
        let raw = "Result follows {\"category\":\"Wrong Item Received\",\"reason\":\"blue instead of red\",\"recommendation\":\"Return to Supplier\",\"confidence\":0.8} hope that helps";
        assert_eq!(
            normalize(raw),
            expected("Wrong Item Received", "blue instead of red", "Return to Supplier", 0.8)
        );
    }

    #[test]
    fn object_between_braced_prose_is_found() {
        let raw = "Result {\"category\":\"Quality Issues\",\"reason\":\"cracked\",\"recommendation\":\"Repair and Resell\",\"confidence\":0.9} (format was {json})";
        assert_eq!(
            try_normalize(raw),
            Ok(expected("Quality Issues", "cracked", "Repair and Resell", 0.9))
        );

        let leading = "Template {category, reason} filled in: {\"category\":\"Changed Mind\",\"reason\":\"gift\",\"recommendation\":\"Direct Resale\",\"confidence\":0.7}";
        assert_eq!(
            try_normalize(leading),
            Ok(expected("Changed Mind", "gift", "Direct Resale", 0.7))
        );
    }

    #[test]
    fn embedded_object_without_category_reports_missing_fields() {
        let raw = "Note {x} then {\"reason\":\"torn\",\"confidence\":0.2} end {y}";
        assert_eq!(
            try_normalize(raw),
            Err(NormalizeError::MissingFields(vec!["category", "recommendation"]))
        );
    }

    #[test]
    fn object_missing_fields_falls_back() {
        let raw = r#"{"category":"Quality Issues","confidence":0.4}"#;
        assert_eq!(
            try_normalize(raw),
            Err(NormalizeError::MissingFields(vec!["reason", "recommendation"]))
        );
        assert_eq!(normalize(raw), ClassificationResult::fallback());
    }

    #[test]
    fn null_field_counts_as_missing() {
        let raw = r#"{"category":"Quality Issues","reason":null,"recommendation":"Direct Resale","confidence":0.4}"#;
        assert_eq!(
            try_normalize(raw),
            Err(NormalizeError::MissingFields(vec!["reason"]))
        );
    }

    #[test]
    fn keys_match_case_insensitively() {
        let raw = r#"{"Category":"Quality Issues","Reason":"dent","Recommendation":"Discounted Sale","Confidence":0.5}"#;
        assert_eq!(
            normalize(raw),
            expected("Quality Issues", "dent", "Discounted Sale", 0.5)
        );
    }

    #[test]
    fn english_labeled_lines_are_scanned() {
        let raw = "Here is my analysis.\n**Category:** Quality Issues\nReason: hinge snapped\nRecommended disposition: Repair and Resell\nConfidence: 0.82\n";
        assert_eq!(
            normalize(raw),
            expected("Quality Issues", "hinge snapped", "Repair and Resell", 0.82)
        );
    }

    #[test]
    fn chinese_labeled_lines_are_scanned() {
        let raw = "退货类别：质量问题\n具体原因：屏幕有划痕\n处理建议：退回供应商\n置信度：0.9";
        assert_eq!(
            normalize(raw),
            expected("质量问题", "屏幕有划痕", "退回供应商", 0.9)
        );
    }

    #[test]
    fn label_must_precede_separator() {
        let raw = "Category: Quality Issues (reason unclear)\nReason: scratched lens\nRecommendation: Discounted Sale\nConfidence: 0.7";
        let result = normalize(raw);
        assert_eq!(result.category, "Quality Issues (reason unclear)");
        assert_eq!(result.reason, "scratched lens");
    }

    #[test]
    fn partial_labeled_lines_fall_back() {
        let raw = "Category: Quality Issues\nReason: cracked";
        assert_eq!(
            try_normalize(raw),
            Err(NormalizeError::MissingFields(vec!["recommendation", "confidence"]))
        );
    }

    #[test]
    fn non_numeric_confidence_coerces_to_zero() {
        let raw = r#"{"category":"Quality Issues","reason":"x","recommendation":"Direct Resale","confidence":"high"}"#;
        assert_eq!(normalize(raw).confidence, 0.0);
        let labeled = "Category: A\nReason: B\nRecommendation: C\nConfidence: very sure";
        assert_eq!(normalize(labeled).confidence, 0.0);
    }

    #[test]
    fn confidence_is_bounded() {
        assert_eq!(coerce_confidence(&json!(1.7)), 1.0);
        assert_eq!(coerce_confidence(&json!(-0.2)), 0.0);
        assert_eq!(coerce_confidence(&json!("85%")), 0.85);
        assert_eq!(coerce_confidence(&json!(" 0.33 ")), 0.33);
        assert_eq!(coerce_confidence(&json!("NaN")), 0.0);
        assert_eq!(coerce_confidence(&json!(true)), 0.0);
        assert_eq!(coerce_confidence(&json!({"value": 0.5})), 0.0);
    }

    #[test]
    fn non_string_text_fields_use_json_text() {
        let raw = r#"{"category":7,"reason":"r","recommendation":"Direct Resale","confidence":0.1}"#;
        assert_eq!(normalize(raw).category, "7");
    }

    #[test]
    fn json_array_is_not_a_structured_object() {
        assert_eq!(try_normalize("[1, 2, 3]"), Err(NormalizeError::Unstructured));
    }
}
