use crate::classify::ClassificationResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReturnStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Rejected,
}

impl ReturnStatus {
    pub const ALL: [ReturnStatus; 4] = [
        ReturnStatus::Pending,
        ReturnStatus::Processing,
        ReturnStatus::Completed,
        ReturnStatus::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnStatus::Pending => "pending",
            ReturnStatus::Processing => "processing",
            ReturnStatus::Completed => "completed",
            ReturnStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "pending" => Some(ReturnStatus::Pending),
            "processing" => Some(ReturnStatus::Processing),
            "completed" => Some(ReturnStatus::Completed),
            "rejected" => Some(ReturnStatus::Rejected),
            _ => None,
        }
    }

    /// Records in these states are picked up by batch classification.
    pub fn awaits_triage(&self) -> bool {
        matches!(self, ReturnStatus::Pending | ReturnStatus::Processing)
    }
}

/// Product fields rendered into the classification prompt.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProductMetadata {
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub price: Option<f64>,
}

impl ProductMetadata {
    pub fn prompt_lines(&self) -> String {
        let mut lines = Vec::new();
        if let Some(id) = self.product_id.as_deref().filter(|s| !s.trim().is_empty()) {
            lines.push(format!("product_id: {id}"));
        }
        if !self.name.trim().is_empty() {
            lines.push(format!("product_name: {}", self.name.trim()));
        }
        if !self.category.trim().is_empty() {
            lines.push(format!("product_category: {}", self.category.trim()));
        }
        if let Some(price) = self.price {
            lines.push(format!("original_price: {price:.2}"));
        }
        lines.join("\n")
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReturnRecord {
    pub id: i64,
    pub order_id: String,
    pub product_id: String,
    pub product_name: String,
    pub product_category: String,
    pub return_reason: Option<String>,
    pub customer_description: String,
    pub customer_email: Option<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    pub status: ReturnStatus,
    pub original_price: Option<f64>,
    pub resale_price: Option<f64>,
    pub classification: Option<ClassificationResult>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the record moves to `completed`.
    pub processed_at: Option<DateTime<Utc>>,
}

impl ReturnRecord {
    pub fn product_metadata(&self) -> ProductMetadata {
        ProductMetadata {
            product_id: Some(self.product_id.clone()),
            name: self.product_name.clone(),
            category: self.product_category.clone(),
            price: self.original_price,
        }
    }

    pub fn classification_description(&self) -> String {
        classification_text(&self.customer_description, self.return_reason.as_deref())
    }
}

/// Customer text plus the stated reason, as sent to the classifier.
pub fn classification_text(description: &str, return_reason: Option<&str>) -> String {
    match return_reason.map(str::trim).filter(|s| !s.is_empty()) {
        Some(reason) => format!("{}\nStated return reason: {reason}", description.trim()),
        None => description.trim().to_string(),
    }
}

/// Insert payload for a return record. `classification` may be filled in
/// up front when the caller already ran the classifier.
#[derive(Debug, Clone, Deserialize)]
pub struct NewReturn {
    pub order_id: String,
    pub product_id: String,
    pub product_name: String,
    #[serde(default)]
    pub product_category: String,
    #[serde(default)]
    pub return_reason: Option<String>,
    #[serde(default)]
    pub customer_description: String,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub status: ReturnStatus,
    #[serde(default)]
    pub original_price: Option<f64>,
    #[serde(skip)]
    pub classification: Option<ClassificationResult>,
    #[serde(skip)]
    pub tags: Vec<String>,
}

impl NewReturn {
    pub fn product_metadata(&self) -> ProductMetadata {
        ProductMetadata {
            product_id: Some(self.product_id.clone()),
            name: self.product_name.clone(),
            category: self.product_category.clone(),
            price: self.original_price,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationUpdate {
    pub id: i64,
    pub result: ClassificationResult,
}

/// Body of `PATCH /returns/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusChange {
    pub status: ReturnStatus,
    #[serde(default)]
    pub resale_price: Option<f64>,
    /// Replaces the generated history note when the status changes.
    #[serde(default)]
    pub notes: Option<String>,
}

impl StatusChange {
    pub fn new(status: ReturnStatus) -> Self {
        Self {
            status,
            resale_price: None,
            notes: None,
        }
    }

    /// History note for a move away from `previous`.
    pub fn history_note(&self, previous: ReturnStatus) -> String {
        match self.notes.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(notes) => notes.to_string(),
            None => format!(
                "Status changed from {} to {}",
                previous.as_str(),
                self.status.as_str()
            ),
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HistoryEntry {
    pub id: i64,
    pub return_id: i64,
    pub status: ReturnStatus,
    pub notes: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LabelCount {
    pub label: String,
    pub count: u64,
    pub percentage: f64,
}

impl LabelCount {
    /// Highest count first, ties by label. Percentages are of the summed counts.
    pub fn ranked(counts: impl IntoIterator<Item = (String, u64)>) -> Vec<LabelCount> {
        let counts: Vec<(String, u64)> = counts.into_iter().collect();
        let total: u64 = counts.iter().map(|(_, count)| count).sum();
        let mut ranked: Vec<LabelCount> = counts
            .into_iter()
            .map(|(label, count)| LabelCount {
                label,
                count,
                percentage: percentage(count as f64, total as f64),
            })
            .collect();
        ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
        ranked
    }
}

/// Totals served by `GET /analytics/summary`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReturnSummary {
    pub total_returns: u64,
    pub total_amount: f64,
    pub recovered_amount: f64,
    /// Resale value as a percentage of the original value.
    pub recovery_rate: f64,
    /// Mean days from creation to completion over completed records.
    pub avg_processing_days: f64,
    /// Counts by product category.
    pub categories: Vec<LabelCount>,
    /// Counts by model-assigned reason; unclassified and empty reasons are skipped.
    pub reasons: Vec<LabelCount>,
}

#[derive(Debug, Default)]
pub struct SummaryTotals {
    pub total_returns: u64,
    pub total_amount: f64,
    pub recovered_amount: f64,
    pub processing_spans: Vec<(DateTime<Utc>, DateTime<Utc>)>,
}

impl ReturnSummary {
    pub fn new(
        totals: SummaryTotals,
        categories: impl IntoIterator<Item = (String, u64)>,
        reasons: impl IntoIterator<Item = (String, u64)>,
    ) -> Self {
        let days: Vec<f64> = totals
            .processing_spans
            .iter()
            .map(|(created, processed)| (*processed - *created).num_seconds() as f64 / 86_400.0)
            .collect();
        let avg_processing_days = if days.is_empty() {
            0.0
        } else {
            days.iter().sum::<f64>() / days.len() as f64
        };
        Self {
            total_returns: totals.total_returns,
            total_amount: totals.total_amount,
            recovered_amount: totals.recovered_amount,
            recovery_rate: percentage(totals.recovered_amount, totals.total_amount),
            avg_processing_days,
            categories: LabelCount::ranked(categories),
            reasons: LabelCount::ranked(reasons),
        }
    }
}

fn percentage(part: f64, whole: f64) -> f64 {
    if whole > 0.0 { part / whole * 100.0 } else { 0.0 }
}
