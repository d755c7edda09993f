use crate::{llm::GeminiConfig, platform::PlatformConfig};
use once_cell::sync::Lazy;
use std::env;

/// Shared secret for `/metrics`, sent as `X-Metrics-Key`.
pub static METRICS_KEY: Lazy<Option<String>> = Lazy::new(|| non_empty_var("METRICS_KEY"));

/// Shared secret for `/openapi.json`, sent as `X-Docs-Key`.
pub static OPENAPI_KEY: Lazy<Option<String>> = Lazy::new(|| non_empty_var("OPENAPI_KEY"));

pub const DEFAULT_DATABASE_URL: &str = "sqlite://gemiturn.db?mode=rwc";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,
    pub gemini: GeminiConfig,
    pub platform: PlatformConfig,
    pub batch_default_limit: usize,
    pub batch_max_limit: usize,
    pub request_max_bytes: usize,
    pub queue_capacity: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let batch_max_limit = positive_or(env::var("BATCH_MAX_LIMIT").ok(), 100);
        Self {
            port: positive_or(env::var("PORT").ok(), 8000),
            database_url: non_empty_var("DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            gemini: GeminiConfig::from_env(),
            platform: PlatformConfig::from_env(),
            batch_default_limit: positive_or(env::var("BATCH_DEFAULT_LIMIT").ok(), 10)
                .min(batch_max_limit),
            batch_max_limit,
            request_max_bytes: positive_or(env::var("REQUEST_MAX_BYTES").ok(), 8 * 1024 * 1024),
            queue_capacity: positive_or(env::var("QUEUE_CAPACITY").ok(), 16),
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn positive_or<T>(raw: Option<String>, default: T) -> T
where
    T: std::str::FromStr + PartialOrd + Default,
{
    raw.and_then(|value| value.trim().parse::<T>().ok())
        .filter(|value| *value > T::default())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_or_rejects_zero_and_garbage() {
        assert_eq!(positive_or::<usize>(Some(" 25 ".into()), 10), 25);
        assert_eq!(positive_or::<usize>(Some("0".into()), 10), 10);
        assert_eq!(positive_or::<usize>(Some("ten".into()), 10), 10);
        assert_eq!(positive_or::<u16>(None, 8000), 8000);
    }
}
