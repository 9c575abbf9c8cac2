//! Client for the external content safety analysis capability.
//!
//! Text is safe only when no category reports any severity at all; images
//! are held to an ordinal threshold (severity 2 and up is refused). The
//! capability is rate limited upstream, which is why the worker throttles
//! calls behind its own semaphore rather than the queue's concurrency cap.

use crate::config::SafetyConfig;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors from the safety analysis capability
#[derive(Error, Debug)]
pub enum SafetyError {
    #[error("Safety analysis request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Safety analysis rejected the request: status {status}: {body}")]
    Api { status: u16, body: String },
}

/// Severity reported for one analysis category
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryAnalysis {
    pub category: String,
    #[serde(default)]
    pub severity: u8,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisResponse {
    #[serde(default)]
    categories_analysis: Vec<CategoryAnalysis>,
}

#[derive(Debug, Serialize)]
struct TextAnalysisRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct ImageAnalysisRequest {
    image: ImageData,
}

#[derive(Debug, Serialize)]
struct ImageData {
    content: String,
}

/// Text content is safe only when every category reports zero severity
fn text_is_safe(categories: &[CategoryAnalysis]) -> bool {
    categories.iter().all(|c| c.severity == 0)
}

/// Image content is safe while every category stays below the threshold
fn image_is_safe(categories: &[CategoryAnalysis], threshold: u8) -> bool {
    categories.iter().all(|c| c.severity < threshold)
}

/// HTTP client for the safety analysis endpoint
pub struct SafetyClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    api_version: String,
    image_severity_threshold: u8,
}

impl SafetyClient {
    /// Create a new client from configuration
    pub fn new(config: &SafetyConfig, timeout: Duration) -> Result<Self, SafetyError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_version: config.api_version.clone(),
            image_severity_threshold: config.image_severity_threshold,
        })
    }

    /// Analyze a piece of text; returns whether it is safe to publish
    #[instrument(skip(self, text), fields(len = text.len()))]
    pub async fn analyze_text(&self, text: &str) -> Result<bool, SafetyError> {
        let response = self
            .analyze("text:analyze", &TextAnalysisRequest { text })
            .await?;

        let safe = text_is_safe(&response.categories_analysis);
        debug!(safe = safe, categories = response.categories_analysis.len(), "Text analyzed");
        Ok(safe)
    }

    /// Analyze image bytes; returns whether the image is safe to publish
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn analyze_image(&self, bytes: &[u8]) -> Result<bool, SafetyError> {
        let request = ImageAnalysisRequest {
            image: ImageData {
                content: STANDARD.encode(bytes),
            },
        };
        let response = self.analyze("image:analyze", &request).await?;

        for category in &response.categories_analysis {
            info!(
                category = %category.category,
                severity = category.severity,
                "Image category severity"
            );
        }

        Ok(image_is_safe(
            &response.categories_analysis,
            self.image_severity_threshold,
        ))
    }

    async fn analyze<B: Serialize>(
        &self,
        operation: &str,
        body: &B,
    ) -> Result<AnalysisResponse, SafetyError> {
        let url = format!("{}/contentsafety/{}", self.endpoint, operation);

        let response = self
            .http
            .post(&url)
            .query(&[("api-version", self.api_version.as_str())])
            .header("Ocp-Apim-Subscription-Key", &self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SafetyError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn categories(severities: &[u8]) -> Vec<CategoryAnalysis> {
        severities
            .iter()
            .enumerate()
            .map(|(i, s)| CategoryAnalysis {
                category: format!("category-{i}"),
                severity: *s,
            })
            .collect()
    }

    #[test]
    fn test_text_safe_requires_all_zero() {
        assert!(text_is_safe(&categories(&[0, 0, 0])));
        assert!(!text_is_safe(&categories(&[0, 1, 0])));
        assert!(text_is_safe(&[]));
    }

    #[test]
    fn test_image_threshold_is_inclusive() {
        // severity 1 is tolerated, severity 2 is refused
        assert!(image_is_safe(&categories(&[0, 1]), 2));
        assert!(!image_is_safe(&categories(&[0, 2]), 2));
        assert!(!image_is_safe(&categories(&[4]), 2));
    }

    #[test]
    fn test_response_parsing() {
        let json = r#"{
            "categoriesAnalysis": [
                {"category": "Hate", "severity": 0},
                {"category": "Violence", "severity": 3}
            ]
        }"#;

        let response: AnalysisResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.categories_analysis.len(), 2);
        assert_eq!(response.categories_analysis[1].severity, 3);
        assert!(!text_is_safe(&response.categories_analysis));
    }

    #[test]
    fn test_response_without_categories() {
        let response: AnalysisResponse = serde_json::from_str("{}").unwrap();
        assert!(response.categories_analysis.is_empty());
    }
}
