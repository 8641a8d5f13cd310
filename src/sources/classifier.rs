use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ClassifierConfig;
use crate::core::error::{ClassifierError, PipelineError};
use crate::core::types::{BacklinksSummary, LinkRecord, VerdictItem};

/// The subset of a link record the classifier looks at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkPayload {
    pub source_url: String,
    pub source_domain: String,
    pub anchor_text: Option<String>,
    pub link_type: String,
    pub authority_rank: Option<i64>,
    pub link_count: i64,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub ip: Option<String>,
    pub asn: Option<String>,
    pub hosting_provider: Option<String>,
    pub registrar: Option<String>,
    pub domain_age_days: Option<i64>,
    pub content_fingerprint: Option<String>,
    pub threat_status: String,
    pub spam_score: Option<u8>,
}

impl From<&LinkRecord> for LinkPayload {
    fn from(r: &LinkRecord) -> Self {
        Self {
            source_url: r.source_url.clone(),
            source_domain: r.source_domain.clone(),
            anchor_text: r.anchor_text.clone(),
            link_type: r.link_type.as_str().to_string(),
            authority_rank: r.authority_rank,
            link_count: r.link_count,
            first_seen: r.first_seen,
            last_seen: r.last_seen,
            ip: r.ip.clone(),
            asn: r.asn.clone(),
            hosting_provider: r.hosting_provider.clone(),
            registrar: r.registrar.clone(),
            domain_age_days: r.domain_age_days,
            content_fingerprint: r.content_fingerprint.clone(),
            threat_status: r.threat_status.as_str().to_string(),
            spam_score: r.spam_score,
        }
    }
}

/// Aggregate context sent alongside every batch of one task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SummaryContext {
    pub total_backlinks: u64,
    pub unique_domains: u64,
    pub dofollow: u64,
    pub nofollow: u64,
    pub flagged_threats: u64,
}

impl SummaryContext {
    pub fn new(backlinks: &BacklinksSummary, flagged_threats: u64) -> Self {
        Self {
            total_backlinks: backlinks.total,
            unique_domains: backlinks.unique_domains,
            dofollow: backlinks.dofollow,
            nofollow: backlinks.nofollow,
            flagged_threats,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClassifierRequest {
    pub domain: String,
    /// Per-batch sub-identifier, `<task_id>_batch_<n>`.
    pub task_id: String,
    pub links: Vec<LinkPayload>,
    pub summary: SummaryContext,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClassifierResponse {
    #[serde(default)]
    pub items: Vec<VerdictItem>,
    #[serde(default)]
    pub summary: Value,
}

#[async_trait]
pub trait LinkClassifier: Send + Sync {
    /// Breaker key for this classifier.
    fn name(&self) -> &str;

    /// False when the service is administratively unavailable (no endpoint
    /// or credentials). Never retried.
    fn is_configured(&self) -> bool;

    async fn classify(&self, request: &ClassifierRequest)
        -> Result<ClassifierResponse, ClassifierError>;
}

/// JSON-over-HTTP link-risk classifier.
pub struct HttpClassifier {
    client: reqwest::Client,
    name: String,
    base_url: String,
    api_key: Option<String>,
    enabled: bool,
}

#[derive(Debug, Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<Box<ErrorBody>>,
}

impl HttpClassifier {
    pub fn new(cfg: &ClassifierConfig) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("backlink-risk/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(PipelineError::from)?;
        let api_key = std::env::var(&cfg.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());
        Ok(Self {
            client,
            name: cfg.name.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            enabled: cfg.enabled,
        })
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

#[async_trait]
impl LinkClassifier for HttpClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_configured(&self) -> bool {
        self.enabled && !self.base_url.is_empty() && self.api_key.is_some()
    }

    async fn classify(
        &self,
        request: &ClassifierRequest,
    ) -> Result<ClassifierResponse, ClassifierError> {
        let Some(api_key) = self.api_key.as_deref().filter(|_| self.is_configured()) else {
            return Err(ClassifierError::NotConfigured);
        };
        let url = format!("{}/v1/detect", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(request)
            .send()
            .await
            .map_err(ClassifierError::from)?;
        let status = resp.status();
        let body = resp.text().await.map_err(ClassifierError::from)?;
        if status.is_success() {
            return serde_json::from_str::<ClassifierResponse>(&body)
                .map_err(|e| ClassifierError::Malformed(e.to_string()));
        }
        Err(error_from_body(status.as_u16(), &body))
    }
}

fn error_from_body(status: u16, body: &str) -> ClassifierError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let (code, message) = match parsed.error {
        Some(inner) => (inner.code, inner.message),
        None => (parsed.code, parsed.message),
    };
    let code = code.unwrap_or_else(|| format!("http_{}", status));
    if code == "not_configured" {
        return ClassifierError::NotConfigured;
    }
    ClassifierError::Service {
        code,
        status,
        message: message.unwrap_or_else(|| body.chars().take(200).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_variants_map_to_service_errors() {
        match error_from_body(429, r#"{"code":"rate_limited","message":"slow down"}"#) {
            ClassifierError::Service { code, status, message } => {
                assert_eq!(code, "rate_limited");
                assert_eq!(status, 429);
                assert_eq!(message, "slow down");
            }
            other => panic!("unexpected {other:?}"),
        }
        match error_from_body(502, "upstream exploded") {
            ClassifierError::Service { code, .. } => assert_eq!(code, "http_502"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            error_from_body(503, r#"{"error":{"code":"not_configured"}}"#),
            ClassifierError::NotConfigured
        );
    }

    #[test]
    fn response_tolerates_missing_fields() {
        let resp: ClassifierResponse = serde_json::from_str(r#"{"items":[{"source_url":"https://a.net"}]}"#).unwrap();
        assert_eq!(resp.items.len(), 1);
        assert!(resp.items[0].probability.is_none());
        assert!(resp.summary.is_null());
    }
}
