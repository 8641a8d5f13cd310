use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::config::ThreatListConfig;
use crate::core::error::PipelineError;
use crate::core::types::ThreatMatch;

#[async_trait]
pub trait ThreatListProvider: Send + Sync {
    /// Matches for any of `urls`. An empty result means every URL is clean.
    async fn check(&self, urls: &[String]) -> Result<Vec<ThreatMatch>, PipelineError>;
}

/// Safe-Browsing-style `threatMatches:find` client.
pub struct SafeBrowsingProvider {
    client: Client,
    base_url: String,
    api_key: String,
    max_urls: usize,
}

#[derive(Debug, Deserialize, Default)]
struct FindResponse {
    #[serde(default)]
    matches: Vec<ThreatMatch>,
}

impl SafeBrowsingProvider {
    /// `None` when no API key is available.
    pub fn new(cfg: &ThreatListConfig) -> Result<Option<Self>, PipelineError> {
        let Some(api_key) = std::env::var(&cfg.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
        else {
            return Ok(None);
        };
        Ok(Some(Self::with_key(cfg, api_key)?))
    }

    pub fn with_key(cfg: &ThreatListConfig, api_key: impl Into<String>) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .user_agent(concat!("backlink-risk/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(PipelineError::from)?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            max_urls: cfg.max_urls_per_request.max(1),
        })
    }
}

#[async_trait]
impl ThreatListProvider for SafeBrowsingProvider {
    async fn check(&self, urls: &[String]) -> Result<Vec<ThreatMatch>, PipelineError> {
        let mut out = Vec::new();
        for chunk in urls.chunks(self.max_urls) {
            let entries: Vec<_> = chunk.iter().map(|u| json!({ "url": u })).collect();
            let body = json!({
                "client": {
                    "clientId": "backlink-risk",
                    "clientVersion": env!("CARGO_PKG_VERSION"),
                },
                "threatInfo": {
                    "threatTypes": [
                        "MALWARE",
                        "SOCIAL_ENGINEERING",
                        "UNWANTED_SOFTWARE",
                        "POTENTIALLY_HARMFUL_APPLICATION"
                    ],
                    "platformTypes": ["ANY_PLATFORM"],
                    "threatEntryTypes": ["URL"],
                    "threatEntries": entries,
                }
            });
            let url = format!("{}/v4/threatMatches:find", self.base_url);
            let resp = self
                .client
                .post(&url)
                .query(&[("key", self.api_key.as_str())])
                .json(&body)
                .send()
                .await
                .map_err(PipelineError::from)?;
            if !resp.status().is_success() {
                return Err(PipelineError::Provider(format!(
                    "threat list returned {}",
                    resp.status()
                )));
            }
            let text = resp.text().await.map_err(PipelineError::from)?;
            let parsed: FindResponse = if text.trim().is_empty() {
                FindResponse::default()
            } else {
                serde_json::from_str(&text)?
            };
            out.extend(parsed.matches);
        }
        Ok(out)
    }
}
