use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::WhoisConfig;
use crate::core::error::PipelineError;
use crate::core::time::Clock;
use crate::core::types::WhoisSignals;
use crate::sources::rate_limiter::RateLimiter;

/// Outcome of a registration-data lookup. Missing data is not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum WhoisLookup {
    Found(WhoisSignals),
    NoData,
}

#[async_trait]
pub trait WhoisProvider: Send + Sync {
    async fn lookup(&self, domain: &str) -> Result<WhoisLookup, PipelineError>;
}

/// RDAP lookups plus a DNS resolution for the hosting IP.
pub struct RdapProvider {
    client: Client,
    base_url: String,
    resolve_ip: bool,
    pacing: Mutex<RateLimiter>,
    clock: Arc<dyn Clock>,
}

impl RdapProvider {
    pub fn new(cfg: &WhoisConfig, clock: Arc<dyn Clock>) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .user_agent(concat!("backlink-risk/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(PipelineError::from)?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            resolve_ip: cfg.resolve_ip,
            pacing: Mutex::new(RateLimiter::new(Duration::from_millis(cfg.min_interval_ms))),
            clock,
        })
    }

    async fn resolve(&self, domain: &str) -> Option<String> {
        if !self.resolve_ip {
            return None;
        }
        match tokio::net::lookup_host((domain, 80)).await {
            Ok(mut addrs) => addrs.next().map(|a| a.ip().to_string()),
            Err(err) => {
                tracing::debug!(domain, "dns lookup failed: {}", err);
                None
            }
        }
    }
}

#[async_trait]
impl WhoisProvider for RdapProvider {
    async fn lookup(&self, domain: &str) -> Result<WhoisLookup, PipelineError> {
        self.pacing.lock().await.wait().await;
        let url = format!("{}/domain/{}", self.base_url, domain);
        let resp = self.client.get(&url).send().await.map_err(PipelineError::from)?;
        let mut signals = if resp.status() == reqwest::StatusCode::NOT_FOUND {
            WhoisSignals::default()
        } else if !resp.status().is_success() {
            return Err(PipelineError::Provider(format!(
                "rdap {} returned {}",
                domain,
                resp.status()
            )));
        } else {
            let json: Value = resp.json().await.map_err(PipelineError::from)?;
            parse_rdap(&json, self.clock.now())
        };
        signals.ip = self.resolve(domain).await;
        if signals == WhoisSignals::default() {
            Ok(WhoisLookup::NoData)
        } else {
            Ok(WhoisLookup::Found(signals))
        }
    }
}

/// Registrar name and age (days since the `registration` event).
pub fn parse_rdap(json: &Value, now: DateTime<Utc>) -> WhoisSignals {
    let mut signals = WhoisSignals::default();
    if let Some(events) = json.get("events").and_then(|e| e.as_array()) {
        for ev in events {
            if ev.get("eventAction").and_then(|a| a.as_str()) == Some("registration") {
                if let Some(date_str) = ev.get("eventDate").and_then(|d| d.as_str()) {
                    if let Ok(dt) = DateTime::parse_from_rfc3339(date_str) {
                        let days = (now - dt.with_timezone(&Utc)).num_days();
                        signals.domain_age_days = Some(days.max(0));
                    }
                }
            }
        }
    }
    if let Some(entities) = json.get("entities").and_then(|e| e.as_array()) {
        for entity in entities {
            let is_registrar = entity
                .get("roles")
                .and_then(|r| r.as_array())
                .map(|roles| roles.iter().any(|r| r.as_str() == Some("registrar")))
                .unwrap_or(false);
            if is_registrar {
                signals.registrar = vcard_name(entity);
                break;
            }
        }
    }
    signals
}

fn vcard_name(entity: &Value) -> Option<String> {
    let props = entity.get("vcardArray")?.get(1)?.as_array()?;
    props.iter().find_map(|prop| {
        let prop = prop.as_array()?;
        if prop.first()?.as_str()? == "fn" {
            prop.get(3)?.as_str().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_registration_age_and_registrar() {
        let now = DateTime::parse_from_rfc3339("2025-01-11T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let body = json!({
            "events": [
                {"eventAction": "expiration", "eventDate": "2026-01-01T00:00:00Z"},
                {"eventAction": "registration", "eventDate": "2025-01-01T00:00:00Z"}
            ],
            "entities": [
                {"roles": ["abuse"], "vcardArray": ["vcard", [["fn", {}, "text", "Abuse Desk"]]]},
                {"roles": ["registrar"], "vcardArray": ["vcard", [["version", {}, "text", "4.0"], ["fn", {}, "text", "NameCheap, Inc."]]]}
            ]
        });
        let signals = parse_rdap(&body, now);
        assert_eq!(signals.domain_age_days, Some(10));
        assert_eq!(signals.registrar.as_deref(), Some("NameCheap, Inc."));
    }

    #[test]
    fn empty_rdap_yields_no_signals() {
        assert_eq!(parse_rdap(&json!({}), Utc::now()), WhoisSignals::default());
    }
}
