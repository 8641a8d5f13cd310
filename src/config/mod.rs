use std::{fs, path::Path};

use serde::Deserialize;

use crate::core::breaker::{DEFAULT_COOLDOWN_SECONDS, DEFAULT_FAILURE_THRESHOLD};
use crate::core::error::PipelineError;

/// Hard per-request item cap of the classifier.
pub const CLASSIFIER_ITEM_CAP: usize = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_classifier_name")]
    pub name: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_classifier_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_classifier_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_batch_size")]
    pub max_items_per_batch: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_sweep_limit")]
    pub limit: usize,
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: i64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_grace_hours")]
    pub no_backlinks_grace_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhoisConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rdap_url")]
    pub base_url: String,
    #[serde(default = "default_provider_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_min_interval")]
    pub min_interval_ms: u64,
    #[serde(default = "default_true")]
    pub resolve_ip: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreatListConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_threat_url")]
    pub base_url: String,
    #[serde(default = "default_threat_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_provider_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_urls")]
    pub max_urls_per_request: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub whois: WhoisConfig,
    #[serde(default)]
    pub threat_list: ThreatListConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        let cap = self.classifier.max_items_per_batch;
        if cap == 0 || cap > CLASSIFIER_ITEM_CAP {
            return Err(PipelineError::Config(format!(
                "classifier.max_items_per_batch must be within 1..={} (got {})",
                CLASSIFIER_ITEM_CAP, cap
            )));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(PipelineError::Config(
                "breaker.failure_threshold must be positive".into(),
            ));
        }
        if self.sweep.concurrency == 0 {
            return Err(PipelineError::Config(
                "sweep.concurrency must be positive".into(),
            ));
        }
        if self.sweep.max_age_hours <= 0 {
            return Err(PipelineError::Config(
                "sweep.max_age_hours must be positive".into(),
            ));
        }
        Ok(())
    }
}

pub fn load_config(path: Option<&str>) -> Result<AppConfig, PipelineError> {
    let default_path = Path::new("config/backlink-risk.toml");
    let path = path.map(Path::new).unwrap_or(default_path);

    let cfg = if path.exists() {
        let content = fs::read_to_string(path).map_err(|e| PipelineError::Config(e.to_string()))?;
        toml::from_str(&content).map_err(|e| PipelineError::Config(e.to_string()))?
    } else {
        tracing::debug!("config {} not found; using defaults", path.display());
        AppConfig::default()
    };
    cfg.validate()?;
    Ok(cfg)
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            cache_ttl_seconds: default_cache_ttl(),
            classifier: ClassifierConfig::default(),
            breaker: BreakerConfig::default(),
            sweep: SweepConfig::default(),
            whois: WhoisConfig::default(),
            threat_list: ThreatListConfig::default(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: default_classifier_name(),
            base_url: String::new(),
            api_key_env: default_classifier_key_env(),
            timeout_ms: default_classifier_timeout(),
            max_items_per_batch: default_batch_size(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_threshold(),
            cooldown_seconds: default_cooldown(),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            limit: default_sweep_limit(),
            max_age_hours: default_max_age_hours(),
            concurrency: default_concurrency(),
            no_backlinks_grace_hours: default_grace_hours(),
        }
    }
}

impl Default for WhoisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_rdap_url(),
            timeout_ms: default_provider_timeout(),
            min_interval_ms: default_min_interval(),
            resolve_ip: true,
        }
    }
}

impl Default for ThreatListConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_threat_url(),
            api_key_env: default_threat_key_env(),
            timeout_ms: default_provider_timeout(),
            max_urls_per_request: default_max_urls(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_db_path() -> String {
    "data/backlinks.db".into()
}
fn default_cache_ttl() -> u64 {
    600
}
fn default_classifier_name() -> String {
    "pbn-detector".into()
}
fn default_classifier_key_env() -> String {
    "PBN_DETECTOR_API_KEY".into()
}
fn default_classifier_timeout() -> u64 {
    30_000
}
fn default_batch_size() -> usize {
    CLASSIFIER_ITEM_CAP
}
fn default_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}
fn default_cooldown() -> u64 {
    DEFAULT_COOLDOWN_SECONDS
}
fn default_sweep_limit() -> usize {
    25
}
fn default_max_age_hours() -> i64 {
    24
}
fn default_concurrency() -> usize {
    2
}
fn default_grace_hours() -> i64 {
    48
}
fn default_rdap_url() -> String {
    "https://rdap.org".into()
}
fn default_threat_url() -> String {
    "https://safebrowsing.googleapis.com".into()
}
fn default_threat_key_env() -> String {
    "SAFE_BROWSING_API_KEY".into()
}
fn default_provider_timeout() -> u64 {
    5_000
}
fn default_min_interval() -> u64 {
    250
}
fn default_max_urls() -> usize {
    500
}
