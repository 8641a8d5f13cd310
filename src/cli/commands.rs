use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::json;

use crate::cli::flags::{Cli, Command};
use crate::config::{load_config, AppConfig};
use crate::core::breaker::{BreakerRegistry, BreakerSettings};
use crate::core::cache::ResultCache;
use crate::core::store::Store;
use crate::core::time::{Clock, SystemClock};
use crate::core::types::{DiscoveredLink, LinkRecord, Task};
use crate::pipeline::batcher::BatchOrchestrator;
use crate::pipeline::driver::{DriverSettings, TaskDriver};
use crate::pipeline::enricher::Enricher;
use crate::pipeline::reporter::{cached_harmful_report, cached_task_report};
use crate::sources::classifier::{HttpClassifier, LinkClassifier};
use crate::sources::threat_list::{SafeBrowsingProvider, ThreatListProvider};
use crate::sources::whois::{RdapProvider, WhoisProvider};

pub async fn run(cli: Cli) -> Result<()> {
    let cfg = load_config(cli.config.as_deref()).context("loading config")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let driver = build_driver(&cfg, clock.clone())?;

    match cli.command {
        Command::Submit {
            domain,
            task_id,
            links,
        } => run_submit(&driver, clock.as_ref(), &domain, &task_id, &links),
        Command::Sweep {
            limit,
            max_age_hours,
            force,
        } => {
            let limit = limit.unwrap_or(cfg.sweep.limit);
            let max_age_hours = max_age_hours.unwrap_or(cfg.sweep.max_age_hours);
            if max_age_hours <= 0 {
                return Err(anyhow!("--max-age-hours must be positive"));
            }
            let report = driver.sweep(limit, max_age_hours, force).await?;
            print_json(&report)
        }
        Command::Process { task_id, force } => {
            let outcome = driver.process_by_id(&task_id, force).await?;
            print_json(&json!({"task_id": task_id, "outcome": outcome}))
        }
        Command::Status { task_id } => {
            let cache = driver.cache().clone();
            let report = driver.with_store(|s| cached_task_report(s, &cache, &task_id))?;
            print_json(&report)
        }
        Command::Harmful { domain } => {
            let cache = driver.cache().clone();
            let domain = domain.trim().to_lowercase();
            let report = driver.with_store(|s| cached_harmful_report(s, &cache, &domain))?;
            print_json(&report)
        }
    }
}

/// Wire the store, the classifier behind its breaker and the enrichment
/// providers into a driver.
pub fn build_driver(cfg: &AppConfig, clock: Arc<dyn Clock>) -> Result<TaskDriver> {
    let store = Store::new(Path::new(&cfg.db_path))
        .with_context(|| format!("opening store at {}", cfg.db_path))?;
    let cache = Arc::new(ResultCache::new(Duration::from_secs(cfg.cache_ttl_seconds)));

    let breakers = BreakerRegistry::new(
        BreakerSettings {
            enabled: cfg.classifier.enabled,
            failure_threshold: cfg.breaker.failure_threshold,
            cooldown: chrono::Duration::seconds(cfg.breaker.cooldown_seconds as i64),
        },
        clock.clone(),
    );
    let classifier: Arc<dyn LinkClassifier> = Arc::new(HttpClassifier::new(&cfg.classifier)?);
    if !classifier.is_configured() {
        tracing::warn!(
            classifier = classifier.name(),
            "classifier has no endpoint or key ({}); detection will be skipped",
            cfg.classifier.api_key_env
        );
    }
    let orchestrator = BatchOrchestrator::new(
        classifier.clone(),
        breakers.get(classifier.name()),
        cfg.classifier.max_items_per_batch,
        Duration::from_millis(cfg.classifier.timeout_ms),
    );

    let whois: Option<Arc<dyn WhoisProvider>> = if cfg.whois.enabled {
        Some(Arc::new(RdapProvider::new(&cfg.whois, clock.clone())?))
    } else {
        None
    };
    let threats: Option<Arc<dyn ThreatListProvider>> = if cfg.threat_list.enabled {
        match SafeBrowsingProvider::new(&cfg.threat_list)? {
            Some(provider) => Some(Arc::new(provider)),
            None => {
                tracing::info!(
                    "threat list key ({}) not set; threat checks disabled",
                    cfg.threat_list.api_key_env
                );
                None
            }
        }
    } else {
        None
    };

    Ok(TaskDriver::new(
        Arc::new(Mutex::new(store)),
        Arc::new(orchestrator),
        Arc::new(Enricher::new(whois, threats, clock.clone())),
        cache,
        clock,
        DriverSettings::from(&cfg.sweep),
    ))
}

#[derive(Debug, Serialize)]
struct SubmitSummary {
    task_id: String,
    domain: String,
    created: bool,
    links: usize,
}

fn run_submit(
    driver: &TaskDriver,
    clock: &dyn Clock,
    domain: &str,
    task_id: &str,
    links_path: &Path,
) -> Result<()> {
    let domain = domain.trim().to_lowercase();
    if domain.is_empty() || task_id.trim().is_empty() {
        return Err(anyhow!("domain and task id must not be empty"));
    }
    let records = read_discovered_links(links_path, &domain, task_id)?;

    let created = driver.with_store(|s| {
        let now = clock.now();
        let created = match s.get_task(task_id)? {
            Some(_) => false,
            None => {
                s.upsert_task(&Task::new(task_id, domain.as_str(), now), now)?;
                true
            }
        };
        s.upsert_links(&records)?;
        Ok(created)
    })?;
    driver.cache().invalidate(task_id, &domain);
    tracing::info!(task_id, domain = %domain, links = records.len(), created, "task submitted");

    print_json(&SubmitSummary {
        task_id: task_id.to_string(),
        domain,
        created,
        links: records.len(),
    })
}

fn read_discovered_links(path: &Path, domain: &str, task_id: &str) -> Result<Vec<LinkRecord>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut records = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let link: DiscoveredLink = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid discovered link", path.display(), idx + 1))?;
        if link.source_url.trim().is_empty() {
            return Err(anyhow!("{}:{}: empty source_url", path.display(), idx + 1));
        }
        records.push(link.into_record(domain, task_id));
    }
    Ok(records)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
