use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use tracing::{debug, warn};

use crate::core::time::Clock;
use crate::core::types::{LinkRecord, ThreatStatus};
use crate::pipeline::normalizer::{content_fingerprint, normalize_source_url};
use crate::pipeline::reconciler::{apply_enrichment, apply_threat_list_verdict, threat_verdicts};
use crate::pipeline::scorer::score_links;
use crate::sources::threat_list::ThreatListProvider;
use crate::sources::whois::{WhoisLookup, WhoisProvider};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichmentReport {
    pub domains_looked_up: usize,
    pub whois_found: usize,
    pub whois_errors: usize,
    pub urls_checked: usize,
    pub urls_flagged: usize,
    pub threat_error: Option<String>,
}

/// Pre-classification enrichment. Never fails: provider errors are logged and
/// the affected fields stay as they were.
pub struct Enricher {
    whois: Option<Arc<dyn WhoisProvider>>,
    threats: Option<Arc<dyn ThreatListProvider>>,
    clock: Arc<dyn Clock>,
}

impl Enricher {
    pub fn new(
        whois: Option<Arc<dyn WhoisProvider>>,
        threats: Option<Arc<dyn ThreatListProvider>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            whois,
            threats,
            clock,
        }
    }

    pub fn disabled(clock: Arc<dyn Clock>) -> Self {
        Self::new(None, None, clock)
    }

    pub async fn enrich(&self, task_id: &str, records: &mut [LinkRecord]) -> EnrichmentReport {
        let mut report = EnrichmentReport::default();

        for r in records.iter_mut() {
            if r.content_fingerprint.is_none() && !r.source_domain.is_empty() {
                r.content_fingerprint =
                    Some(content_fingerprint(&r.source_domain, r.anchor_text.as_deref()));
            }
        }

        if let Some(whois) = &self.whois {
            self.enrich_whois(task_id, whois.as_ref(), records, &mut report)
                .await;
        }
        if let Some(threats) = &self.threats {
            self.enrich_threats(task_id, threats.as_ref(), records, &mut report)
                .await;
        }

        score_links(records);
        debug!(task_id, ?report, "enrichment pass finished");
        report
    }

    async fn enrich_whois(
        &self,
        task_id: &str,
        whois: &dyn WhoisProvider,
        records: &mut [LinkRecord],
        report: &mut EnrichmentReport,
    ) {
        // BTreeMap keeps lookup order stable across runs
        let mut by_domain: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, r) in records.iter().enumerate() {
            if r.source_domain.is_empty() {
                continue;
            }
            by_domain.entry(r.source_domain.clone()).or_default().push(i);
        }

        for (domain, positions) in by_domain {
            let already_known = positions
                .iter()
                .all(|&i| records[i].registrar.is_some() && records[i].domain_age_days.is_some());
            if already_known {
                continue;
            }
            report.domains_looked_up += 1;
            match whois.lookup(&domain).await {
                Ok(WhoisLookup::Found(signals)) => {
                    report.whois_found += 1;
                    for i in positions {
                        apply_enrichment(&mut records[i], &signals);
                    }
                }
                Ok(WhoisLookup::NoData) => {
                    debug!(task_id, domain = %domain, "no registration data");
                }
                Err(err) => {
                    report.whois_errors += 1;
                    warn!(task_id, domain = %domain, "whois lookup failed: {}", err);
                }
            }
        }
    }

    async fn enrich_threats(
        &self,
        task_id: &str,
        threats: &dyn ThreatListProvider,
        records: &mut [LinkRecord],
        report: &mut EnrichmentReport,
    ) {
        let mut seen: HashMap<String, ()> = HashMap::new();
        let urls: Vec<String> = records
            .iter()
            .filter(|r| seen.insert(normalize_source_url(&r.source_url), ()).is_none())
            .map(|r| r.source_url.clone())
            .collect();
        if urls.is_empty() {
            return;
        }
        match threats.check(&urls).await {
            Ok(matches) => {
                let verdicts = threat_verdicts(&urls, &matches, self.clock.now());
                report.urls_checked = urls.len();
                for r in records.iter_mut() {
                    if let Some(v) = verdicts.get(&normalize_source_url(&r.source_url)) {
                        apply_threat_list_verdict(r, v);
                    }
                }
                report.urls_flagged = verdicts
                    .values()
                    .filter(|v| v.status == ThreatStatus::Flagged)
                    .count();
            }
            Err(err) => {
                warn!(task_id, urls = urls.len(), "threat list check failed: {}", err);
                report.threat_error = Some(err.to_string());
            }
        }
    }
}
