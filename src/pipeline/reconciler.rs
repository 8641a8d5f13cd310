//! Merges enrichment, threat-list and classifier output into link records.
//!
//! Every function here is idempotent: applying the same input twice leaves
//! the record exactly as applying it once. Matching between external answers
//! and stored records always goes through [`normalize_source_url`].

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::core::types::{
    LinkRecord, RiskLevel, RiskSignal, ThreatMatch, ThreatStatus, ThreatVerdict, VerdictItem,
    WhoisSignals,
};
use crate::pipeline::normalizer::normalize_source_url;

/// Registration/network metadata; a provider value replaces the stored one.
pub fn apply_enrichment(record: &mut LinkRecord, whois: &WhoisSignals) {
    if let Some(registrar) = &whois.registrar {
        record.registrar = Some(registrar.clone());
    }
    if let Some(age) = whois.domain_age_days {
        record.domain_age_days = Some(age);
    }
    if let Some(ip) = &whois.ip {
        record.ip = Some(ip.clone());
    }
    if let Some(asn) = &whois.asn {
        record.asn = Some(asn.clone());
    }
    if let Some(hosting) = &whois.hosting_provider {
        record.hosting_provider = Some(hosting.clone());
    }
}

pub fn apply_detection_verdict(record: &mut LinkRecord, verdict: &VerdictItem) {
    let probability = verdict
        .probability
        .filter(|p| p.is_finite())
        .map(|p| p.clamp(0.0, 1.0));
    let mut level = verdict
        .risk_level
        .as_deref()
        .map(RiskLevel::parse)
        .unwrap_or_default();
    if level == RiskLevel::Unknown {
        if let Some(p) = probability {
            level = level_from_probability(p);
        }
    }

    let mut reasons: Vec<String> = Vec::with_capacity(verdict.reasons.len());
    for reason in &verdict.reasons {
        let reason = reason.trim();
        if !reason.is_empty() && !reasons.iter().any(|r| r == reason) {
            reasons.push(reason.to_string());
        }
    }

    let ordered: BTreeMap<&String, &serde_json::Value> = verdict.signals.iter().collect();
    let signals = ordered
        .into_iter()
        .map(|(name, value)| RiskSignal {
            name: name.clone(),
            value: value.clone(),
        })
        .collect();

    record.risk_probability = probability;
    record.risk_level = level;
    record.risk_reasons = reasons;
    record.risk_signals = signals;
}

pub fn apply_threat_list_verdict(record: &mut LinkRecord, verdict: &ThreatVerdict) {
    record.threat_status = verdict.status;
    record.threats = verdict.threats.clone();
    record.threat_checked_at = Some(verdict.checked_at);
}

/// Level implied by a bare probability when the classifier sent no level.
pub fn level_from_probability(p: f64) -> RiskLevel {
    if p >= 0.85 {
        RiskLevel::Critical
    } else if p >= 0.65 {
        RiskLevel::High
    } else if p >= 0.4 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Per-URL threat verdicts for every checked URL, keyed by normalized URL.
/// URLs without a match are clean.
pub fn threat_verdicts(
    checked: &[String],
    matches: &[ThreatMatch],
    checked_at: DateTime<Utc>,
) -> HashMap<String, ThreatVerdict> {
    let mut threats: HashMap<String, Vec<String>> = HashMap::new();
    for m in matches {
        let entry = threats.entry(normalize_source_url(&m.threat.url)).or_default();
        if !m.threat_type.is_empty() && !entry.contains(&m.threat_type) {
            entry.push(m.threat_type.clone());
        }
    }
    let mut out = HashMap::new();
    for url in checked {
        let key = normalize_source_url(url);
        let verdict = match threats.get(&key) {
            Some(list) => {
                let mut list = list.clone();
                list.sort();
                ThreatVerdict {
                    status: ThreatStatus::Flagged,
                    threats: list,
                    checked_at,
                }
            }
            None => ThreatVerdict {
                status: ThreatStatus::Clean,
                threats: Vec::new(),
                checked_at,
            },
        };
        out.insert(key, verdict);
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    pub matched: usize,
    /// Verdict URLs that matched no record.
    pub unmatched: Vec<String>,
}

/// Apply classifier verdicts to the records they name.
///
/// Several records can share a normalized URL; each of them receives the
/// verdict. When the same URL appears in several verdicts, the last wins.
pub fn apply_verdicts(records: &mut [LinkRecord], items: &[VerdictItem]) -> ApplyReport {
    let mut index: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, record) in records.iter().enumerate() {
        index
            .entry(normalize_source_url(&record.source_url))
            .or_default()
            .push(i);
    }

    let mut report = ApplyReport::default();
    for item in items {
        match index.get(&normalize_source_url(&item.source_url)) {
            Some(positions) => {
                for &i in positions {
                    apply_detection_verdict(&mut records[i], item);
                }
                report.matched += 1;
            }
            None => report.unmatched.push(item.source_url.clone()),
        }
    }
    report
}

/// Snapshot of a record for reporting: values computed in the current pass
/// win, persisted values fill in what the current pass has no opinion on.
pub fn merge_snapshot(fresh: &LinkRecord, persisted: Option<&LinkRecord>) -> LinkRecord {
    let Some(old) = persisted else {
        return fresh.clone();
    };
    let mut out = fresh.clone();
    out.anchor_text = fresh.anchor_text.clone().or_else(|| old.anchor_text.clone());
    out.authority_rank = fresh.authority_rank.or(old.authority_rank);
    out.first_seen = fresh.first_seen.or(old.first_seen);
    out.last_seen = fresh.last_seen.or(old.last_seen);
    out.ip = fresh.ip.clone().or_else(|| old.ip.clone());
    out.asn = fresh.asn.clone().or_else(|| old.asn.clone());
    out.hosting_provider = fresh
        .hosting_provider
        .clone()
        .or_else(|| old.hosting_provider.clone());
    out.registrar = fresh.registrar.clone().or_else(|| old.registrar.clone());
    out.domain_age_days = fresh.domain_age_days.or(old.domain_age_days);
    out.content_fingerprint = fresh
        .content_fingerprint
        .clone()
        .or_else(|| old.content_fingerprint.clone());

    if fresh.threat_checked_at.is_none() {
        out.threat_status = old.threat_status;
        out.threats = old.threats.clone();
        out.threat_checked_at = old.threat_checked_at;
    }

    if fresh.risk_level == RiskLevel::Unknown && fresh.risk_probability.is_none() {
        out.risk_probability = old.risk_probability;
        out.risk_level = old.risk_level;
        out.risk_reasons = old.risk_reasons.clone();
        out.risk_signals = old.risk_signals.clone();
    }

    out.spam_score = fresh.spam_score.or(old.spam_score);
    out
}
