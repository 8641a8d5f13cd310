use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::core::cache::{harmful_key, report_key, ResultCache};
use crate::core::error::PipelineError;
use crate::core::store::Store;
use crate::core::types::{
    BacklinksSummary, DetectionRecord, DetectionStatus, LinkRecord, LinkType, RiskLevel,
    RiskSummary, TaskResult, TaskState, TaskStatus, ThreatStatus,
};

pub fn summarize_backlinks(records: &[LinkRecord]) -> BacklinksSummary {
    let domains: HashSet<&str> = records
        .iter()
        .map(|r| r.source_domain.as_str())
        .filter(|d| !d.is_empty())
        .collect();
    let nofollow = records
        .iter()
        .filter(|r| r.link_type == LinkType::Nofollow)
        .count() as u64;
    BacklinksSummary {
        total: records.len() as u64,
        unique_domains: domains.len() as u64,
        dofollow: records.len() as u64 - nofollow,
        nofollow,
    }
}

pub fn summarize_risk(records: &[LinkRecord]) -> RiskSummary {
    let mut summary = RiskSummary::default();
    let mut prob_sum = 0.0;
    let mut prob_n = 0u64;
    let mut spam_sum = 0u64;
    let mut spam_n = 0u64;

    for r in records {
        match r.risk_level {
            RiskLevel::Critical => summary.critical += 1,
            RiskLevel::High => summary.high += 1,
            RiskLevel::Medium => summary.medium += 1,
            RiskLevel::Low => summary.low += 1,
            RiskLevel::Unknown => summary.unknown += 1,
        }
        if r.risk_level.is_harmful() {
            summary.harmful += 1;
        }
        if r.threat_status == ThreatStatus::Flagged {
            summary.flagged_threats += 1;
        }
        if let Some(p) = r.risk_probability {
            prob_sum += p;
            prob_n += 1;
        }
        if let Some(s) = r.spam_score {
            spam_sum += s as u64;
            spam_n += 1;
        }
    }

    summary.mean_probability = (prob_n > 0).then(|| round3(prob_sum / prob_n as f64));
    summary.mean_spam_score = (spam_n > 0).then(|| round3(spam_sum as f64 / spam_n as f64));
    summary
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Detection outcome as seen by report consumers. `error` is set whenever
/// the detection did not complete.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PbnDetectionMarker {
    pub status: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: String,
    pub domain: String,
    pub status: TaskStatus,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<TaskResult>,
    pub pbn_detection: PbnDetectionMarker,
    pub detection: Option<DetectionRecord>,
    pub backlinks: Vec<LinkRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarmfulReport {
    pub domain: String,
    pub count: usize,
    pub links: Vec<LinkRecord>,
}

fn marker(state: &TaskState, detection: Option<&DetectionRecord>) -> PbnDetectionMarker {
    let task_error = match state {
        TaskState::Failed { error, .. } => Some(error.clone()),
        _ => None,
    };
    match detection {
        Some(d) => {
            let error = match d.status {
                DetectionStatus::Completed | DetectionStatus::Pending => None,
                DetectionStatus::Failed | DetectionStatus::Skipped => {
                    d.status_message.clone().or_else(|| task_error.clone())
                }
            };
            PbnDetectionMarker {
                status: d.status.as_str().to_string(),
                error,
            }
        }
        None => PbnDetectionMarker {
            status: if task_error.is_some() {
                DetectionStatus::Failed.as_str().to_string()
            } else {
                "not_started".to_string()
            },
            error: task_error,
        },
    }
}

pub fn build_task_report(store: &Store, task_id: &str) -> Result<TaskReport, PipelineError> {
    let task = store
        .get_task(task_id)?
        .ok_or_else(|| PipelineError::NotFound(format!("task {}", task_id)))?;
    let updated_at = store.task_updated_at(task_id)?;
    let detection = store.get_detection(task_id)?;
    let backlinks = store.links_for_task(task_id)?;

    let pbn_detection = marker(&task.state, detection.as_ref());
    let (finished_at, error, result) = match &task.state {
        TaskState::Pending | TaskState::Processing { .. } => (None, None, None),
        TaskState::Completed {
            completed_at,
            result,
        } => (Some(*completed_at), None, Some(result.clone())),
        TaskState::Failed {
            failed_at,
            error,
            partial,
        } => (Some(*failed_at), Some(error.clone()), partial.clone()),
    };

    Ok(TaskReport {
        status: task.status(),
        task_id: task.task_id,
        domain: task.domain,
        submitted_at: task.submitted_at,
        finished_at,
        updated_at,
        error,
        result,
        pbn_detection,
        detection,
        backlinks,
    })
}

/// Task report as JSON, served from the cache when a fresh copy exists.
pub fn cached_task_report(
    store: &Store,
    cache: &ResultCache,
    task_id: &str,
) -> Result<Value, PipelineError> {
    let key = report_key(task_id);
    if let Some(hit) = cache.get(&key) {
        return Ok(hit);
    }
    let report = serde_json::to_value(build_task_report(store, task_id)?)?;
    cache.put(key, report.clone());
    Ok(report)
}

pub fn build_harmful_report(store: &Store, domain: &str) -> Result<HarmfulReport, PipelineError> {
    let links = store.harmful_links(domain)?;
    Ok(HarmfulReport {
        domain: domain.to_string(),
        count: links.len(),
        links,
    })
}

pub fn cached_harmful_report(
    store: &Store,
    cache: &ResultCache,
    domain: &str,
) -> Result<Value, PipelineError> {
    let key = harmful_key(domain);
    if let Some(hit) = cache.get(&key) {
        return Ok(hit);
    }
    let report = serde_json::to_value(build_harmful_report(store, domain)?)?;
    cache.put(key, report.clone());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Task;
    use std::time::Duration;

    fn link(url: &str, level: RiskLevel, p: Option<f64>) -> LinkRecord {
        let mut r = LinkRecord::new("example.com", url, "t1");
        r.risk_level = level;
        r.risk_probability = p;
        r
    }

    #[test]
    fn backlink_summary_counts_domains_and_link_types() {
        let mut records = vec![
            link("https://a.net/1", RiskLevel::Unknown, None),
            link("https://a.net/2", RiskLevel::Unknown, None),
            link("https://b.org/", RiskLevel::Unknown, None),
        ];
        records[2].link_type = LinkType::Nofollow;
        let s = summarize_backlinks(&records);
        assert_eq!(
            s,
            BacklinksSummary {
                total: 3,
                unique_domains: 2,
                dofollow: 2,
                nofollow: 1
            }
        );
    }

    #[test]
    fn risk_summary_averages_known_values_only() {
        let mut records = vec![
            link("https://a.net/", RiskLevel::Critical, Some(0.9)),
            link("https://b.net/", RiskLevel::High, Some(0.7)),
            link("https://c.net/", RiskLevel::Low, None),
        ];
        records[0].threat_status = ThreatStatus::Flagged;
        records[1].spam_score = Some(40);
        let s = summarize_risk(&records);
        assert_eq!(s.critical, 1);
        assert_eq!(s.high, 1);
        assert_eq!(s.low, 1);
        assert_eq!(s.harmful, 2);
        assert_eq!(s.flagged_threats, 1);
        assert_eq!(s.mean_probability, Some(0.8));
        assert_eq!(s.mean_spam_score, Some(40.0));
        assert_eq!(summarize_risk(&[]).mean_probability, None);
    }

    #[test]
    fn failed_task_report_keeps_partial_links_and_marks_detection() {
        let mut store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let mut task = Task::new("t1", "example.com", now);
        task.state = TaskState::Failed {
            failed_at: now,
            error: "database exploded".into(),
            partial: None,
        };
        store.upsert_task(&task, now).unwrap();
        store
            .upsert_links(&[link("https://a.net/", RiskLevel::Unknown, None)])
            .unwrap();

        let report = build_task_report(&store, "t1").unwrap();
        assert_eq!(report.status, TaskStatus::Failed);
        assert_eq!(report.backlinks.len(), 1);
        assert_eq!(
            report.pbn_detection,
            PbnDetectionMarker {
                status: "failed".into(),
                error: Some("database exploded".into())
            }
        );
    }

    #[test]
    fn missing_task_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            build_task_report(&store, "nope"),
            Err(PipelineError::NotFound(_))
        ));
    }

    #[test]
    fn harmful_report_is_cached_until_invalidated() {
        let mut store = Store::open_in_memory().unwrap();
        let cache = ResultCache::new(Duration::from_secs(60));
        store
            .upsert_links(&[link("https://a.net/", RiskLevel::High, Some(0.7))])
            .unwrap();
        let first = cached_harmful_report(&store, &cache, "example.com").unwrap();
        assert_eq!(first["count"], 1);

        store
            .upsert_links(&[link("https://b.net/", RiskLevel::Critical, Some(0.95))])
            .unwrap();
        let stale = cached_harmful_report(&store, &cache, "example.com").unwrap();
        assert_eq!(stale["count"], 1);

        cache.invalidate("t1", "example.com");
        let fresh = cached_harmful_report(&store, &cache, "example.com").unwrap();
        assert_eq!(fresh["count"], 2);
        assert_eq!(fresh["links"][0]["source_url"], "https://b.net/");
    }
}
