use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Version stamped into every persisted [`TaskResult`].
pub const RESULT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "processing" => Some(TaskStatus::Processing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DetectionStatus {
    Pending,
    Completed,
    Failed,
    Skipped,
}

impl DetectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionStatus::Pending => "pending",
            DetectionStatus::Completed => "completed",
            DetectionStatus::Failed => "failed",
            DetectionStatus::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DetectionStatus::Pending),
            "completed" => Some(DetectionStatus::Completed),
            "failed" => Some(DetectionStatus::Failed),
            "skipped" => Some(DetectionStatus::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    #[default]
    Dofollow,
    Nofollow,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Dofollow => "dofollow",
            LinkType::Nofollow => "nofollow",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("nofollow") {
            LinkType::Nofollow
        } else {
            LinkType::Dofollow
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThreatStatus {
    #[default]
    Unknown,
    Clean,
    Flagged,
}

impl ThreatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatStatus::Unknown => "unknown",
            ThreatStatus::Clean => "clean",
            ThreatStatus::Flagged => "flagged",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "clean" => ThreatStatus::Clean,
            "flagged" => ThreatStatus::Flagged,
            _ => ThreatStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Unknown,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Unknown => "unknown",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    /// Lenient parse; anything unrecognised is `Unknown`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => RiskLevel::Low,
            "medium" => RiskLevel::Medium,
            "high" => RiskLevel::High,
            "critical" => RiskLevel::Critical,
            _ => RiskLevel::Unknown,
        }
    }

    pub fn is_harmful(&self) -> bool {
        matches!(self, RiskLevel::High | RiskLevel::Critical)
    }
}

/// One named signal the classifier attached to a verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskSignal {
    pub name: String,
    pub value: Value,
}

/// A discovered backlink plus everything enrichment and classification
/// attached to it. Keyed by `(domain, source_url, task_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkRecord {
    pub domain: String,
    pub source_url: String,
    pub task_id: String,

    pub anchor_text: Option<String>,
    pub link_type: LinkType,
    pub source_domain: String,
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

    pub threat_status: ThreatStatus,
    pub threats: Vec<String>,
    pub threat_checked_at: Option<DateTime<Utc>>,

    pub risk_probability: Option<f64>,
    pub risk_level: RiskLevel,
    pub risk_reasons: Vec<String>,
    pub risk_signals: Vec<RiskSignal>,

    pub spam_score: Option<u8>,
}

impl LinkRecord {
    pub fn new(
        domain: impl Into<String>,
        source_url: impl Into<String>,
        task_id: impl Into<String>,
    ) -> Self {
        let source_url = source_url.into();
        let source_domain = crate::pipeline::normalizer::host_of(&source_url).unwrap_or_default();
        Self {
            domain: domain.into(),
            source_url,
            task_id: task_id.into(),
            anchor_text: None,
            link_type: LinkType::Dofollow,
            source_domain,
            authority_rank: None,
            link_count: 1,
            first_seen: None,
            last_seen: None,
            ip: None,
            asn: None,
            hosting_provider: None,
            registrar: None,
            domain_age_days: None,
            content_fingerprint: None,
            threat_status: ThreatStatus::Unknown,
            threats: Vec::new(),
            threat_checked_at: None,
            risk_probability: None,
            risk_level: RiskLevel::Unknown,
            risk_reasons: Vec::new(),
            risk_signals: Vec::new(),
            spam_score: None,
        }
    }
}

/// One line of a discovery export, as accepted by `submit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredLink {
    pub source_url: String,
    #[serde(default)]
    pub anchor_text: Option<String>,
    #[serde(default)]
    pub link_type: Option<String>,
    #[serde(default)]
    pub source_domain: Option<String>,
    #[serde(default)]
    pub authority_rank: Option<i64>,
    #[serde(default)]
    pub link_count: Option<i64>,
    #[serde(default)]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub content_fingerprint: Option<String>,
}

impl DiscoveredLink {
    pub fn into_record(self, domain: &str, task_id: &str) -> LinkRecord {
        let mut record = LinkRecord::new(domain, self.source_url, task_id);
        record.anchor_text = self.anchor_text;
        record.link_type = self
            .link_type
            .as_deref()
            .map(LinkType::parse)
            .unwrap_or_default();
        if let Some(source_domain) = self.source_domain.filter(|d| !d.trim().is_empty()) {
            record.source_domain = source_domain.trim().to_lowercase();
        }
        record.authority_rank = self.authority_rank;
        record.link_count = self.link_count.unwrap_or(1).max(1);
        record.first_seen = self.first_seen;
        record.last_seen = self.last_seen;
        record.content_fingerprint = self.content_fingerprint;
        record
    }
}

/// WHOIS/RDAP-style metadata for one source domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WhoisSignals {
    pub registrar: Option<String>,
    pub domain_age_days: Option<i64>,
    pub ip: Option<String>,
    pub asn: Option<String>,
    pub hosting_provider: Option<String>,
}

/// One threat-list match, in the provider's wire shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThreatMatch {
    #[serde(default)]
    pub threat_type: String,
    #[serde(default)]
    pub platform_type: String,
    #[serde(default)]
    pub threat_entry_type: String,
    pub threat: ThreatEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreatEntry {
    pub url: String,
}

/// Threat-list verdict for one URL, ready to apply to a record.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreatVerdict {
    pub status: ThreatStatus,
    pub threats: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

/// One per-link verdict returned by the classifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerdictItem {
    pub source_url: String,
    #[serde(default)]
    pub probability: Option<f64>,
    #[serde(default)]
    pub risk_level: Option<String>,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub signals: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BacklinksSummary {
    pub total: u64,
    pub unique_domains: u64,
    pub dofollow: u64,
    pub nofollow: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RiskSummary {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    pub unknown: u64,
    pub harmful: u64,
    pub flagged_threats: u64,
    pub mean_probability: Option<f64>,
    pub mean_spam_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectionSummary {
    pub status: DetectionStatus,
    #[serde(default)]
    pub message: Option<String>,
    pub high_risk_count: u64,
    pub medium_risk_count: u64,
    pub low_risk_count: u64,
    pub total_analyzed: u64,
    pub batches_total: usize,
    pub batches_failed: usize,
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

/// Structured payload stored on a finished task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub version: u32,
    pub backlinks: BacklinksSummary,
    #[serde(default)]
    pub risk: Option<RiskSummary>,
    pub detection: DetectionSummary,
}

/// Task lifecycle; each terminal state carries the data that exists for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Processing {
        started_at: DateTime<Utc>,
    },
    Completed {
        completed_at: DateTime<Utc>,
        result: TaskResult,
    },
    Failed {
        failed_at: DateTime<Utc>,
        error: String,
        #[serde(default)]
        partial: Option<TaskResult>,
    },
}

impl TaskState {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskState::Pending => TaskStatus::Pending,
            TaskState::Processing { .. } => TaskStatus::Processing,
            TaskState::Completed { .. } => TaskStatus::Completed,
            TaskState::Failed { .. } => TaskStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: String,
    pub domain: String,
    pub submitted_at: DateTime<Utc>,
    pub state: TaskState,
}

impl Task {
    pub fn new(task_id: impl Into<String>, domain: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.into(),
            domain: domain.into(),
            submitted_at: now,
            state: TaskState::Pending,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.state.status()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.submitted_at)
    }
}

/// Risk-classifier sub-run for one task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectionRecord {
    pub task_id: String,
    pub status: DetectionStatus,
    pub high_risk_count: u64,
    pub medium_risk_count: u64,
    pub low_risk_count: u64,
    pub latency_ms: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub summary: Value,
    pub raw_response: Value,
    pub status_message: Option<String>,
}

impl DetectionRecord {
    pub fn pending(task_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.into(),
            status: DetectionStatus::Pending,
            high_risk_count: 0,
            medium_risk_count: 0,
            low_risk_count: 0,
            latency_ms: None,
            started_at: Some(started_at),
            completed_at: None,
            summary: Value::Object(Map::new()),
            raw_response: Value::Null,
            status_message: None,
        }
    }
}
