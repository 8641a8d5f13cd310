use std::path::Path;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use crate::core::error::PipelineError;
use crate::core::types::{
    DetectionRecord, DetectionStatus, LinkRecord, LinkType, RiskLevel, RiskSignal, Task,
    TaskResult, TaskState, TaskStatus, ThreatStatus,
};

const BUSY_RETRIES: u32 = 3;
const BUSY_BACKOFF_MS: u64 = 50;

/// SQLite-backed store for tasks, detection records and link records.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn new(path: &Path) -> Result<Self, PipelineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(StdDuration::from_secs(5))?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, PipelineError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), PipelineError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tasks (
              task_id TEXT PRIMARY KEY,
              domain TEXT NOT NULL,
              status TEXT NOT NULL,
              submitted_at TEXT NOT NULL,
              started_at TEXT,
              completed_at TEXT,
              failed_at TEXT,
              result_json TEXT,
              error_message TEXT,
              updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, submitted_at);

            CREATE TABLE IF NOT EXISTS detections (
              task_id TEXT PRIMARY KEY,
              status TEXT NOT NULL,
              high_risk_count INTEGER NOT NULL DEFAULT 0,
              medium_risk_count INTEGER NOT NULL DEFAULT 0,
              low_risk_count INTEGER NOT NULL DEFAULT 0,
              latency_ms INTEGER,
              started_at TEXT,
              completed_at TEXT,
              summary_json TEXT NOT NULL,
              raw_response_json TEXT NOT NULL,
              status_message TEXT
            );

            CREATE TABLE IF NOT EXISTS backlinks (
              domain TEXT NOT NULL,
              source_url TEXT NOT NULL,
              task_id TEXT NOT NULL,
              anchor_text TEXT,
              link_type TEXT NOT NULL,
              source_domain TEXT NOT NULL,
              authority_rank INTEGER,
              link_count INTEGER NOT NULL DEFAULT 1,
              first_seen TEXT,
              last_seen TEXT,
              ip TEXT,
              asn TEXT,
              hosting_provider TEXT,
              registrar TEXT,
              domain_age_days INTEGER,
              content_fingerprint TEXT,
              threat_status TEXT NOT NULL DEFAULT 'unknown',
              threats_json TEXT NOT NULL DEFAULT '[]',
              threat_checked_at TEXT,
              risk_probability REAL,
              risk_level TEXT NOT NULL DEFAULT 'unknown',
              risk_reasons_json TEXT NOT NULL DEFAULT '[]',
              risk_signals_json TEXT NOT NULL DEFAULT '[]',
              spam_score INTEGER,
              UNIQUE(domain, source_url, task_id)
            );
            CREATE INDEX IF NOT EXISTS idx_backlinks_task ON backlinks(task_id);
            CREATE INDEX IF NOT EXISTS idx_backlinks_risk ON backlinks(domain, risk_level);
            ",
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // tasks
    // ------------------------------------------------------------------

    /// Insert or overwrite a task keyed by its identifier, stamping
    /// `updated_at` with `now`.
    pub fn upsert_task(&self, task: &Task, now: DateTime<Utc>) -> Result<(), PipelineError> {
        let (started_at, completed_at, failed_at, result_json, error) = match &task.state {
            TaskState::Pending => (None, None, None, None, None),
            TaskState::Processing { started_at } => (Some(*started_at), None, None, None, None),
            TaskState::Completed {
                completed_at,
                result,
            } => (
                None,
                Some(*completed_at),
                None,
                Some(serde_json::to_string(result)?),
                None,
            ),
            TaskState::Failed {
                failed_at,
                error,
                partial,
            } => (
                None,
                None,
                Some(*failed_at),
                partial.as_ref().map(serde_json::to_string).transpose()?,
                Some(error.clone()),
            ),
        };
        self.with_busy_retry(|conn| {
            conn.execute(
                "INSERT INTO tasks
                 (task_id, domain, status, submitted_at, started_at, completed_at, failed_at, result_json, error_message, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(task_id) DO UPDATE SET
                   domain = excluded.domain,
                   status = excluded.status,
                   started_at = COALESCE(excluded.started_at, tasks.started_at),
                   completed_at = excluded.completed_at,
                   failed_at = excluded.failed_at,
                   result_json = excluded.result_json,
                   error_message = excluded.error_message,
                   updated_at = excluded.updated_at",
                params![
                    task.task_id,
                    task.domain,
                    task.status().as_str(),
                    task.submitted_at.to_rfc3339(),
                    started_at.map(|t| t.to_rfc3339()),
                    completed_at.map(|t| t.to_rfc3339()),
                    failed_at.map(|t| t.to_rfc3339()),
                    result_json,
                    error,
                    now.to_rfc3339(),
                ],
            )
        })?;
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>, PipelineError> {
        let row = self
            .conn
            .query_row(
                "SELECT task_id, domain, status, submitted_at, started_at, completed_at, failed_at, result_json, error_message
                 FROM tasks WHERE task_id = ?1",
                params![task_id],
                task_row,
            )
            .optional()?;
        row.map(TaskRow::into_task).transpose()
    }

    pub fn task_updated_at(&self, task_id: &str) -> Result<Option<DateTime<Utc>>, PipelineError> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT updated_at FROM tasks WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        value.as_deref().map(parse_ts).transpose()
    }

    /// Pending/processing tasks, oldest first. Unless `force` is set, tasks
    /// submitted before `now - max_age` are left out.
    pub fn eligible_tasks(
        &self,
        limit: usize,
        max_age: Duration,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, PipelineError> {
        let cutoff = if force {
            None
        } else {
            Some((now - max_age).to_rfc3339())
        };
        let mut stmt = self.conn.prepare(
            "SELECT task_id, domain, status, submitted_at, started_at, completed_at, failed_at, result_json, error_message
             FROM tasks
             WHERE status IN ('pending', 'processing')
               AND (?1 IS NULL OR submitted_at >= ?1)
             ORDER BY submitted_at ASC, task_id ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![cutoff, limit as i64], task_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_task()?);
        }
        Ok(out)
    }

    /// Pending/processing tasks submitted before `cutoff`.
    pub fn stuck_tasks(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, PipelineError> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id, domain, status, submitted_at, started_at, completed_at, failed_at, result_json, error_message
             FROM tasks
             WHERE status IN ('pending', 'processing') AND submitted_at < ?1
             ORDER BY submitted_at ASC",
        )?;
        let rows = stmt.query_map(params![cutoff.to_rfc3339()], task_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_task()?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // detections
    // ------------------------------------------------------------------

    pub fn upsert_detection(&self, record: &DetectionRecord) -> Result<(), PipelineError> {
        let summary = serde_json::to_string(&record.summary)?;
        let raw = serde_json::to_string(&record.raw_response)?;
        self.with_busy_retry(|conn| {
            conn.execute(
                "INSERT INTO detections
                 (task_id, status, high_risk_count, medium_risk_count, low_risk_count, latency_ms,
                  started_at, completed_at, summary_json, raw_response_json, status_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(task_id) DO UPDATE SET
                   status = excluded.status,
                   high_risk_count = excluded.high_risk_count,
                   medium_risk_count = excluded.medium_risk_count,
                   low_risk_count = excluded.low_risk_count,
                   latency_ms = excluded.latency_ms,
                   started_at = excluded.started_at,
                   completed_at = excluded.completed_at,
                   summary_json = excluded.summary_json,
                   raw_response_json = excluded.raw_response_json,
                   status_message = excluded.status_message",
                params![
                    record.task_id,
                    record.status.as_str(),
                    record.high_risk_count as i64,
                    record.medium_risk_count as i64,
                    record.low_risk_count as i64,
                    record.latency_ms.map(|v| v as i64),
                    record.started_at.map(|t| t.to_rfc3339()),
                    record.completed_at.map(|t| t.to_rfc3339()),
                    summary,
                    raw,
                    record.status_message,
                ],
            )
        })?;
        Ok(())
    }

    pub fn get_detection(&self, task_id: &str) -> Result<Option<DetectionRecord>, PipelineError> {
        let row = self
            .conn
            .query_row(
                "SELECT task_id, status, high_risk_count, medium_risk_count, low_risk_count, latency_ms,
                        started_at, completed_at, summary_json, raw_response_json, status_message
                 FROM detections WHERE task_id = ?1",
                params![task_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, Option<String>>(10)?,
                    ))
                },
            )
            .optional()?;
        let Some((task_id, status, high, medium, low, latency, started, completed, summary, raw, message)) =
            row
        else {
            return Ok(None);
        };
        Ok(Some(DetectionRecord {
            task_id,
            status: DetectionStatus::parse(&status)
                .ok_or_else(|| PipelineError::Db(format!("bad detection status: {}", status)))?,
            high_risk_count: high.max(0) as u64,
            medium_risk_count: medium.max(0) as u64,
            low_risk_count: low.max(0) as u64,
            latency_ms: latency.map(|v| v.max(0) as u64),
            started_at: parse_ts_opt(started)?,
            completed_at: parse_ts_opt(completed)?,
            summary: serde_json::from_str(&summary)?,
            raw_response: serde_json::from_str(&raw)?,
            status_message: message,
        }))
    }

    // ------------------------------------------------------------------
    // backlinks
    // ------------------------------------------------------------------

    /// Upsert link records on `(domain, source_url, task_id)`.
    ///
    /// Field groups the writer has no value for (NULL enrichment fields,
    /// `unknown` risk level, unchecked threat status, NULL spam score) keep
    /// whatever is already stored, so independent writers only ever win on
    /// the fields they actually produced.
    pub fn upsert_links(&mut self, records: &[LinkRecord]) -> Result<usize, PipelineError> {
        let mut encoded = Vec::with_capacity(records.len());
        for r in records {
            encoded.push(EncodedLists {
                threats: serde_json::to_string(&r.threats)?,
                reasons: serde_json::to_string(&r.risk_reasons)?,
                signals: serde_json::to_string(&r.risk_signals)?,
            });
        }
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.upsert_links_once(records, &encoded) {
                Err(err) if attempt < BUSY_RETRIES && is_busy(&err) => {
                    tracing::warn!(attempt, "backlink upsert conflicted; retrying");
                    std::thread::sleep(StdDuration::from_millis(BUSY_BACKOFF_MS * attempt as u64));
                }
                other => return other.map_err(PipelineError::from),
            }
        }
    }

    fn upsert_links_once(
        &mut self,
        records: &[LinkRecord],
        encoded: &[EncodedLists],
    ) -> rusqlite::Result<usize> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO backlinks
                 (domain, source_url, task_id, anchor_text, link_type, source_domain, authority_rank, link_count,
                  first_seen, last_seen, ip, asn, hosting_provider, registrar, domain_age_days, content_fingerprint,
                  threat_status, threats_json, threat_checked_at, risk_probability, risk_level, risk_reasons_json,
                  risk_signals_json, spam_score)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)
                 ON CONFLICT(domain, source_url, task_id) DO UPDATE SET
                   anchor_text = COALESCE(excluded.anchor_text, backlinks.anchor_text),
                   link_type = excluded.link_type,
                   source_domain = excluded.source_domain,
                   authority_rank = COALESCE(excluded.authority_rank, backlinks.authority_rank),
                   link_count = excluded.link_count,
                   first_seen = COALESCE(excluded.first_seen, backlinks.first_seen),
                   last_seen = COALESCE(excluded.last_seen, backlinks.last_seen),
                   ip = COALESCE(excluded.ip, backlinks.ip),
                   asn = COALESCE(excluded.asn, backlinks.asn),
                   hosting_provider = COALESCE(excluded.hosting_provider, backlinks.hosting_provider),
                   registrar = COALESCE(excluded.registrar, backlinks.registrar),
                   domain_age_days = COALESCE(excluded.domain_age_days, backlinks.domain_age_days),
                   content_fingerprint = COALESCE(excluded.content_fingerprint, backlinks.content_fingerprint),
                   threat_status = CASE WHEN excluded.threat_checked_at IS NULL
                                        THEN backlinks.threat_status ELSE excluded.threat_status END,
                   threats_json = CASE WHEN excluded.threat_checked_at IS NULL
                                       THEN backlinks.threats_json ELSE excluded.threats_json END,
                   threat_checked_at = COALESCE(excluded.threat_checked_at, backlinks.threat_checked_at),
                   risk_probability = CASE WHEN excluded.risk_level = 'unknown' AND excluded.risk_probability IS NULL
                                           THEN backlinks.risk_probability ELSE excluded.risk_probability END,
                   risk_reasons_json = CASE WHEN excluded.risk_level = 'unknown' AND excluded.risk_probability IS NULL
                                            THEN backlinks.risk_reasons_json ELSE excluded.risk_reasons_json END,
                   risk_signals_json = CASE WHEN excluded.risk_level = 'unknown' AND excluded.risk_probability IS NULL
                                            THEN backlinks.risk_signals_json ELSE excluded.risk_signals_json END,
                   risk_level = CASE WHEN excluded.risk_level = 'unknown' AND excluded.risk_probability IS NULL
                                     THEN backlinks.risk_level ELSE excluded.risk_level END,
                   spam_score = COALESCE(excluded.spam_score, backlinks.spam_score)",
            )?;
            for (r, lists) in records.iter().zip(encoded) {
                stmt.execute(params![
                    r.domain,
                    r.source_url,
                    r.task_id,
                    r.anchor_text,
                    r.link_type.as_str(),
                    r.source_domain,
                    r.authority_rank,
                    r.link_count,
                    r.first_seen.map(|t| t.to_rfc3339()),
                    r.last_seen.map(|t| t.to_rfc3339()),
                    r.ip,
                    r.asn,
                    r.hosting_provider,
                    r.registrar,
                    r.domain_age_days,
                    r.content_fingerprint,
                    r.threat_status.as_str(),
                    lists.threats,
                    r.threat_checked_at.map(|t| t.to_rfc3339()),
                    r.risk_probability,
                    r.risk_level.as_str(),
                    lists.reasons,
                    lists.signals,
                    r.spam_score.map(|s| s as i64),
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    pub fn links_for_task(&self, task_id: &str) -> Result<Vec<LinkRecord>, PipelineError> {
        let sql = format!(
            "SELECT {} FROM backlinks WHERE task_id = ?1 ORDER BY rowid ASC",
            LINK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![task_id], link_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_record()?);
        }
        Ok(out)
    }

    pub fn count_links_for_task(&self, task_id: &str) -> Result<u64, PipelineError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM backlinks WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Links of `domain` whose risk level is high or critical, worst first.
    pub fn harmful_links(&self, domain: &str) -> Result<Vec<LinkRecord>, PipelineError> {
        let sql = format!(
            "SELECT {} FROM backlinks
             WHERE domain = ?1 AND risk_level IN ('high', 'critical')
             ORDER BY CASE risk_level WHEN 'critical' THEN 0 ELSE 1 END,
                      COALESCE(risk_probability, 0) DESC, source_url ASC",
            LINK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![domain], link_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_record()?);
        }
        Ok(out)
    }

    fn with_busy_retry<F>(&self, mut op: F) -> Result<usize, PipelineError>
    where
        F: FnMut(&Connection) -> rusqlite::Result<usize>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(&self.conn) {
                Err(err) if attempt < BUSY_RETRIES && is_busy(&err) => {
                    tracing::warn!(attempt, "store write conflicted; retrying");
                    std::thread::sleep(StdDuration::from_millis(BUSY_BACKOFF_MS * attempt as u64));
                }
                other => return other.map_err(PipelineError::from),
            }
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

struct EncodedLists {
    threats: String,
    reasons: String,
    signals: String,
}

struct TaskRow {
    task_id: String,
    domain: String,
    status: String,
    submitted_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    failed_at: Option<String>,
    result_json: Option<String>,
    error_message: Option<String>,
}

fn task_row(row: &Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        task_id: row.get(0)?,
        domain: row.get(1)?,
        status: row.get(2)?,
        submitted_at: row.get(3)?,
        started_at: row.get(4)?,
        completed_at: row.get(5)?,
        failed_at: row.get(6)?,
        result_json: row.get(7)?,
        error_message: row.get(8)?,
    })
}

impl TaskRow {
    fn into_task(self) -> Result<Task, PipelineError> {
        let status = TaskStatus::parse(&self.status)
            .ok_or_else(|| PipelineError::Db(format!("bad task status: {}", self.status)))?;
        let submitted_at = parse_ts(&self.submitted_at)?;
        let result: Option<TaskResult> = self
            .result_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let state = match status {
            TaskStatus::Pending => TaskState::Pending,
            TaskStatus::Processing => TaskState::Processing {
                started_at: parse_ts_opt(self.started_at)?.unwrap_or(submitted_at),
            },
            TaskStatus::Completed => TaskState::Completed {
                completed_at: parse_ts_opt(self.completed_at)?.unwrap_or(submitted_at),
                result: result.ok_or_else(|| {
                    PipelineError::Db(format!("completed task {} has no result", self.task_id))
                })?,
            },
            TaskStatus::Failed => TaskState::Failed {
                failed_at: parse_ts_opt(self.failed_at)?.unwrap_or(submitted_at),
                error: self.error_message.unwrap_or_default(),
                partial: result,
            },
        };
        Ok(Task {
            task_id: self.task_id,
            domain: self.domain,
            submitted_at,
            state,
        })
    }
}

const LINK_COLUMNS: &str = "domain, source_url, task_id, anchor_text, link_type, source_domain, authority_rank, \
     link_count, first_seen, last_seen, ip, asn, hosting_provider, registrar, domain_age_days, \
     content_fingerprint, threat_status, threats_json, threat_checked_at, risk_probability, risk_level, \
     risk_reasons_json, risk_signals_json, spam_score";

struct LinkRow {
    domain: String,
    source_url: String,
    task_id: String,
    anchor_text: Option<String>,
    link_type: String,
    source_domain: String,
    authority_rank: Option<i64>,
    link_count: i64,
    first_seen: Option<String>,
    last_seen: Option<String>,
    ip: Option<String>,
    asn: Option<String>,
    hosting_provider: Option<String>,
    registrar: Option<String>,
    domain_age_days: Option<i64>,
    content_fingerprint: Option<String>,
    threat_status: String,
    threats_json: String,
    threat_checked_at: Option<String>,
    risk_probability: Option<f64>,
    risk_level: String,
    risk_reasons_json: String,
    risk_signals_json: String,
    spam_score: Option<i64>,
}

fn link_row(row: &Row<'_>) -> rusqlite::Result<LinkRow> {
    Ok(LinkRow {
        domain: row.get(0)?,
        source_url: row.get(1)?,
        task_id: row.get(2)?,
        anchor_text: row.get(3)?,
        link_type: row.get(4)?,
        source_domain: row.get(5)?,
        authority_rank: row.get(6)?,
        link_count: row.get(7)?,
        first_seen: row.get(8)?,
        last_seen: row.get(9)?,
        ip: row.get(10)?,
        asn: row.get(11)?,
        hosting_provider: row.get(12)?,
        registrar: row.get(13)?,
        domain_age_days: row.get(14)?,
        content_fingerprint: row.get(15)?,
        threat_status: row.get(16)?,
        threats_json: row.get(17)?,
        threat_checked_at: row.get(18)?,
        risk_probability: row.get(19)?,
        risk_level: row.get(20)?,
        risk_reasons_json: row.get(21)?,
        risk_signals_json: row.get(22)?,
        spam_score: row.get(23)?,
    })
}

impl LinkRow {
    fn into_record(self) -> Result<LinkRecord, PipelineError> {
        let threats: Vec<String> = serde_json::from_str(&self.threats_json)?;
        let reasons: Vec<String> = serde_json::from_str(&self.risk_reasons_json)?;
        let signals: Vec<RiskSignal> = serde_json::from_str(&self.risk_signals_json)?;
        Ok(LinkRecord {
            domain: self.domain,
            source_url: self.source_url,
            task_id: self.task_id,
            anchor_text: self.anchor_text,
            link_type: LinkType::parse(&self.link_type),
            source_domain: self.source_domain,
            authority_rank: self.authority_rank,
            link_count: self.link_count,
            first_seen: parse_ts_opt(self.first_seen)?,
            last_seen: parse_ts_opt(self.last_seen)?,
            ip: self.ip,
            asn: self.asn,
            hosting_provider: self.hosting_provider,
            registrar: self.registrar,
            domain_age_days: self.domain_age_days,
            content_fingerprint: self.content_fingerprint,
            threat_status: ThreatStatus::parse(&self.threat_status),
            threats,
            threat_checked_at: parse_ts_opt(self.threat_checked_at)?,
            risk_probability: self.risk_probability,
            risk_level: RiskLevel::parse(&self.risk_level),
            risk_reasons: reasons,
            risk_signals: signals,
            spam_score: self.spam_score.map(|s| s.clamp(0, 100) as u8),
        })
    }
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, PipelineError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PipelineError::Db(format!("bad timestamp {}: {}", value, e)))
}

fn parse_ts_opt(value: Option<String>) -> Result<Option<DateTime<Utc>>, PipelineError> {
    value.as_deref().map(parse_ts).transpose()
}
