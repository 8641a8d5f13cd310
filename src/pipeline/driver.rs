//! Advances tasks from pending to a terminal state.
//!
//! The driver owns the task lifecycle: it selects eligible tasks, runs
//! enrichment and classification for each, persists the outcome on both the
//! task and its detection record, and purges every derived cache entry on
//! each exit path.

use std::sync::{Arc, Mutex};

use chrono::Duration;
use serde::Serialize;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{error, info, instrument, warn};

use crate::config::SweepConfig;
use crate::core::cache::ResultCache;
use crate::core::error::PipelineError;
use crate::core::store::Store;
use crate::core::time::Clock;
use crate::core::types::{
    BacklinksSummary, DetectionRecord, DetectionStatus, DetectionSummary, LinkRecord, RiskSummary,
    Task, TaskResult, TaskState, ThreatStatus, RESULT_VERSION,
};
use crate::pipeline::batcher::{AbortReason, BatchOrchestrator, BatchOutcome, BatchRun};
use crate::pipeline::enricher::Enricher;
use crate::pipeline::normalizer::normalize_source_url;
use crate::pipeline::reconciler::{apply_verdicts, merge_snapshot};
use crate::pipeline::reporter::{summarize_backlinks, summarize_risk};
use crate::sources::classifier::{LinkPayload, SummaryContext};

pub const EMPTY_RESPONSE: &str = "empty_response";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessOutcome {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Tasks force-failed for exceeding twice the max age.
    pub expired: usize,
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub limit: usize,
    pub max_age_hours: i64,
    pub concurrency: usize,
    pub no_backlinks_grace_hours: i64,
}

impl From<&SweepConfig> for DriverSettings {
    fn from(cfg: &SweepConfig) -> Self {
        Self {
            limit: cfg.limit,
            max_age_hours: cfg.max_age_hours,
            concurrency: cfg.concurrency.max(1),
            no_backlinks_grace_hours: cfg.no_backlinks_grace_hours,
        }
    }
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self::from(&SweepConfig::default())
    }
}

#[derive(Clone)]
pub struct TaskDriver {
    store: Arc<Mutex<Store>>,
    orchestrator: Arc<BatchOrchestrator>,
    enricher: Arc<Enricher>,
    cache: Arc<ResultCache>,
    clock: Arc<dyn Clock>,
    settings: DriverSettings,
}

impl TaskDriver {
    pub fn new(
        store: Arc<Mutex<Store>>,
        orchestrator: Arc<BatchOrchestrator>,
        enricher: Arc<Enricher>,
        cache: Arc<ResultCache>,
        clock: Arc<dyn Clock>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            store,
            orchestrator,
            enricher,
            cache,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Run `op` against the store. The lock is never held across an await.
    pub fn with_store<T>(
        &self,
        op: impl FnOnce(&mut Store) -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        let mut guard = self
            .store
            .lock()
            .map_err(|_| PipelineError::Db("store lock poisoned".into()))?;
        op(&mut guard)
    }

    pub fn select_eligible_tasks(
        &self,
        limit: usize,
        max_age_hours: i64,
        force: bool,
    ) -> Result<Vec<Task>, PipelineError> {
        let now = self.clock.now();
        self.with_store(|s| s.eligible_tasks(limit, Duration::hours(max_age_hours), force, now))
    }

    /// Process one task by id. Terminal tasks are left alone unless `force`.
    pub async fn process_by_id(
        &self,
        task_id: &str,
        force: bool,
    ) -> Result<ProcessOutcome, PipelineError> {
        let task = self
            .with_store(|s| s.get_task(task_id))?
            .ok_or_else(|| PipelineError::NotFound(format!("task {}", task_id)))?;
        if task.status().is_terminal() && !force {
            info!(task_id, status = task.status().as_str(), "task already finished; use force to re-run");
            return Ok(ProcessOutcome::Skipped);
        }
        self.process_task(&task).await
    }

    /// Advance one task. Unexpected errors are recorded on the task and its
    /// detection record; `Err` is only returned when even that write fails.
    #[instrument(skip(self, task), fields(task_id = %task.task_id, domain = %task.domain))]
    pub async fn process_task(&self, task: &Task) -> Result<ProcessOutcome, PipelineError> {
        let result = match self.run_task(task).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                error!("task processing failed: {}", err);
                self.record_failure(task, &err.to_string())
                    .map(|_| ProcessOutcome::Failed)
            }
        };
        self.invalidate(task);
        result
    }

    async fn run_task(&self, task: &Task) -> Result<ProcessOutcome, PipelineError> {
        let task_id = task.task_id.as_str();
        let now = self.clock.now();
        let links = self.with_store(|s| s.links_for_task(task_id))?;

        if links.is_empty() {
            let grace = Duration::hours(self.settings.no_backlinks_grace_hours);
            if task.age(now) > grace {
                let message = format!(
                    "no backlinks after {}h",
                    self.settings.no_backlinks_grace_hours
                );
                warn!(task_id, "{}; failing task", message);
                self.record_failure(task, &message)?;
                return Ok(ProcessOutcome::Failed);
            }
            warn!(task_id, "task has no backlinks yet; skipping");
            return Ok(ProcessOutcome::Skipped);
        }

        let mut processing = task.clone();
        processing.state = TaskState::Processing { started_at: now };
        self.with_store(|s| s.upsert_task(&processing, now))?;

        let mut detection = DetectionRecord::pending(task_id, now);
        self.with_store(|s| s.upsert_detection(&detection))?;

        let mut fresh = links;
        let enrichment = self.enricher.enrich(task_id, &mut fresh).await;
        if let Err(err) = self.with_store(|s| s.upsert_links(&fresh)) {
            warn!(task_id, "could not persist enrichment: {}", err);
        }

        let backlinks = summarize_backlinks(&fresh);
        let flagged = fresh
            .iter()
            .filter(|r| r.threat_status == ThreatStatus::Flagged)
            .count() as u64;
        info!(
            task_id,
            links = fresh.len(),
            unique_domains = backlinks.unique_domains,
            flagged,
            whois_found = enrichment.whois_found,
            "backlinks ready for classification"
        );

        if !self.orchestrator.classifier().is_configured() || !self.orchestrator.breaker().is_enabled()
        {
            return self.finish_not_configured(task, detection, &fresh, backlinks);
        }

        let payloads: Vec<LinkPayload> = fresh.iter().map(LinkPayload::from).collect();
        let context = SummaryContext::new(&backlinks, flagged);
        let outcome = self
            .orchestrator
            .run(&task.domain, task_id, &payloads, &context)
            .await
            .map_err(|err| PipelineError::Provider(err.to_string()))?;

        match outcome {
            BatchOutcome::Completed(run) => {
                let applied = apply_verdicts(&mut fresh, &run.items);
                if !applied.unmatched.is_empty() {
                    warn!(
                        task_id,
                        unmatched = applied.unmatched.len(),
                        "classifier returned verdicts for unknown links"
                    );
                }
                self.with_store(|s| s.upsert_links(&fresh))?;
                let snapshot = self.snapshot(task_id, &fresh)?;

                let message = (!run.failures.is_empty()).then(|| {
                    format!(
                        "{} of {} batches failed",
                        run.failures.len(),
                        run.batches_total
                    )
                });
                fill_detection(&mut detection, &run, DetectionStatus::Completed, message, self.clock.now());
                self.with_store(|s| s.upsert_detection(&detection))?;
                self.orchestrator.breaker().record_success();

                let risk = summarize_risk(&snapshot);
                self.complete(task, backlinks, Some(risk), &detection, &run)?;
                info!(task_id, matched = applied.matched, "detection completed");
                Ok(ProcessOutcome::Success)
            }
            BatchOutcome::Empty(run) => {
                fill_detection(
                    &mut detection,
                    &run,
                    DetectionStatus::Skipped,
                    Some(EMPTY_RESPONSE.to_string()),
                    self.clock.now(),
                );
                self.with_store(|s| s.upsert_detection(&detection))?;
                let risk = summarize_risk(&self.snapshot(task_id, &fresh)?);
                self.complete(task, backlinks, Some(risk), &detection, &run)?;
                info!(task_id, "classifier returned no verdicts");
                Ok(ProcessOutcome::Success)
            }
            BatchOutcome::AllFailed(run) => {
                let last = run
                    .failures
                    .last()
                    .map(|f| f.message.clone())
                    .unwrap_or_default();
                let message = format!("all {} batches failed: {}", run.batches_total, last);
                fill_detection(&mut detection, &run, DetectionStatus::Failed, Some(message), self.clock.now());
                self.with_store(|s| s.upsert_detection(&detection))?;
                let risk = summarize_risk(&self.snapshot(task_id, &fresh)?);
                self.complete(task, backlinks, Some(risk), &detection, &run)?;
                warn!(task_id, "every classifier batch failed; task completed without verdicts");
                Ok(ProcessOutcome::Success)
            }
            BatchOutcome::Aborted {
                reason: AbortReason::NotConfigured,
                ..
            } => self.finish_not_configured(task, detection, &fresh, backlinks),
            BatchOutcome::Aborted {
                reason: AbortReason::CircuitOpen,
                run,
            } => {
                // the task stays in processing and is picked up by a later sweep,
                // verdicts from batches that finished before the stop are kept
                let applied = apply_verdicts(&mut fresh, &run.items);
                if applied.matched > 0 {
                    self.with_store(|s| s.upsert_links(&fresh))?;
                }
                fill_detection(
                    &mut detection,
                    &run,
                    DetectionStatus::Skipped,
                    Some(AbortReason::CircuitOpen.as_str().to_string()),
                    self.clock.now(),
                );
                self.with_store(|s| s.upsert_detection(&detection))?;
                warn!(
                    task_id,
                    kept = applied.matched,
                    batches_failed = run.failures.len(),
                    "circuit breaker open; task attempt aborted"
                );
                Ok(ProcessOutcome::Skipped)
            }
        }
    }

    fn finish_not_configured(
        &self,
        task: &Task,
        mut detection: DetectionRecord,
        fresh: &[LinkRecord],
        backlinks: BacklinksSummary,
    ) -> Result<ProcessOutcome, PipelineError> {
        let run = BatchRun::default();
        fill_detection(
            &mut detection,
            &run,
            DetectionStatus::Skipped,
            Some(AbortReason::NotConfigured.as_str().to_string()),
            self.clock.now(),
        );
        self.with_store(|s| s.upsert_detection(&detection))?;
        let risk = summarize_risk(&self.snapshot(&task.task_id, fresh)?);
        self.complete(task, backlinks, Some(risk), &detection, &run)?;
        info!(task_id = %task.task_id, "classifier not configured; detection skipped");
        Ok(ProcessOutcome::Skipped)
    }

    /// In-memory values from this pass, with persisted values filling the
    /// fields this pass had no opinion on.
    fn snapshot(&self, task_id: &str, fresh: &[LinkRecord]) -> Result<Vec<LinkRecord>, PipelineError> {
        let persisted = self.with_store(|s| s.links_for_task(task_id))?;
        Ok(fresh
            .iter()
            .map(|f| {
                let key = normalize_source_url(&f.source_url);
                let old = persisted.iter().find(|p| {
                    p.domain == f.domain && normalize_source_url(&p.source_url) == key
                });
                merge_snapshot(f, old)
            })
            .collect())
    }

    fn complete(
        &self,
        task: &Task,
        backlinks: BacklinksSummary,
        risk: Option<RiskSummary>,
        detection: &DetectionRecord,
        run: &BatchRun,
    ) -> Result<(), PipelineError> {
        let now = self.clock.now();
        let mut done = task.clone();
        done.state = TaskState::Completed {
            completed_at: now,
            result: TaskResult {
                version: RESULT_VERSION,
                backlinks,
                risk,
                detection: detection_summary(detection, run),
            },
        };
        self.with_store(|s| s.upsert_task(&done, now))
    }

    /// Mark the detection and the task failed with `message`, keeping
    /// whatever backlink data already exists as a partial result.
    fn record_failure(&self, task: &Task, message: &str) -> Result<(), PipelineError> {
        let now = self.clock.now();
        let task_id = task.task_id.as_str();

        let mut detection = self
            .with_store(|s| s.get_detection(task_id))?
            .unwrap_or_else(|| DetectionRecord::pending(task_id, now));
        detection.status = DetectionStatus::Failed;
        detection.status_message = Some(message.to_string());
        detection.completed_at = Some(now);
        self.with_store(|s| s.upsert_detection(&detection))?;

        let links = self.with_store(|s| s.links_for_task(task_id))?;
        let partial = (!links.is_empty()).then(|| TaskResult {
            version: RESULT_VERSION,
            backlinks: summarize_backlinks(&links),
            risk: Some(summarize_risk(&links)),
            detection: detection_summary(&detection, &BatchRun::default()),
        });

        let mut failed = task.clone();
        failed.state = TaskState::Failed {
            failed_at: now,
            error: message.to_string(),
            partial,
        };
        self.with_store(|s| s.upsert_task(&failed, now))
    }

    fn invalidate(&self, task: &Task) {
        let purged = self.cache.invalidate(&task.task_id, &task.domain);
        tracing::debug!(task_id = %task.task_id, purged, "cache entries purged");
    }

    fn force_fail(&self, task: &Task, message: &str) -> Result<(), PipelineError> {
        let result = self.record_failure(task, message);
        self.invalidate(task);
        result
    }

    /// One maintenance pass: expire tasks stuck past twice the max age, then
    /// process eligible tasks oldest first with bounded concurrency.
    #[instrument(skip(self))]
    pub async fn sweep(
        &self,
        limit: usize,
        max_age_hours: i64,
        force: bool,
    ) -> Result<SweepReport, PipelineError> {
        let mut report = SweepReport::default();
        let now = self.clock.now();
        let hard_limit = Duration::hours(max_age_hours.saturating_mul(2));

        let stuck = self.with_store(|s| s.stuck_tasks(now - hard_limit))?;
        for task in stuck {
            let message = format!(
                "task stuck in {} for more than {}h; force-failed by sweep",
                task.status().as_str(),
                hard_limit.num_hours()
            );
            warn!(task_id = %task.task_id, "{}", message);
            match self.force_fail(&task, &message) {
                Ok(()) => report.expired += 1,
                Err(err) => error!(task_id = %task.task_id, "could not force-fail task: {}", err),
            }
        }

        let tasks = self.select_eligible_tasks(limit, max_age_hours, force)?;
        info!(
            eligible = tasks.len(),
            breaker = ?self.orchestrator.breaker().state(),
            "sweep started"
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut workers = JoinSet::new();
        for task in tasks {
            // acquiring before spawning keeps start order FIFO
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| PipelineError::Unknown)?;
            let driver = self.clone();
            workers.spawn(async move {
                let outcome = driver.process_task(&task).await;
                drop(permit);
                (task, outcome)
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, Ok(ProcessOutcome::Success))) => report.processed += 1,
                Ok((_, Ok(ProcessOutcome::Failed))) => report.failed += 1,
                Ok((_, Ok(ProcessOutcome::Skipped))) => report.skipped += 1,
                Ok((task, Err(err))) => {
                    report.failed += 1;
                    error!(task_id = %task.task_id, "task errored during sweep: {}", err);
                    if task.age(self.clock.now()) > hard_limit {
                        let message = format!(
                            "force-failed after {}h: {}",
                            hard_limit.num_hours(),
                            err
                        );
                        if let Err(err) = self.force_fail(&task, &message) {
                            error!(task_id = %task.task_id, "could not force-fail task: {}", err);
                        }
                    }
                }
                Err(join_err) => {
                    report.failed += 1;
                    error!("sweep worker aborted: {}", join_err);
                }
            }
        }

        info!(
            processed = report.processed,
            failed = report.failed,
            skipped = report.skipped,
            expired = report.expired,
            "sweep finished"
        );
        Ok(report)
    }
}

fn fill_detection(
    detection: &mut DetectionRecord,
    run: &BatchRun,
    status: DetectionStatus,
    message: Option<String>,
    now: chrono::DateTime<chrono::Utc>,
) {
    let counts = run.counts();
    detection.status = status;
    detection.status_message = message;
    detection.high_risk_count = counts.high;
    detection.medium_risk_count = counts.medium;
    detection.low_risk_count = counts.low;
    detection.latency_ms = Some(run.latency_ms);
    detection.completed_at = Some(now);
    detection.summary = if run.summary.is_null() {
        serde_json::json!({})
    } else {
        run.summary.clone()
    };
    detection.raw_response = run.raw_payload();
}

fn detection_summary(detection: &DetectionRecord, run: &BatchRun) -> DetectionSummary {
    DetectionSummary {
        status: detection.status,
        message: detection.status_message.clone(),
        high_risk_count: detection.high_risk_count,
        medium_risk_count: detection.medium_risk_count,
        low_risk_count: detection.low_risk_count,
        total_analyzed: run.counts().total_analyzed,
        batches_total: run.batches_total,
        batches_failed: run.failures.len(),
        latency_ms: detection.latency_ms,
    }
}
