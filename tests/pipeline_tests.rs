use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use backlink_risk::core::breaker::{BreakerSettings, CircuitBreaker};
use backlink_risk::core::cache::{report_key, ResultCache};
use backlink_risk::core::error::ClassifierError;
use backlink_risk::core::store::Store;
use backlink_risk::core::time::{Clock, ManualClock};
use backlink_risk::core::types::{
    DetectionStatus, LinkRecord, RiskLevel, Task, TaskState, TaskStatus, VerdictItem,
};
use backlink_risk::pipeline::batcher::BatchOrchestrator;
use backlink_risk::pipeline::driver::{DriverSettings, ProcessOutcome, SweepReport, TaskDriver};
use backlink_risk::pipeline::enricher::Enricher;
use backlink_risk::pipeline::reporter::{build_task_report, cached_task_report};
use backlink_risk::sources::classifier::{ClassifierRequest, ClassifierResponse, LinkClassifier};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;

enum Behavior {
    Verdicts,
    Empty,
    Fail(ClassifierError),
    Hang,
}

struct ScriptedClassifier {
    configured: bool,
    script: Box<dyn Fn(&ClassifierRequest) -> Behavior + Send + Sync>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedClassifier {
    fn new(script: impl Fn(&ClassifierRequest) -> Behavior + Send + Sync + 'static) -> Self {
        Self {
            configured: true,
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

/// One high-risk verdict per link, addressed with a differently-cased URL
/// carrying a trailing slash.
fn verdicts_for(request: &ClassifierRequest) -> ClassifierResponse {
    let items: Vec<VerdictItem> = request
        .links
        .iter()
        .map(|l| VerdictItem {
            source_url: format!("{}/", l.source_url.to_uppercase()),
            probability: Some(0.8),
            risk_level: Some("high".into()),
            reasons: vec!["shared_ip_block".into()],
            signals: Default::default(),
        })
        .collect();
    let n = items.len();
    ClassifierResponse {
        items,
        summary: json!({
            "high_risk_count": n,
            "medium_risk_count": 0,
            "low_risk_count": 0,
            "total_analyzed": n
        }),
    }
}

#[async_trait]
impl LinkClassifier for ScriptedClassifier {
    fn name(&self) -> &str {
        "scripted"
    }

    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn classify(
        &self,
        request: &ClassifierRequest,
    ) -> Result<ClassifierResponse, ClassifierError> {
        self.calls.lock().unwrap().push(request.task_id.clone());
        match (self.script)(request) {
            Behavior::Verdicts => Ok(verdicts_for(request)),
            Behavior::Empty => Ok(ClassifierResponse {
                items: vec![],
                summary: json!({}),
            }),
            Behavior::Fail(err) => Err(err),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(verdicts_for(request))
            }
        }
    }
}

struct Harness {
    driver: TaskDriver,
    clock: Arc<ManualClock>,
    breaker: Arc<CircuitBreaker>,
    classifier: Arc<ScriptedClassifier>,
    cache: Arc<ResultCache>,
}

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn harness(classifier: ScriptedClassifier) -> Harness {
    harness_over(classifier, Store::open_in_memory().unwrap())
}

fn harness_over(classifier: ScriptedClassifier, store: Store) -> Harness {
    let clock = Arc::new(ManualClock::new(t0()));
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let breaker = Arc::new(CircuitBreaker::new(
        "scripted",
        BreakerSettings::default(),
        dyn_clock.clone(),
    ));
    let classifier = Arc::new(classifier);
    let orchestrator = BatchOrchestrator::new(
        classifier.clone(),
        breaker.clone(),
        10,
        Duration::from_millis(50),
    );
    let cache = Arc::new(ResultCache::new(Duration::from_secs(600)));
    let driver = TaskDriver::new(
        Arc::new(Mutex::new(store)),
        Arc::new(orchestrator),
        Arc::new(Enricher::disabled(dyn_clock.clone())),
        cache.clone(),
        dyn_clock,
        DriverSettings::default(),
    );
    Harness {
        driver,
        clock,
        breaker,
        classifier,
        cache,
    }
}

fn seed(driver: &TaskDriver, task_id: &str, links: usize, submitted_at: DateTime<Utc>) -> Task {
    let task = Task::new(task_id, "example.com", submitted_at);
    let records: Vec<LinkRecord> = (0..links)
        .map(|i| LinkRecord::new("example.com", format!("https://site{i}.net/page"), task_id))
        .collect();
    driver
        .with_store(|s| {
            s.upsert_task(&task, submitted_at)?;
            s.upsert_links(&records)
        })
        .unwrap();
    task
}

fn load_task(driver: &TaskDriver, task_id: &str) -> Task {
    driver.with_store(|s| s.get_task(task_id)).unwrap().unwrap()
}

#[tokio::test]
async fn timed_out_middle_batch_still_completes_task() {
    let h = harness(ScriptedClassifier::new(|req| {
        if req.task_id.ends_with("_batch_2") {
            Behavior::Hang
        } else {
            Behavior::Verdicts
        }
    }));
    let task = seed(&h.driver, "t23", 23, t0());

    let outcome = h.driver.process_task(&task).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Success);
    assert_eq!(h.classifier.calls(), vec!["t23_batch_1", "t23_batch_2", "t23_batch_3"]);

    let detection = h.driver.with_store(|s| s.get_detection("t23")).unwrap().unwrap();
    assert_eq!(detection.status, DetectionStatus::Completed);
    assert_eq!(detection.high_risk_count, 13);
    assert_eq!(
        detection.summary,
        json!({"high_risk_count": 13, "medium_risk_count": 0, "low_risk_count": 0, "total_analyzed": 13})
    );

    match load_task(&h.driver, "t23").state {
        TaskState::Completed { result, .. } => {
            assert_eq!(result.backlinks.total, 23);
            assert_eq!(result.detection.batches_total, 3);
            assert_eq!(result.detection.batches_failed, 1);
            assert_eq!(result.risk.unwrap().high, 13);
        }
        other => panic!("unexpected state {other:?}"),
    }

    let links = h.driver.with_store(|s| s.links_for_task("t23")).unwrap();
    let high = links.iter().filter(|l| l.risk_level == RiskLevel::High).count();
    assert_eq!(high, 13);
    assert!(links[10..20].iter().all(|l| l.risk_level == RiskLevel::Unknown));
    // success after the timed-out batch clears the breaker
    assert_eq!(h.breaker.failure_count(), 0);
}

#[tokio::test]
async fn empty_classifier_answer_skips_detection_but_completes_task() {
    let h = harness(ScriptedClassifier::new(|_| Behavior::Empty));
    let task = seed(&h.driver, "t-empty", 4, t0());

    assert_eq!(h.driver.process_task(&task).await.unwrap(), ProcessOutcome::Success);
    let detection = h.driver.with_store(|s| s.get_detection("t-empty")).unwrap().unwrap();
    assert_eq!(detection.status, DetectionStatus::Skipped);
    assert_eq!(detection.status_message.as_deref(), Some("empty_response"));
    assert_eq!(load_task(&h.driver, "t-empty").status(), TaskStatus::Completed);
}

#[tokio::test]
async fn every_batch_failing_fails_detection_not_task() {
    let h = harness(ScriptedClassifier::new(|_| {
        Behavior::Fail(ClassifierError::Transport("connection reset".into()))
    }));
    let task = seed(&h.driver, "t-down", 23, t0());

    assert_eq!(h.driver.process_task(&task).await.unwrap(), ProcessOutcome::Success);
    let detection = h.driver.with_store(|s| s.get_detection("t-down")).unwrap().unwrap();
    assert_eq!(detection.status, DetectionStatus::Failed);
    assert!(detection.status_message.unwrap().contains("connection reset"));
    assert_eq!(load_task(&h.driver, "t-down").status(), TaskStatus::Completed);
    assert_eq!(h.breaker.failure_count(), 3);
}

#[tokio::test]
async fn open_breaker_aborts_attempt_until_cooldown_passes() {
    let h = harness(ScriptedClassifier::new(|_| Behavior::Verdicts));
    let task = seed(&h.driver, "t-open", 5, t0());
    for _ in 0..5 {
        h.breaker.record_failure();
    }

    assert_eq!(h.driver.process_task(&task).await.unwrap(), ProcessOutcome::Skipped);
    assert!(h.classifier.calls().is_empty());
    let detection = h.driver.with_store(|s| s.get_detection("t-open")).unwrap().unwrap();
    assert_eq!(detection.status, DetectionStatus::Skipped);
    assert_eq!(detection.status_message.as_deref(), Some("circuit_breaker_open"));
    assert_eq!(load_task(&h.driver, "t-open").status(), TaskStatus::Processing);

    h.clock.advance(ChronoDuration::minutes(11));
    let task = load_task(&h.driver, "t-open");
    assert_eq!(h.driver.process_task(&task).await.unwrap(), ProcessOutcome::Success);
    assert_eq!(load_task(&h.driver, "t-open").status(), TaskStatus::Completed);
    assert_eq!(h.breaker.failure_count(), 0);
}

#[tokio::test]
async fn unconfigured_classifier_skips_detection() {
    let mut classifier = ScriptedClassifier::new(|_| Behavior::Verdicts);
    classifier.configured = false;
    let h = harness(classifier);
    let task = seed(&h.driver, "t-nocfg", 2, t0());

    assert_eq!(h.driver.process_task(&task).await.unwrap(), ProcessOutcome::Skipped);
    assert!(h.classifier.calls().is_empty());
    let detection = h.driver.with_store(|s| s.get_detection("t-nocfg")).unwrap().unwrap();
    assert_eq!(detection.status_message.as_deref(), Some("classifier_not_configured"));
    assert_eq!(load_task(&h.driver, "t-nocfg").status(), TaskStatus::Completed);
}

#[tokio::test]
async fn internal_error_fails_task_but_keeps_partial_backlinks() {
    let h = harness(ScriptedClassifier::new(|_| {
        Behavior::Fail(ClassifierError::Internal("payload encoder panicked".into()))
    }));
    let task = seed(&h.driver, "t-bug", 3, t0());

    assert_eq!(h.driver.process_task(&task).await.unwrap(), ProcessOutcome::Failed);
    let report = h.driver.with_store(|s| build_task_report(s, "t-bug")).unwrap();
    assert_eq!(report.status, TaskStatus::Failed);
    assert!(report.error.as_deref().unwrap().contains("payload encoder panicked"));
    assert_eq!(report.backlinks.len(), 3);
    assert_eq!(report.result.unwrap().backlinks.total, 3);
    assert_eq!(report.pbn_detection.status, "failed");
    assert!(report.pbn_detection.error.unwrap().contains("payload encoder panicked"));
}

#[tokio::test]
async fn task_without_backlinks_waits_then_fails() {
    let h = harness(ScriptedClassifier::new(|_| Behavior::Verdicts));
    let task = seed(&h.driver, "t-late", 0, t0());

    assert_eq!(h.driver.process_task(&task).await.unwrap(), ProcessOutcome::Skipped);
    assert_eq!(load_task(&h.driver, "t-late").status(), TaskStatus::Pending);

    h.clock.advance(ChronoDuration::hours(49));
    assert_eq!(h.driver.process_task(&task).await.unwrap(), ProcessOutcome::Failed);
    match load_task(&h.driver, "t-late").state {
        TaskState::Failed { error, partial, .. } => {
            assert_eq!(error, "no backlinks after 48h");
            assert!(partial.is_none());
        }
        other => panic!("unexpected state {other:?}"),
    }
}

#[tokio::test]
async fn sweep_expires_stuck_tasks_and_processes_the_rest() {
    let h = harness(ScriptedClassifier::new(|_| Behavior::Verdicts));
    seed(&h.driver, "t-stuck", 2, t0() - ChronoDuration::hours(50));
    seed(&h.driver, "t-a", 3, t0() - ChronoDuration::hours(2));
    seed(&h.driver, "t-b", 1, t0() - ChronoDuration::hours(1));
    seed(&h.driver, "t-empty", 0, t0() - ChronoDuration::minutes(5));

    let report = h.driver.sweep(25, 24, false).await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.processed, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 0);

    match load_task(&h.driver, "t-stuck").state {
        TaskState::Failed { error, partial, .. } => {
            assert!(error.contains("force-failed"));
            assert_eq!(partial.unwrap().backlinks.total, 2);
        }
        other => panic!("unexpected state {other:?}"),
    }
    assert_eq!(load_task(&h.driver, "t-a").status(), TaskStatus::Completed);
    assert_eq!(load_task(&h.driver, "t-b").status(), TaskStatus::Completed);
    assert!(h.classifier.calls().iter().all(|c| !c.starts_with("t-stuck")));
}

#[tokio::test]
async fn rerunning_a_task_is_idempotent() {
    let h = harness(ScriptedClassifier::new(|_| Behavior::Verdicts));
    let task = seed(&h.driver, "t-twice", 12, t0());

    h.driver.process_task(&task).await.unwrap();
    let first = h.driver.with_store(|s| s.links_for_task("t-twice")).unwrap();
    assert_eq!(
        h.driver.process_by_id("t-twice", false).await.unwrap(),
        ProcessOutcome::Skipped
    );
    assert_eq!(
        h.driver.process_by_id("t-twice", true).await.unwrap(),
        ProcessOutcome::Success
    );
    let second = h.driver.with_store(|s| s.links_for_task("t-twice")).unwrap();

    assert_eq!(second.len(), 12);
    assert_eq!(first, second);
    assert_eq!(second[0].risk_reasons, vec!["shared_ip_block".to_string()]);
}

#[tokio::test]
async fn processing_purges_cached_report() {
    let h = harness(ScriptedClassifier::new(|_| Behavior::Verdicts));
    let task = seed(&h.driver, "t-cache", 2, t0());

    let before = h
        .driver
        .with_store(|s| cached_task_report(s, &h.cache, "t-cache"))
        .unwrap();
    assert_eq!(before["status"], "pending");
    assert!(h.cache.get(&report_key("t-cache")).is_some());

    h.driver.process_task(&task).await.unwrap();
    assert!(h.cache.get(&report_key("t-cache")).is_none());

    let after = h
        .driver
        .with_store(|s| cached_task_report(s, &h.cache, "t-cache"))
        .unwrap();
    assert_eq!(after["status"], "completed");
    assert_eq!(after["pbn_detection"]["status"], "completed");
}

#[tokio::test]
async fn breaker_opening_mid_task_keeps_earlier_verdicts() {
    let h = harness(ScriptedClassifier::new(|req| {
        if req.task_id.ends_with("_batch_1") {
            Behavior::Verdicts
        } else {
            Behavior::Fail(ClassifierError::Transport("connection reset".into()))
        }
    }));
    let task = seed(&h.driver, "t70", 70, t0());

    assert_eq!(h.driver.process_task(&task).await.unwrap(), ProcessOutcome::Skipped);
    // batches 2 to 6 trip the breaker, batch 7 is never sent
    assert_eq!(h.classifier.calls().len(), 6);
    assert_eq!(load_task(&h.driver, "t70").status(), TaskStatus::Processing);

    let links = h.driver.with_store(|s| s.links_for_task("t70")).unwrap();
    let classified = links.iter().filter(|l| l.risk_level == RiskLevel::High).count();
    assert_eq!(classified, 10);
    assert!(links[10..].iter().all(|l| l.risk_level == RiskLevel::Unknown));

    let detection = h.driver.with_store(|s| s.get_detection("t70")).unwrap().unwrap();
    assert_eq!(detection.status, DetectionStatus::Skipped);
    assert_eq!(detection.status_message.as_deref(), Some("circuit_breaker_open"));
    assert_eq!(detection.high_risk_count, 10);
}

#[tokio::test]
async fn task_updates_are_stamped_with_the_driver_clock() {
    let h = harness(ScriptedClassifier::new(|_| Behavior::Verdicts));
    let submitted = t0() - ChronoDuration::hours(3);
    let task = seed(&h.driver, "t-clock", 2, submitted);
    assert_eq!(
        h.driver.with_store(|s| s.task_updated_at("t-clock")).unwrap(),
        Some(submitted)
    );

    h.clock.advance(ChronoDuration::minutes(30));
    h.driver.process_task(&task).await.unwrap();
    let expected = t0() + ChronoDuration::minutes(30);
    let report = h.driver.with_store(|s| build_task_report(s, "t-clock")).unwrap();
    assert_eq!(report.updated_at, Some(expected));
    assert_eq!(report.finished_at, Some(expected));
}

fn scratch_db(name: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!(
        "backlink-risk-{}-{}.db",
        name,
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);
    path
}

#[tokio::test]
async fn sweep_force_fails_old_task_whose_failure_cannot_be_recorded() {
    let path = scratch_db("force-fail");
    let store = Store::new(&path).unwrap();
    // only the sweep's own force-fail message may reach the detections table
    rusqlite::Connection::open(&path)
        .unwrap()
        .execute_batch(
            "CREATE TRIGGER reject_detections BEFORE INSERT ON detections
             WHEN NEW.status_message IS NULL OR NEW.status_message NOT LIKE 'force-failed after%'
             BEGIN SELECT RAISE(ABORT, 'detections are read-only'); END;",
        )
        .unwrap();

    let h = harness_over(ScriptedClassifier::new(|_| Behavior::Verdicts), store);
    seed(&h.driver, "t-ancient", 2, t0() - ChronoDuration::hours(50));

    let report = h.driver.sweep(25, 24, true).await.unwrap();
    assert_eq!(
        report,
        SweepReport {
            processed: 0,
            failed: 1,
            skipped: 0,
            expired: 0,
        }
    );
    assert!(h.classifier.calls().is_empty());

    match load_task(&h.driver, "t-ancient").state {
        TaskState::Failed { error, partial, .. } => {
            assert!(error.starts_with("force-failed after 48h"), "{error}");
            assert_eq!(partial.unwrap().backlinks.total, 2);
        }
        other => panic!("unexpected state {other:?}"),
    }
    let detection = h.driver.with_store(|s| s.get_detection("t-ancient")).unwrap().unwrap();
    assert_eq!(detection.status, DetectionStatus::Failed);

    drop(h);
    let _ = std::fs::remove_file(&path);
}
