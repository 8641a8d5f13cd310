//! Submits a task's links to the classifier in capped, strictly sequential
//! batches and folds the per-batch answers into one task-level result.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::core::breaker::CircuitBreaker;
use crate::core::error::ClassifierError;
use crate::core::types::VerdictItem;
use crate::sources::classifier::{ClassifierRequest, LinkClassifier, LinkPayload, SummaryContext};

/// Counter fields carried by classifier summaries.
pub const SUMMARY_FIELDS: [&str; 4] = [
    "high_risk_count",
    "medium_risk_count",
    "low_risk_count",
    "total_analyzed",
];

pub fn batch_id(task_id: &str, index: usize) -> String {
    format!("{}_batch_{}", task_id, index + 1)
}

/// Contiguous, order-preserving batches of at most `cap` items.
pub fn partition<T>(items: &[T], cap: usize) -> Vec<&[T]> {
    items.chunks(cap.max(1)).collect()
}

/// Non-negative integer view of a summary field; anything else is 0.
pub fn coerce_count(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f > 0.0).map(|f| f as u64))
            .unwrap_or(0),
        _ => 0,
    }
}

/// Fold per-batch summaries into one.
///
/// No summaries gives an empty object, a single one is returned untouched,
/// several are summed counter by counter.
pub fn merge_batch_summaries(summaries: &[Value]) -> Value {
    match summaries {
        [] => Value::Object(Map::new()),
        [only] => only.clone(),
        many => {
            let mut merged = Map::new();
            for field in SUMMARY_FIELDS {
                let total: u64 = many.iter().map(|s| coerce_count(s.get(field))).sum();
                merged.insert(field.to_string(), json!(total));
            }
            Value::Object(merged)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RiskCounts {
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    pub total_analyzed: u64,
}

impl RiskCounts {
    pub fn from_summary(summary: &Value) -> Self {
        Self {
            high: coerce_count(summary.get("high_risk_count")),
            medium: coerce_count(summary.get("medium_risk_count")),
            low: coerce_count(summary.get("low_risk_count")),
            total_analyzed: coerce_count(summary.get("total_analyzed")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchFailure {
    pub batch_id: String,
    pub code: String,
    pub message: String,
}

/// Everything collected over the batches of one task attempt.
#[derive(Debug, Clone, Default)]
pub struct BatchRun {
    pub items: Vec<VerdictItem>,
    pub summary: Value,
    pub batches_total: usize,
    pub batches_succeeded: usize,
    pub failures: Vec<BatchFailure>,
    pub raw_responses: Vec<Value>,
    pub latency_ms: u64,
}

impl BatchRun {
    pub fn counts(&self) -> RiskCounts {
        RiskCounts::from_summary(&self.summary)
    }

    pub fn raw_payload(&self) -> Value {
        json!({
            "batches": self.raw_responses,
            "failures": self
                .failures
                .iter()
                .map(|f| json!({"batch": f.batch_id, "code": f.code, "message": f.message}))
                .collect::<Vec<_>>(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    CircuitOpen,
    NotConfigured,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::CircuitOpen => "circuit_breaker_open",
            AbortReason::NotConfigured => "classifier_not_configured",
        }
    }
}

#[derive(Debug, Clone)]
pub enum BatchOutcome {
    /// At least one batch produced verdicts.
    Completed(BatchRun),
    /// Batches succeeded but none returned any item.
    Empty(BatchRun),
    /// Every batch failed with a classifier error.
    AllFailed(BatchRun),
    /// The remaining batches were not attempted. `run` holds whatever the
    /// batches before the stop returned.
    Aborted { reason: AbortReason, run: BatchRun },
}

pub struct BatchOrchestrator {
    classifier: Arc<dyn LinkClassifier>,
    breaker: Arc<CircuitBreaker>,
    max_items_per_batch: usize,
    call_timeout: Duration,
}

impl BatchOrchestrator {
    pub fn new(
        classifier: Arc<dyn LinkClassifier>,
        breaker: Arc<CircuitBreaker>,
        max_items_per_batch: usize,
        call_timeout: Duration,
    ) -> Self {
        Self {
            classifier,
            breaker,
            max_items_per_batch: max_items_per_batch.max(1),
            call_timeout,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn classifier(&self) -> &Arc<dyn LinkClassifier> {
        &self.classifier
    }

    /// Run every batch of one task in order.
    ///
    /// Batch-level classifier errors are counted and skipped; an open breaker
    /// or an unconfigured classifier stops the run; `Internal` errors are
    /// returned and fail the task.
    pub async fn run(
        &self,
        domain: &str,
        task_id: &str,
        payloads: &[LinkPayload],
        context: &SummaryContext,
    ) -> Result<BatchOutcome, ClassifierError> {
        let started = Instant::now();
        let batches = partition(payloads, self.max_items_per_batch);
        let mut run = BatchRun {
            batches_total: batches.len(),
            ..BatchRun::default()
        };
        let mut summaries = Vec::new();

        info!(
            task_id,
            domain,
            links = payloads.len(),
            batches = batches.len(),
            "submitting links to classifier"
        );

        for (index, batch) in batches.into_iter().enumerate() {
            let id = batch_id(task_id, index);
            if !self.breaker.is_enabled() {
                return Ok(aborted(AbortReason::NotConfigured, run, &summaries, started));
            }
            if !self.breaker.should_process() {
                warn!(
                    task_id,
                    batch = %id,
                    verdicts_so_far = run.items.len(),
                    "circuit breaker open; aborting remaining batches"
                );
                return Ok(aborted(AbortReason::CircuitOpen, run, &summaries, started));
            }

            let request = ClassifierRequest {
                domain: domain.to_string(),
                task_id: id.clone(),
                links: batch.to_vec(),
                summary: context.clone(),
            };
            let result = match tokio::time::timeout(
                self.call_timeout,
                self.classifier.classify(&request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ClassifierError::Timeout),
            };

            match result {
                Ok(resp) => {
                    debug!(task_id, batch = %id, items = resp.items.len(), "batch classified");
                    run.batches_succeeded += 1;
                    run.raw_responses.push(json!({
                        "batch": id,
                        "items": resp.items,
                        "summary": resp.summary,
                    }));
                    summaries.push(resp.summary);
                    run.items.extend(resp.items);
                }
                Err(ClassifierError::NotConfigured) => {
                    warn!(task_id, batch = %id, "classifier reports it is not configured");
                    return Ok(aborted(AbortReason::NotConfigured, run, &summaries, started));
                }
                Err(err) if err.is_batch_level() => {
                    let failures = self.breaker.record_failure();
                    warn!(
                        task_id,
                        batch = %id,
                        code = err.code(),
                        breaker_failures = failures,
                        "batch failed; continuing with next batch: {}",
                        err
                    );
                    run.failures.push(BatchFailure {
                        batch_id: id,
                        code: err.code().to_string(),
                        message: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        run.summary = merge_batch_summaries(&summaries);
        run.latency_ms = started.elapsed().as_millis() as u64;

        Ok(if run.batches_succeeded == 0 && run.batches_total > 0 {
            BatchOutcome::AllFailed(run)
        } else if run.items.is_empty() {
            BatchOutcome::Empty(run)
        } else {
            BatchOutcome::Completed(run)
        })
    }
}

/// Close out a run stopped early, keeping what the finished batches returned.
fn aborted(reason: AbortReason, mut run: BatchRun, summaries: &[Value], started: Instant) -> BatchOutcome {
    run.summary = merge_batch_summaries(summaries);
    run.latency_ms = started.elapsed().as_millis() as u64;
    BatchOutcome::Aborted { reason, run }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_covers_input_exactly_once_within_cap() {
        for n in 0..60usize {
            let items: Vec<usize> = (0..n).collect();
            for cap in 1..=10usize {
                let batches = partition(&items, cap);
                assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= cap));
                let flat: Vec<usize> = batches.iter().flat_map(|b| b.iter().copied()).collect();
                assert_eq!(flat, items, "n={n} cap={cap}");
            }
        }
    }

    #[test]
    fn twenty_three_links_make_three_batches() {
        let items: Vec<u8> = vec![0; 23];
        let sizes: Vec<usize> = partition(&items, 10).iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![10, 10, 3]);
        assert_eq!(batch_id("task42", 2), "task42_batch_3");
    }

    #[test]
    fn merge_handles_zero_one_and_many() {
        assert_eq!(merge_batch_summaries(&[]), json!({}));

        let single = json!({"high_risk_count": 2, "model": "v3"});
        assert_eq!(merge_batch_summaries(&[single.clone()]), single);

        let merged = merge_batch_summaries(&[
            json!({"high_risk_count": 2, "medium_risk_count": 1, "low_risk_count": 7, "total_analyzed": 10}),
            json!({"high_risk_count": "lots", "medium_risk_count": 3, "total_analyzed": 3.0}),
            Value::Null,
        ]);
        assert_eq!(
            merged,
            json!({"high_risk_count": 2, "medium_risk_count": 4, "low_risk_count": 7, "total_analyzed": 13})
        );
    }

    #[test]
    fn coerce_count_rejects_negative_and_non_numeric() {
        assert_eq!(coerce_count(Some(&json!(-3))), 0);
        assert_eq!(coerce_count(Some(&json!("4"))), 0);
        assert_eq!(coerce_count(Some(&json!(4.9))), 4);
        assert_eq!(coerce_count(None), 0);
    }
}
