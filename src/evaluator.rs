//! # Evaluator
//!
//! The core reduction: folds an ordered interaction stream over a
//! starting state, one handler call per interaction, persisting an
//! evaluation record before advancing to the next step.
//!
//! ## Error containment and short-circuit
//!
//! A handler error (returned `result.error` or a trap the host already
//! converted into a value) is a property of the interaction, not of the
//! engine: the step is recorded with an error-only output, state carries
//! forward unchanged, and the fold halts at that sort key so downstream
//! readers see a stable, reproducible boundary. The evaluation as a
//! whole still resolves successfully; only source, cache, and
//! configuration failures abort it.
//!
//! ## Step state machine
//!
//! `Running → (StepOk | StepErr) → PersistPending →
//! (PersistOk → NextStep | PersistFail → Abort)`, with
//! `StepErr → PersistOk → Halt` instead of `NextStep`. Each step returns
//! `Flow<Control<Acc, Acc>, EvaluationError>` and the driver loop
//! inspects the [`Control`] tag.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio_stream::StreamExt;
use tracing::{debug, instrument, warn};

use crate::cache::{CacheError, EvaluationCache};
use crate::config::RetryConfig;
use crate::deps::ProcessStoreError;
use crate::flow::{Control, Flow};
use crate::host::{HostError, ModuleHost, ProcessHandler};
use crate::model::{
    EvaluationRecord, HandlerOutput, Interaction, ProcessId, SortKey,
};
use crate::source::{InteractionStream, SourceError};
use serde_json::Value;

pub type EvaluationResult<T> = Result<T, EvaluationError>;

/// Engine-level failure: the evaluation could not run or could not
/// commit. Distinct from a handler error, which is a value in the
/// output stream.
#[derive(Debug, Clone, Error)]
pub enum EvaluationError {
    #[error("configuration: {0}")]
    Configuration(String),

    #[error("interaction source: {0}")]
    Source(#[from] SourceError),

    #[error("evaluation cache: {0}")]
    Cache(#[from] CacheError),

    #[error("process store: {0}")]
    Process(#[from] ProcessStoreError),
}

impl From<HostError> for EvaluationError {
    fn from(error: HostError) -> Self {
        EvaluationError::Configuration(error.to_string())
    }
}

/// Inputs of one fold. `interactions` must be ordered strictly after
/// `start_sort_key`.
pub struct EvaluationPlan {
    pub process_id: ProcessId,
    pub src: Vec<u8>,
    pub start_state: Value,
    pub start_sort_key: Option<SortKey>,
    pub interactions: InteractionStream,
}

/// Outcome of a fold: the final state, the last handler output (or the
/// short-circuiting failure output), and the sort key of the last
/// persisted record.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub state: Value,
    pub output: HandlerOutput,
    pub last_sort_key: Option<SortKey>,
}

/// Fold accumulator threaded through the steps.
struct Acc {
    state: Value,
    output: HandlerOutput,
    last_sort_key: Option<SortKey>,
}

pub struct Evaluator {
    host: Arc<dyn ModuleHost>,
    cache: Arc<dyn EvaluationCache>,
    retry: RetryConfig,
}

impl Evaluator {
    pub fn new(
        host: Arc<dyn ModuleHost>,
        cache: Arc<dyn EvaluationCache>,
        retry: RetryConfig,
    ) -> Self {
        Self { host, cache, retry }
    }

    /// Runs the fold to completion. Sequential by construction:
    /// interaction N+1 is never started before interaction N's record
    /// committed.
    #[instrument(skip(self, plan), fields(process_id = %plan.process_id))]
    pub async fn evaluate(&self, mut plan: EvaluationPlan) -> EvaluationResult<Evaluation> {
        let mut handler = self.host.instantiate(&plan.src).await?;

        let mut acc = Acc {
            output: HandlerOutput {
                state: Some(plan.start_state.clone()),
                ..Default::default()
            },
            state: plan.start_state,
            last_sort_key: plan.start_sort_key,
        };

        while let Some(next) = plan.interactions.next().await {
            let interaction = next?;
            let step = self
                .step(handler.as_mut(), &plan.process_id, acc, interaction)
                .await
                .tap_err(|e| {
                    warn!(
                        target: "orrery::evaluator",
                        process_id = %plan.process_id,
                        error = %e,
                        "evaluation aborted"
                    )
                });
            match step.into_result()? {
                Control::Continue(next_acc) => acc = next_acc,
                Control::Halt(halted) => {
                    debug!(
                        target: "orrery::evaluator",
                        process_id = %plan.process_id,
                        sort_key = ?halted.last_sort_key,
                        "fold short-circuited on step error"
                    );
                    acc = halted;
                    break;
                }
            }
        }

        Ok(Evaluation {
            state: acc.state,
            output: acc.output,
            last_sort_key: acc.last_sort_key,
        })
    }

    /// One step: invoke, classify, build the record, persist, decide
    /// whether the fold continues.
    async fn step(
        &self,
        handler: &mut dyn ProcessHandler,
        process_id: &ProcessId,
        acc: Acc,
        interaction: Interaction,
    ) -> Flow<Control<Acc, Acc>, EvaluationError> {
        let raw = handler
            .handle(&acc.state, &interaction.action, &interaction.env)
            .await;
        let failed = raw.failed();

        // Failed steps record exactly the failure; successful steps get
        // state filled from carry-forward when the handler omitted it.
        let effective = if failed {
            HandlerOutput {
                result: raw.result,
                ..Default::default()
            }
        } else {
            let mut filled = raw;
            if filled.state.is_none() {
                filled.state = Some(acc.state.clone());
            }
            filled
        };

        let record = EvaluationRecord {
            process_id: process_id.clone(),
            sort_key: interaction.sort_key.clone(),
            action: interaction.action,
            output: effective.clone(),
            cached_at: Utc::now(),
        };

        if let Err(e) = validate_record(&record) {
            return Flow::err(e);
        }
        if let Err(e) = self.persist(&record).await {
            return Flow::err(EvaluationError::Cache(e));
        }

        if failed {
            // State never moves on a failed step.
            Flow::ok(Control::Halt(Acc {
                state: acc.state,
                output: effective,
                last_sort_key: Some(interaction.sort_key),
            }))
        } else {
            let state = effective.state.clone().unwrap_or(acc.state);
            Flow::ok(Control::Continue(Acc {
                state,
                output: effective,
                last_sort_key: Some(interaction.sort_key),
            }))
        }
    }

    /// Persists a record, retrying transient failures with bounded
    /// backoff. Integrity and serialization failures are immediate.
    async fn persist(&self, record: &EvaluationRecord) -> Result<(), CacheError> {
        let mut attempt = 0;
        loop {
            match self.cache.save(record).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        target: "orrery::evaluator",
                        process_id = %record.process_id,
                        sort_key = %record.sort_key,
                        error = %e,
                        attempt,
                        "record persistence failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Boundary validation of the record before it is persisted: the
/// serialized form must carry an `output` field (extra fields are
/// permitted). Nothing inside the fold re-validates.
fn validate_record(record: &EvaluationRecord) -> EvaluationResult<()> {
    let bytes = record
        .canonical_bytes()
        .map_err(|e| EvaluationError::Cache(CacheError::Serialization(e.to_string())))?;
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| EvaluationError::Cache(CacheError::Serialization(e.to_string())))?;
    if value.get("output").is_none() {
        return Err(EvaluationError::Cache(CacheError::Serialization(
            "record is missing its output field".to_string(),
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryEvaluationCache;
    use crate::host::HostResult;
    use async_trait::async_trait;
    use futures::stream;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Host whose handler interprets `action.type`: "inc" increments
    /// `state.n`, "boom" returns an error, "noop" omits state.
    struct ScriptedHost;

    struct ScriptedHandler;

    #[async_trait]
    impl ModuleHost for ScriptedHost {
        async fn instantiate(&self, _src: &[u8]) -> HostResult<Box<dyn ProcessHandler>> {
            Ok(Box::new(ScriptedHandler))
        }
    }

    #[async_trait]
    impl ProcessHandler for ScriptedHandler {
        async fn handle(&mut self, state: &Value, action: &Value, _env: &Value) -> HandlerOutput {
            match action.get("type").and_then(Value::as_str) {
                Some("inc") => {
                    let n = state.get("n").and_then(Value::as_i64).unwrap_or(0);
                    HandlerOutput {
                        state: Some(json!({ "n": n + 1 })),
                        ..Default::default()
                    }
                }
                Some("noop") => HandlerOutput::default(),
                Some("boom") => HandlerOutput::step_error("boom"),
                other => HandlerOutput::step_error(format!("unknown action: {:?}", other)),
            }
        }
    }

    fn interaction(key: &str, action_type: &str) -> Interaction {
        Interaction {
            sort_key: SortKey::from(key),
            action: json!({ "type": action_type }),
            env: Value::Null,
        }
    }

    fn plan(interactions: Vec<Interaction>) -> EvaluationPlan {
        EvaluationPlan {
            process_id: ProcessId::from("process-123"),
            src: Vec::new(),
            start_state: json!({ "n": 0 }),
            start_sort_key: None,
            interactions: Box::pin(stream::iter(interactions.into_iter().map(Ok))),
        }
    }

    fn evaluator(cache: Arc<MemoryEvaluationCache>) -> Evaluator {
        Evaluator::new(
            Arc::new(ScriptedHost),
            cache,
            RetryConfig {
                max_attempts: 2,
                initial_delay: std::time::Duration::from_millis(1),
                max_delay: std::time::Duration::from_millis(2),
            },
        )
    }

    #[tokio::test]
    async fn test_empty_stream_returns_the_start_state() {
        let cache = Arc::new(MemoryEvaluationCache::new());
        let evaluation = evaluator(cache.clone()).evaluate(plan(vec![])).await.unwrap();

        assert_eq!(evaluation.state, json!({ "n": 0 }));
        assert_eq!(evaluation.output.state, Some(json!({ "n": 0 })));
        assert!(!evaluation.output.failed());
        assert_eq!(evaluation.last_sort_key, None);

        let cached = cache
            .range(&ProcessId::from("process-123"), None, None)
            .await
            .unwrap();
        assert!(cached.is_empty());
    }

    #[tokio::test]
    async fn test_successful_steps_advance_state_and_persist() {
        let cache = Arc::new(MemoryEvaluationCache::new());
        let evaluation = evaluator(cache.clone())
            .evaluate(plan(vec![
                interaction("0001", "inc"),
                interaction("0002", "inc"),
            ]))
            .await
            .unwrap();

        assert_eq!(evaluation.state, json!({ "n": 2 }));
        assert_eq!(evaluation.last_sort_key, Some(SortKey::from("0002")));

        let cached = cache
            .range(&ProcessId::from("process-123"), None, None)
            .await
            .unwrap();
        assert_eq!(cached.len(), 2);
        assert_eq!(cached[0].output.state, Some(json!({ "n": 1 })));
    }

    #[tokio::test]
    async fn test_omitted_state_carries_forward() {
        let cache = Arc::new(MemoryEvaluationCache::new());
        let evaluation = evaluator(cache.clone())
            .evaluate(plan(vec![
                interaction("0001", "inc"),
                interaction("0002", "noop"),
            ]))
            .await
            .unwrap();

        assert_eq!(evaluation.state, json!({ "n": 1 }));

        // The persisted record has the carried state filled in.
        let cached = cache
            .range(&ProcessId::from("process-123"), None, None)
            .await
            .unwrap();
        assert_eq!(cached[1].output.state, Some(json!({ "n": 1 })));
    }

    #[tokio::test]
    async fn test_step_error_short_circuits_without_touching_state() {
        let cache = Arc::new(MemoryEvaluationCache::new());
        let evaluation = evaluator(cache.clone())
            .evaluate(plan(vec![
                interaction("0001", "inc"),
                interaction("0002", "boom"),
                interaction("0003", "inc"),
            ]))
            .await
            .unwrap();

        // The error is a value, the state is the last successful one.
        assert!(evaluation.output.failed());
        assert_eq!(evaluation.output.result.error, Some(json!("boom")));
        assert_eq!(evaluation.state, json!({ "n": 1 }));
        assert_eq!(evaluation.last_sort_key, Some(SortKey::from("0002")));

        // Exactly one record for the failure, none past it.
        let cached = cache
            .range(&ProcessId::from("process-123"), None, None)
            .await
            .unwrap();
        assert_eq!(cached.len(), 2);
        assert!(cached[1].output.failed());
        assert_eq!(cached[1].output.state, None);
    }

    #[tokio::test]
    async fn test_two_folds_persist_identical_records() {
        let interactions =
            || vec![interaction("0001", "inc"), interaction("0002", "inc")];

        let first_cache = Arc::new(MemoryEvaluationCache::new());
        evaluator(first_cache.clone())
            .evaluate(plan(interactions()))
            .await
            .unwrap();
        let second_cache = Arc::new(MemoryEvaluationCache::new());
        evaluator(second_cache.clone())
            .evaluate(plan(interactions()))
            .await
            .unwrap();

        let pid = ProcessId::from("process-123");
        let first = first_cache.range(&pid, None, None).await.unwrap();
        let second = second_cache.range(&pid, None, None).await.unwrap();
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert!(a.same_evaluation(b));
        }
    }

    /// Cache wrapper that fails a configurable number of saves.
    struct FlakyCache {
        inner: MemoryEvaluationCache,
        failures: AtomicU32,
    }

    #[async_trait]
    impl EvaluationCache for FlakyCache {
        async fn latest_at_or_before(
            &self,
            process_id: &ProcessId,
            sort_key: Option<&SortKey>,
        ) -> Result<Option<EvaluationRecord>, CacheError> {
            self.inner.latest_at_or_before(process_id, sort_key).await
        }

        async fn save(&self, record: &EvaluationRecord) -> Result<(), CacheError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CacheError::Transient("disk full".to_string()));
            }
            self.inner.save(record).await
        }

        async fn range(
            &self,
            process_id: &ProcessId,
            from_exclusive: Option<&SortKey>,
            to_inclusive: Option<&SortKey>,
        ) -> Result<Vec<EvaluationRecord>, CacheError> {
            self.inner.range(process_id, from_exclusive, to_inclusive).await
        }

        async fn evict_below(
            &self,
            process_id: &ProcessId,
            watermark: &SortKey,
        ) -> Result<usize, CacheError> {
            self.inner.evict_below(process_id, watermark).await
        }
    }

    #[tokio::test]
    async fn test_transient_persist_failures_are_retried() {
        let cache = Arc::new(FlakyCache {
            inner: MemoryEvaluationCache::new(),
            failures: AtomicU32::new(1),
        });
        let evaluator = Evaluator::new(
            Arc::new(ScriptedHost),
            cache.clone(),
            RetryConfig {
                max_attempts: 3,
                initial_delay: std::time::Duration::from_millis(1),
                max_delay: std::time::Duration::from_millis(2),
            },
        );

        let evaluation = evaluator
            .evaluate(plan(vec![interaction("0001", "inc")]))
            .await
            .unwrap();
        assert_eq!(evaluation.state, json!({ "n": 1 }));
    }

    #[tokio::test]
    async fn test_persist_budget_exhaustion_aborts_the_evaluation() {
        let cache = Arc::new(FlakyCache {
            inner: MemoryEvaluationCache::new(),
            failures: AtomicU32::new(10),
        });
        let evaluator = Evaluator::new(
            Arc::new(ScriptedHost),
            cache.clone(),
            RetryConfig {
                max_attempts: 2,
                initial_delay: std::time::Duration::from_millis(1),
                max_delay: std::time::Duration::from_millis(2),
            },
        );

        let err = evaluator
            .evaluate(plan(vec![interaction("0001", "inc")]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EvaluationError::Cache(CacheError::Transient(_))
        ));
    }
}
