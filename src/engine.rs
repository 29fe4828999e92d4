//! # Engine
//!
//! The surface collaborators call: `read_state` resolves a process's
//! state after folding through a target sort key, `write_interaction`
//! forwards an action to the scheduler.
//!
//! ## Read path
//!
//! Cache → closest snapshot → interaction stream `(snapshot, target]` →
//! fold → reply. Each record persists before the fold advances, so the
//! cache-visible prefix grows monotonically and a cancelled read leaves
//! every persisted record valid.
//!
//! ## Single-flight
//!
//! Concurrent reads of the same `(process_id, target)` coalesce: the
//! first caller runs the fold and broadcasts the outcome, later callers
//! subscribe and await it. If the leader disappears without delivering
//! (cancellation), the awaiting caller falls back to its own fold; by
//! then the cache already holds whatever prefix the leader committed.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::deps::Deps;
use crate::evaluator::{Evaluation, EvaluationError, EvaluationPlan, EvaluationResult, Evaluator};
use crate::host::{HostError, ModuleHost, WasmModuleHost};
use crate::model::{ProcessDefinition, ProcessId, ReadState, SortKey, WriteReceipt};
use crate::source::{InteractionSource, SchedulerSource};

type FlightKey = (ProcessId, Option<SortKey>);
type Reply = EvaluationResult<ReadState>;

pub struct Engine {
    deps: Deps,
    source: Arc<dyn InteractionSource>,
    evaluator: Evaluator,
    in_flight: DashMap<FlightKey, broadcast::Sender<Reply>>,
}

impl Engine {
    /// Engine over the wasmtime-backed module host.
    pub fn new(deps: Deps) -> Result<Self, HostError> {
        let host = Arc::new(WasmModuleHost::new(deps.config.host.clone())?);
        Ok(Self::with_host(deps, host))
    }

    /// Engine over a caller-provided module host. Seam for deployments
    /// embedding a different runtime, and for tests.
    pub fn with_host(deps: Deps, host: Arc<dyn ModuleHost>) -> Self {
        let source = Arc::new(SchedulerSource::new(
            deps.scheduler.clone(),
            deps.config.source.clone(),
            deps.config.retry.clone(),
        ));
        let evaluator = Evaluator::new(host, deps.cache.clone(), deps.config.retry.clone());
        Self {
            deps,
            source,
            evaluator,
            in_flight: DashMap::new(),
        }
    }

    /// Resolves the process state after folding through `up_to`, or the
    /// latest known interaction when `up_to` is `None`.
    #[instrument(skip(self), fields(process_id = %process_id))]
    pub async fn read_state(
        &self,
        process_id: &ProcessId,
        up_to: Option<SortKey>,
    ) -> Reply {
        let key = (process_id.clone(), up_to.clone());

        let mut rx = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().subscribe(),
            Entry::Vacant(entry) => {
                let (tx, _) = broadcast::channel(self.deps.config.reply_buffer_size.max(1));
                entry.insert(tx);

                let reply = self.evaluate_read(process_id, up_to.as_ref()).await;
                if let Some((_, tx)) = self.in_flight.remove(&key) {
                    let _ = tx.send(reply.clone());
                }
                return reply;
            }
        };

        debug!(
            target: "orrery::engine",
            process_id = %process_id,
            "awaiting in-flight evaluation"
        );
        match rx.recv().await {
            Ok(reply) => reply,
            // Leader never delivered; run the fold ourselves.
            Err(_) => self.evaluate_read(process_id, up_to.as_ref()).await,
        }
    }

    /// Forwards an action to the scheduler, which assigns its sort key.
    #[instrument(skip(self, action), fields(process_id = %process_id))]
    pub async fn write_interaction(
        &self,
        process_id: &ProcessId,
        action: Value,
    ) -> EvaluationResult<WriteReceipt> {
        let receipt = self
            .deps
            .scheduler
            .write_interaction(process_id, action)
            .await?;
        Ok(receipt)
    }

    async fn evaluate_read(
        &self,
        process_id: &ProcessId,
        up_to: Option<&SortKey>,
    ) -> Reply {
        let evaluation_id = Uuid::new_v4();
        debug!(
            target: "orrery::engine",
            process_id = %process_id,
            %evaluation_id,
            up_to = ?up_to,
            "starting evaluation"
        );

        let snapshot = self
            .deps
            .cache
            .latest_at_or_before(process_id, up_to)
            .await?;

        // Both cached short-circuits resolve without loading the module
        // binary; the process store is only consulted when genesis state
        // is genuinely needed.
        if let Some(record) = &snapshot {
            // A cached failure is a stable short-circuit boundary: the
            // offending interaction is never re-executed and nothing
            // past it is consumed.
            if record.output.failed() {
                let state = match self.latest_state_before(process_id, &record.sort_key).await? {
                    Some(state) => state,
                    // The failure is the process's first record.
                    None => self.find_process(process_id).await?.genesis_state,
                };
                return Ok(ReadState {
                    state,
                    output: record.output.clone(),
                    last_sort_key: Some(record.sort_key.clone()),
                });
            }

            // Already folded through the target: nothing to fetch.
            if up_to == Some(&record.sort_key) {
                debug!(
                    target: "orrery::engine",
                    process_id = %process_id,
                    "target already cached, replaying nothing"
                );
                let state = match record.output.state.clone() {
                    Some(state) => state,
                    None => self.find_process(process_id).await?.genesis_state,
                };
                return Ok(ReadState {
                    state,
                    output: record.output.clone(),
                    last_sort_key: Some(record.sort_key.clone()),
                });
            }
        }

        let process = self.find_process(process_id).await?;
        let (start_state, start_sort_key) = match snapshot {
            Some(record) => {
                let state = record
                    .output
                    .state
                    .clone()
                    .unwrap_or_else(|| process.genesis_state.clone());
                (state, Some(record.sort_key))
            }
            None => (process.genesis_state.clone(), None),
        };

        let interactions = self
            .source
            .load(process_id, start_sort_key.as_ref(), up_to)
            .await?;

        let Evaluation {
            state,
            output,
            last_sort_key,
        } = self
            .evaluator
            .evaluate(EvaluationPlan {
                process_id: process_id.clone(),
                src: process.src,
                start_state,
                start_sort_key,
                interactions,
            })
            .await?;

        Ok(ReadState {
            state,
            output,
            last_sort_key,
        })
    }

    /// Loads the process definition, retrying transient store failures
    /// with bounded backoff before promoting them.
    async fn find_process(
        &self,
        process_id: &ProcessId,
    ) -> EvaluationResult<ProcessDefinition> {
        let mut attempt = 0;
        loop {
            match self.deps.process_store.find_process(process_id).await {
                Ok(process) => return Ok(process),
                Err(e)
                    if e.is_retryable()
                        && attempt + 1 < self.deps.config.retry.max_attempts =>
                {
                    let delay = self.deps.config.retry.delay_for(attempt);
                    warn!(
                        target: "orrery::engine",
                        process_id = %process_id,
                        error = %e,
                        attempt,
                        "process lookup failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(EvaluationError::Process(e)),
            }
        }
    }

    /// State of the latest successful record strictly before `sort_key`.
    async fn latest_state_before(
        &self,
        process_id: &ProcessId,
        sort_key: &SortKey,
    ) -> EvaluationResult<Option<Value>> {
        let records = self.deps.cache.range(process_id, None, Some(sort_key)).await?;
        Ok(records
            .iter()
            .rev()
            .filter(|r| r.sort_key < *sort_key)
            .find_map(|r| r.output.state.clone()))
    }
}
