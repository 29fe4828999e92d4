//! # ORRERY: Deterministic State-Evaluation Engine
//!
//! Orrery reconstructs the current state of a WASM-backed process by
//! replaying an ordered log of interactions through the process's
//! handler, persisting each step so later reads resume from the closest
//! cached point instead of re-replaying from genesis.
//!
//! ## Architecture
//!
//! The engine composes five components around one data flow:
//!
//! ```text
//! Cache ─→ (snapshot) ─→ Source ─→ Host ─→ Evaluator ─→ Cache ─→ Reply
//! ```
//!
//! - **Module Host** ([`host`]): embeds a sandboxed WASM runtime behind
//!   a `handle(state, action, env)` call. Traps become error values,
//!   never engine failures.
//! - **Interaction Source** ([`source`]): pages the canonical-order
//!   interaction stream from the scheduler, enforcing strict ordering.
//! - **Evaluation Cache** ([`cache`]): write-once records keyed by
//!   `(process_id, sort_key)`, answering closest-snapshot queries.
//! - **Evaluator** ([`evaluator`]): the short-circuiting ordered fold
//!   with per-step persistence and error containment.
//! - **Pipeline Kernel** ([`flow`]): the two-arm result carrier and the
//!   `Continue | Halt` control value the fold is expressed with.
//!
//! [`engine::Engine`] ties them together and adds single-flight
//! coalescing of concurrent reads.
//!
//! ## Determinism
//!
//! For a fixed `(module, genesis, interactions)` the sequence of
//! persisted records is byte-identical across runs, except for the
//! `cached_at` wall-clock metadata, which is excluded from the cache's
//! write-once identity check and never influences execution.
//!
//! ## Example
//!
//! ```ignore
//! let deps = Deps {
//!     process_store: Arc::new(MyProcessStore::connect(config.gateway_url)?),
//!     scheduler: Arc::new(MyScheduler::connect(config.scheduler_url)?),
//!     cache: Arc::new(MemoryEvaluationCache::new()),
//!     config: EngineConfig::default(),
//! };
//! let engine = Engine::new(deps)?;
//! let read = engine.read_state(&process_id, Some(SortKey::from("0010"))).await?;
//! println!("state after 0010: {}", read.state);
//! ```

pub mod cache;
pub mod config;
pub mod deps;
pub mod engine;
pub mod evaluator;
pub mod flow;
pub mod host;
pub mod model;
pub mod source;

// Re-exports
pub use cache::{CacheError, EvaluationCache, MemoryEvaluationCache};
pub use config::{EngineConfig, HostConfig, RetryConfig, SourceConfig};
pub use deps::{Deps, ProcessStore, ProcessStoreError, SchedulerClient};
pub use engine::Engine;
pub use evaluator::{Evaluation, EvaluationError, EvaluationPlan, EvaluationResult, Evaluator};
pub use flow::{Control, Flow};
pub use host::{HostError, ModuleHost, ProcessHandler, WasmModuleHost};
pub use model::{
    EvaluationRecord, HandlerOutput, Interaction, ProcessDefinition, ProcessId, ReadState,
    SortKey, StepResult, WriteReceipt,
};
pub use source::{InteractionSource, InteractionStream, SchedulerSource, SourceError};
