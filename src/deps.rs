//! Collaborator seams consumed by the engine: the scheduler that orders
//! and pages interactions, and the store that holds process binaries.
//! Both are injected as trait objects so deployments (and tests) choose
//! the transport.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::cache::EvaluationCache;
use crate::config::EngineConfig;
use crate::model::{Interaction, ProcessDefinition, ProcessId, SortKey, WriteReceipt};
use crate::source::SourceError;

/// Scheduler-facing client: pages canonical-order interactions and
/// forwards new ones for sort key assignment.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// One page of interactions in `(from_exclusive, to_inclusive]`,
    /// strictly ascending by sort key, at most `limit` entries. An empty
    /// or short page means the range is exhausted.
    async fn list_interactions(
        &self,
        process_id: &ProcessId,
        from_exclusive: Option<&SortKey>,
        to_inclusive: Option<&SortKey>,
        limit: usize,
    ) -> Result<Vec<Interaction>, SourceError>;

    /// Forwards an action to the scheduler, which assigns its sort key.
    /// Opaque to the engine.
    async fn write_interaction(
        &self,
        process_id: &ProcessId,
        action: Value,
    ) -> Result<WriteReceipt, SourceError>;
}

#[derive(Debug, Clone, Error)]
pub enum ProcessStoreError {
    #[error("process not found: {0}")]
    NotFound(ProcessId),

    #[error("process store unavailable: {0}")]
    Unavailable(String),
}

impl ProcessStoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessStoreError::Unavailable(_))
    }
}

/// Store of registered processes: the immutable module binary and the
/// genesis state fixed at registration.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    async fn find_process(
        &self,
        process_id: &ProcessId,
    ) -> Result<ProcessDefinition, ProcessStoreError>;
}

/// Bundle of injected collaborators handed to [`crate::engine::Engine`].
#[derive(Clone)]
pub struct Deps {
    pub process_store: Arc<dyn ProcessStore>,
    pub scheduler: Arc<dyn SchedulerClient>,
    pub cache: Arc<dyn EvaluationCache>,
    pub config: EngineConfig,
}
