//! # Interaction Source
//!
//! Yields the finite, totally ordered sequence of interactions for a
//! process in `(from_exclusive, to_inclusive]`, paging from the
//! scheduler. `None` bounds are the genesis / latest sentinels.
//!
//! The source enforces the canonical-order guarantee at the seam: sort
//! keys must be strictly increasing across the whole stream, so a
//! duplicate or regression from the upstream surfaces as
//! [`SourceError::OutOfOrder`] instead of silently corrupting a fold.
//! Transient upstream failures are retried with bounded backoff before
//! they are surfaced; the evaluator then pauses without committing a
//! partial step.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, Stream};
use thiserror::Error;
use tracing::warn;

use crate::config::{RetryConfig, SourceConfig};
use crate::deps::SchedulerClient;
use crate::model::{Interaction, ProcessId, SortKey};

pub type SourceResult<T> = Result<T, SourceError>;

/// Ordered stream of interactions; ends after the last item at or
/// before the upper bound.
pub type InteractionStream = Pin<Box<dyn Stream<Item = SourceResult<Interaction>> + Send>>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    /// The upstream is unavailable; the fetch may be retried.
    #[error("upstream unavailable: {0}")]
    Upstream(String),

    /// The upstream violated the canonical total order (duplicate or
    /// regressing sort key). Non-retryable.
    #[error("interaction order violated: {0}")]
    OutOfOrder(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Upstream(_))
    }
}

#[async_trait]
pub trait InteractionSource: Send + Sync {
    async fn load(
        &self,
        process_id: &ProcessId,
        from_exclusive: Option<&SortKey>,
        to_inclusive: Option<&SortKey>,
    ) -> SourceResult<InteractionStream>;
}

/// Source that pages interactions from the scheduler.
pub struct SchedulerSource {
    scheduler: Arc<dyn SchedulerClient>,
    config: SourceConfig,
    retry: RetryConfig,
}

struct PageCursor {
    scheduler: Arc<dyn SchedulerClient>,
    process_id: ProcessId,
    to_inclusive: Option<SortKey>,
    retry: RetryConfig,
    page_size: usize,
    /// Last sort key handed out; the next page is fetched strictly after
    /// it and every yielded key must exceed it.
    last_key: Option<SortKey>,
    buffer: VecDeque<Interaction>,
    exhausted: bool,
}

impl SchedulerSource {
    pub fn new(
        scheduler: Arc<dyn SchedulerClient>,
        config: SourceConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            scheduler,
            config,
            retry,
        }
    }

    async fn fetch_page(cursor: &PageCursor) -> SourceResult<Vec<Interaction>> {
        let mut attempt = 0;
        loop {
            let result = cursor
                .scheduler
                .list_interactions(
                    &cursor.process_id,
                    cursor.last_key.as_ref(),
                    cursor.to_inclusive.as_ref(),
                    cursor.page_size,
                )
                .await;
            match result {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() && attempt + 1 < cursor.retry.max_attempts => {
                    let delay = cursor.retry.delay_for(attempt);
                    warn!(
                        target: "orrery::source",
                        process_id = %cursor.process_id,
                        error = %e,
                        attempt,
                        "interaction page fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn next_interaction(
        mut cursor: PageCursor,
    ) -> SourceResult<Option<(Interaction, PageCursor)>> {
        if cursor.buffer.is_empty() && !cursor.exhausted {
            let page = Self::fetch_page(&cursor).await?;
            if page.len() < cursor.page_size {
                cursor.exhausted = true;
            }
            cursor.buffer = page.into();
        }

        let Some(interaction) = cursor.buffer.pop_front() else {
            return Ok(None);
        };

        if let Some(last) = &cursor.last_key {
            if interaction.sort_key <= *last {
                return Err(SourceError::OutOfOrder(format!(
                    "sort key {} does not advance past {}",
                    interaction.sort_key, last
                )));
            }
        }
        if let Some(to) = &cursor.to_inclusive {
            // The upstream should respect the bound; stop early if not.
            if interaction.sort_key > *to {
                return Ok(None);
            }
        }

        cursor.last_key = Some(interaction.sort_key.clone());
        Ok(Some((interaction, cursor)))
    }
}

#[async_trait]
impl InteractionSource for SchedulerSource {
    async fn load(
        &self,
        process_id: &ProcessId,
        from_exclusive: Option<&SortKey>,
        to_inclusive: Option<&SortKey>,
    ) -> SourceResult<InteractionStream> {
        let cursor = PageCursor {
            scheduler: self.scheduler.clone(),
            process_id: process_id.clone(),
            to_inclusive: to_inclusive.cloned(),
            retry: self.retry.clone(),
            page_size: self.config.page_size.max(1),
            last_key: from_exclusive.cloned(),
            buffer: VecDeque::new(),
            exhausted: false,
        };
        Ok(Box::pin(stream::try_unfold(cursor, Self::next_interaction)))
    }
}
