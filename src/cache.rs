//! # Evaluation Cache
//!
//! Persists one [`EvaluationRecord`] per `(process_id, sort_key)` and
//! answers "closest cached state at or before sort key S", which is what
//! lets a read resume from the nearest snapshot instead of replaying
//! from genesis.
//!
//! ## Write-once contract
//!
//! `save` is an upsert with a twist: saving a record identical to the
//! one already present (ignoring `cached_at`) is a no-op, while saving a
//! *conflicting* record at the same key is [`CacheError::Integrity`],
//! fatal and non-retryable, since two differing outcomes for the same
//! step imply the evaluation was not deterministic. This is also how
//! concurrent evaluations of the same process are kept from corrupting
//! the prefix: the second writer either observes identical bytes or is
//! rejected.
//!
//! The stored value is the record's canonical serialization, so the
//! in-memory backend and any durable backend behind the same trait share
//! one persisted layout.

use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use crate::model::{EvaluationRecord, ProcessId, SortKey};

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CacheError {
    /// The backend is temporarily unavailable; the write may be retried.
    #[error("transient cache failure: {0}")]
    Transient(String),

    /// A conflicting record already exists for this key. Implies
    /// non-determinism; the process's evaluation is refused until an
    /// operator clears the record.
    #[error("conflicting record for process {process_id} at {sort_key}")]
    Integrity {
        process_id: ProcessId,
        sort_key: SortKey,
    },

    #[error("record serialization failed: {0}")]
    Serialization(String),
}

impl CacheError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::Transient(_))
    }
}

#[async_trait]
pub trait EvaluationCache: Send + Sync {
    /// Latest record with sort key at or before `sort_key`; `None` bound
    /// means the latest record overall. O(log n) on the ordered index.
    async fn latest_at_or_before(
        &self,
        process_id: &ProcessId,
        sort_key: Option<&SortKey>,
    ) -> CacheResult<Option<EvaluationRecord>>;

    /// Write-once upsert keyed by `(process_id, sort_key)`; see the
    /// module docs for the identity/conflict semantics.
    async fn save(&self, record: &EvaluationRecord) -> CacheResult<()>;

    /// Records in `(from_exclusive, to_inclusive]`, ascending. `None`
    /// bounds mean genesis / latest. Used for audit.
    async fn range(
        &self,
        process_id: &ProcessId,
        from_exclusive: Option<&SortKey>,
        to_inclusive: Option<&SortKey>,
    ) -> CacheResult<Vec<EvaluationRecord>>;

    /// Tail eviction below a retention watermark. The latest record is
    /// always preserved so a process never loses its resume point.
    /// Returns the number of evicted records.
    async fn evict_below(&self, process_id: &ProcessId, watermark: &SortKey)
        -> CacheResult<usize>;
}

struct StoredRecord {
    /// Canonical bytes minus `cached_at`; what the write-once check
    /// compares.
    identity: Vec<u8>,
    /// Full canonical serialization; the persisted layout.
    bytes: Vec<u8>,
}

/// In-memory cache backend: one ordered index per process over the
/// canonical record bytes.
#[derive(Default)]
pub struct MemoryEvaluationCache {
    records: DashMap<ProcessId, BTreeMap<SortKey, StoredRecord>>,
}

impl MemoryEvaluationCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode(bytes: &[u8]) -> CacheResult<EvaluationRecord> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl EvaluationCache for MemoryEvaluationCache {
    async fn latest_at_or_before(
        &self,
        process_id: &ProcessId,
        sort_key: Option<&SortKey>,
    ) -> CacheResult<Option<EvaluationRecord>> {
        let Some(tree) = self.records.get(process_id) else {
            return Ok(None);
        };
        let upper = match sort_key {
            Some(key) => Bound::Included(key),
            None => Bound::Unbounded,
        };
        match tree.range((Bound::Unbounded, upper)).next_back() {
            Some((_, stored)) => Ok(Some(Self::decode(&stored.bytes)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, record: &EvaluationRecord) -> CacheResult<()> {
        let identity = record
            .identity_bytes()
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        let bytes = record
            .canonical_bytes()
            .map_err(|e| CacheError::Serialization(e.to_string()))?;

        let mut tree = self.records.entry(record.process_id.clone()).or_default();
        match tree.get(&record.sort_key) {
            Some(existing) if existing.identity == identity => {
                debug!(
                    target: "orrery::cache",
                    process_id = %record.process_id,
                    sort_key = %record.sort_key,
                    "identical record already cached, save is a no-op"
                );
                Ok(())
            }
            Some(_) => Err(CacheError::Integrity {
                process_id: record.process_id.clone(),
                sort_key: record.sort_key.clone(),
            }),
            None => {
                tree.insert(record.sort_key.clone(), StoredRecord { identity, bytes });
                Ok(())
            }
        }
    }

    async fn range(
        &self,
        process_id: &ProcessId,
        from_exclusive: Option<&SortKey>,
        to_inclusive: Option<&SortKey>,
    ) -> CacheResult<Vec<EvaluationRecord>> {
        let Some(tree) = self.records.get(process_id) else {
            return Ok(Vec::new());
        };
        let lower = match from_exclusive {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        let upper = match to_inclusive {
            Some(key) => Bound::Included(key),
            None => Bound::Unbounded,
        };
        tree.range((lower, upper))
            .map(|(_, stored)| Self::decode(&stored.bytes))
            .collect()
    }

    async fn evict_below(
        &self,
        process_id: &ProcessId,
        watermark: &SortKey,
    ) -> CacheResult<usize> {
        let Some(mut entry) = self.records.get_mut(process_id) else {
            return Ok(0);
        };
        let tree = entry.value_mut();
        let mut keep = tree.split_off(watermark);
        if keep.is_empty() {
            // Everything is below the watermark; the newest record stays.
            if let Some((key, stored)) = tree.pop_last() {
                keep.insert(key, stored);
            }
        }
        let evicted = tree.len();
        *tree = keep;
        debug!(
            target: "orrery::cache",
            process_id = %process_id,
            watermark = %watermark,
            evicted,
            "evicted records below retention watermark"
        );
        Ok(evicted)
    }
}
