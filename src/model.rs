//! Core data model: processes, sort keys, interactions, handler outputs,
//! and the evaluation records the cache persists.
//!
//! The engine treats state as an opaque `serde_json::Value`: it is read
//! between steps and replaced, never mutated in place. Records serialize
//! with a fixed field order so identical evaluations produce identical
//! bytes, which is what the cache's write-once check compares.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque identifier of a durable WASM-backed process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(String);

impl ProcessId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProcessId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Totally ordered, lexicographically comparable identifier assigned by
/// the scheduler. Ordering is strict: for two interactions on the same
/// process, `<`, `=` or `>` is always defined, and equality identifies
/// the same interaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SortKey(String);

impl SortKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SortKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SortKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// A single ordered input to a process.
///
/// `action` is the structured message the handler receives; `env` holds
/// ambient fields it may read (block height, timestamp, caller).
/// Immutable once emitted by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub sort_key: SortKey,
    pub action: Value,
    #[serde(default)]
    pub env: Value,
}

/// What a handler call produced.
///
/// `state` absent means the previous state carries forward unchanged.
/// The step is considered failed iff `result.error` is present and
/// truthy; see [`StepResult::failed`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HandlerOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spawns: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub result: StepResult,
}

impl HandlerOutput {
    /// Error-only output used to record a failed step. Every other field
    /// is dropped so the record carries exactly the failure.
    pub fn step_error(reason: impl Into<String>) -> Self {
        Self {
            result: StepResult {
                error: Some(Value::String(reason.into())),
                gas_used: None,
            },
            ..Default::default()
        }
    }

    pub fn failed(&self) -> bool {
        self.result.failed()
    }
}

/// Step-level result carried inside a handler output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StepResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<u64>,
}

impl StepResult {
    pub fn failed(&self) -> bool {
        self.error.as_ref().map(is_truthy).unwrap_or(false)
    }
}

/// JSON truthiness: null, false, 0, NaN and "" are falsy; arrays and
/// objects (even empty) are truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// One step's cached outcome, written exactly once per
/// `(process_id, sort_key)`.
///
/// `cached_at` is wall-clock metadata and never participates in
/// correctness: it is excluded from the identity the write-once check
/// compares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationRecord {
    pub process_id: ProcessId,
    pub sort_key: SortKey,
    pub action: Value,
    pub output: HandlerOutput,
    pub cached_at: DateTime<Utc>,
}

/// Shadow of [`EvaluationRecord`] without `cached_at`, used to compute
/// the deterministic identity bytes.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordIdentity<'a> {
    process_id: &'a ProcessId,
    sort_key: &'a SortKey,
    action: &'a Value,
    output: &'a HandlerOutput,
}

impl EvaluationRecord {
    /// Canonical serialization: fixed field order, decimal numbers,
    /// UTF-8, no trailing whitespace. Byte-identical for identical
    /// records.
    pub fn canonical_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Deterministic identity: canonical bytes of every field except
    /// `cached_at`.
    pub fn identity_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&RecordIdentity {
            process_id: &self.process_id,
            sort_key: &self.sort_key,
            action: &self.action,
            output: &self.output,
        })
    }

    /// True when both records describe the same evaluation outcome,
    /// ignoring `cached_at`.
    pub fn same_evaluation(&self, other: &Self) -> bool {
        match (self.identity_bytes(), other.identity_bytes()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

/// Result of folding a process up to a sort key, as returned by
/// [`crate::engine::Engine::read_state`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadState {
    pub state: Value,
    pub output: HandlerOutput,
    /// Sort key of the last persisted record, or the resume key when the
    /// stream was empty. `None` means the fold started and ended at
    /// genesis.
    pub last_sort_key: Option<SortKey>,
}

/// Receipt for an interaction forwarded to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteReceipt {
    pub sort_key: SortKey,
}

/// A registered process: immutable module binary plus the genesis state
/// fixed at registration.
#[derive(Debug, Clone)]
pub struct ProcessDefinition {
    pub process_id: ProcessId,
    pub src: Vec<u8>,
    pub genesis_state: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness_follows_json_semantics() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("boom")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
    }

    #[test]
    fn test_step_fails_only_on_truthy_error() {
        let ok = HandlerOutput::default();
        assert!(!ok.failed());

        let falsy = HandlerOutput {
            result: StepResult {
                error: Some(json!("")),
                gas_used: None,
            },
            ..Default::default()
        };
        assert!(!falsy.failed());

        let failed = HandlerOutput::step_error("boom");
        assert!(failed.failed());
        assert_eq!(failed.state, None);
    }

    #[test]
    fn test_identity_excludes_cached_at() {
        let record = EvaluationRecord {
            process_id: ProcessId::from("process-123"),
            sort_key: SortKey::from("0001"),
            action: json!({ "type": "inc" }),
            output: HandlerOutput {
                state: Some(json!({ "n": 1 })),
                ..Default::default()
            },
            cached_at: Utc::now(),
        };
        let later = EvaluationRecord {
            cached_at: Utc::now() + chrono::Duration::seconds(10),
            ..record.clone()
        };

        assert!(record.same_evaluation(&later));
        assert_ne!(
            record.canonical_bytes().unwrap(),
            later.canonical_bytes().unwrap()
        );

        let diverged = EvaluationRecord {
            output: HandlerOutput {
                state: Some(json!({ "n": 2 })),
                ..Default::default()
            },
            ..record.clone()
        };
        assert!(!record.same_evaluation(&diverged));
    }

    #[test]
    fn test_record_round_trip_is_identical() {
        let record = EvaluationRecord {
            process_id: ProcessId::from("process-123"),
            sort_key: SortKey::from("0001"),
            action: json!({ "type": "inc" }),
            output: HandlerOutput {
                state: Some(json!({ "n": 1 })),
                messages: Some(json!([{ "target": "process-456" }])),
                ..Default::default()
            },
            cached_at: Utc::now(),
        };
        let bytes = record.canonical_bytes().unwrap();
        let reloaded: EvaluationRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(record, reloaded);
        assert_eq!(bytes, reloaded.canonical_bytes().unwrap());
    }

    #[test]
    fn test_sort_keys_order_lexicographically() {
        assert!(SortKey::from("0001") < SortKey::from("0002"));
        assert!(SortKey::from("0002") < SortKey::from("0010"));
        assert_eq!(SortKey::from("0001"), SortKey::from("0001"));
    }

    #[test]
    fn test_handler_output_omits_absent_fields() {
        let output = HandlerOutput {
            state: Some(json!({ "n": 1 })),
            ..Default::default()
        };
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value, json!({ "state": { "n": 1 }, "result": {} }));
    }
}
