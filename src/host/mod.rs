//! # Module Host
//!
//! Wraps a WASM binary so it exposes a single handler call:
//! `handle(state, action, env) -> HandlerOutput`. The handler is pure
//! with respect to its arguments (no I/O, no ambient clock); all
//! external context arrives through `env`.
//!
//! Failure-as-value: any runtime trap (unreachable, memory fault, gas
//! exhaustion, deadline) is converted into
//! `HandlerOutput { result: { error } }` inside the host, so the
//! evaluator never observes a throw from a handler call. Only
//! instantiation problems such as an invalid binary, a missing export,
//! or an unlinkable import surface as [`HostError::Configuration`],
//! which is fatal for the evaluation.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::model::HandlerOutput;

mod wasm;

pub use wasm::WasmModuleHost;

pub type HostResult<T> = Result<T, HostError>;

#[derive(Debug, Clone, Error)]
pub enum HostError {
    /// The module cannot be run at all: invalid binary, missing
    /// `handle`/`alloc`/`memory` export, or an import the host does not
    /// provide.
    #[error("module configuration: {0}")]
    Configuration(String),
}

#[async_trait]
pub trait ModuleHost: Send + Sync {
    /// Instantiates `src` into a fresh, isolated handler. Instantiation
    /// is deterministic: identical `src` yields handlers that produce
    /// byte-identical outputs for identical inputs.
    async fn instantiate(&self, src: &[u8]) -> HostResult<Box<dyn ProcessHandler>>;
}

/// A live handler instance. Owned exclusively by one evaluation; never
/// shared across concurrent evaluations.
#[async_trait]
pub trait ProcessHandler: Send {
    async fn handle(&mut self, state: &Value, action: &Value, env: &Value) -> HandlerOutput;
}
