//! Wasmtime-backed module host.
//!
//! Each instantiation runs in its own `Store` with an isolated linear
//! memory, a fuel budget per call, an epoch-based wall-clock deadline,
//! and a memory cap. Compiled modules are memoized by the SHA-256 of
//! their source bytes, so repeated evaluations of the same process skip
//! recompilation.
//!
//! ## Handler ABI
//!
//! The module exports `memory`, `alloc(size: i32) -> i32` and
//! `handle(state_ptr, state_len, action_ptr, action_len, env_ptr,
//! env_len) -> u64`. All three payloads are UTF-8 JSON written into
//! memory returned by `alloc`; the return value packs the output
//! pointer and length as `(ptr << 32) | len`, pointing at a JSON
//! `HandlerOutput`. The linker defines no host functions, so any import
//! the module requires is a link-time configuration error.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;
use wasmtime::{
    Config, Engine, Linker, Memory, Module, Store, StoreLimits, StoreLimitsBuilder, Trap,
    TypedFunc,
};

use super::{HostError, HostResult, ModuleHost, ProcessHandler};
use crate::config::HostConfig;
use crate::model::HandlerOutput;

pub struct WasmModuleHost {
    engine: Engine,
    config: HostConfig,
    modules: DashMap<[u8; 32], Module>,
}

impl WasmModuleHost {
    pub fn new(config: HostConfig) -> HostResult<Self> {
        let mut engine_config = Config::new();
        engine_config.consume_fuel(true);
        engine_config.epoch_interruption(true);
        let engine = Engine::new(&engine_config).map_err(|e| {
            HostError::Configuration(format!("failed to build wasm engine: {}", e))
        })?;

        // Deadline clock: one epoch per tick until the engine is dropped.
        let weak = engine.weak();
        let tick = config.epoch_tick;
        std::thread::spawn(move || {
            while let Some(engine) = weak.upgrade() {
                engine.increment_epoch();
                drop(engine);
                std::thread::sleep(tick);
            }
        });

        Ok(Self {
            engine,
            config,
            modules: DashMap::new(),
        })
    }

    fn compile(&self, src: &[u8]) -> HostResult<Module> {
        let key: [u8; 32] = Sha256::digest(src).into();
        if let Some(module) = self.modules.get(&key) {
            return Ok(module.clone());
        }
        let module = Module::new(&self.engine, src)
            .map_err(|e| HostError::Configuration(format!("invalid module binary: {}", e)))?;
        self.modules.insert(key, module.clone());
        Ok(module)
    }

    /// Per-call deadline expressed in whole epoch ticks, rounded up.
    fn deadline_ticks(&self) -> u64 {
        let tick = self.config.epoch_tick.as_millis().max(1);
        let deadline = self.config.call_deadline.as_millis();
        (deadline.div_ceil(tick)).max(1) as u64
    }
}

#[async_trait]
impl ModuleHost for WasmModuleHost {
    async fn instantiate(&self, src: &[u8]) -> HostResult<Box<dyn ProcessHandler>> {
        let module = self.compile(src)?;

        let limits = StoreLimitsBuilder::new()
            .memory_size(self.config.max_memory_bytes)
            .instances(2)
            .build();
        let mut store = Store::new(&self.engine, HostState { limits });
        store.limiter(|state| &mut state.limits);
        store.set_fuel(self.config.gas_limit).map_err(|e| {
            HostError::Configuration(format!("failed to set gas budget: {}", e))
        })?;
        store.set_epoch_deadline(self.deadline_ticks());

        // No host functions are defined: any import the module requires
        // fails to link here.
        let linker: Linker<HostState> = Linker::new(&self.engine);
        let instance = linker.instantiate(&mut store, &module).map_err(|e| {
            HostError::Configuration(format!("failed to instantiate module: {}", e))
        })?;

        let memory = instance.get_memory(&mut store, "memory").ok_or_else(|| {
            HostError::Configuration("module does not export memory".to_string())
        })?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, "alloc")
            .map_err(|e| HostError::Configuration(format!("module does not export alloc: {}", e)))?;
        let handle = instance
            .get_typed_func::<(i32, i32, i32, i32, i32, i32), u64>(&mut store, "handle")
            .map_err(|e| {
                HostError::Configuration(format!("module does not export handle: {}", e))
            })?;

        Ok(Box::new(WasmHandler {
            store,
            memory,
            alloc,
            handle,
            gas_limit: self.config.gas_limit,
            deadline_ticks: self.deadline_ticks(),
        }))
    }
}

struct HostState {
    limits: StoreLimits,
}

struct WasmHandler {
    store: Store<HostState>,
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    handle: TypedFunc<(i32, i32, i32, i32, i32, i32), u64>,
    gas_limit: u64,
    deadline_ticks: u64,
}

impl WasmHandler {
    fn write_payload(&mut self, payload: &[u8]) -> Result<(i32, i32), String> {
        let len = i32::try_from(payload.len()).map_err(|_| "payload too large".to_string())?;
        let ptr = self
            .alloc
            .call(&mut self.store, len)
            .map_err(|e| trap_reason(&e))?;
        if ptr < 0 {
            return Err("allocator returned an invalid pointer".to_string());
        }
        self.memory
            .write(&mut self.store, ptr as usize, payload)
            .map_err(|e| format!("failed to write payload into module memory: {}", e))?;
        Ok((ptr, len))
    }

    fn invoke(&mut self, state: &Value, action: &Value, env: &Value) -> Result<HandlerOutput, String> {
        let state_bytes =
            serde_json::to_vec(state).map_err(|e| format!("state serialization: {}", e))?;
        let action_bytes =
            serde_json::to_vec(action).map_err(|e| format!("action serialization: {}", e))?;
        let env_bytes = serde_json::to_vec(env).map_err(|e| format!("env serialization: {}", e))?;

        // Fresh budgets per call; alloc calls draw from the same budget.
        self.store
            .set_fuel(self.gas_limit)
            .map_err(|e| format!("failed to set gas budget: {}", e))?;
        self.store.set_epoch_deadline(self.deadline_ticks);

        let (state_ptr, state_len) = self.write_payload(&state_bytes)?;
        let (action_ptr, action_len) = self.write_payload(&action_bytes)?;
        let (env_ptr, env_len) = self.write_payload(&env_bytes)?;

        let packed = self
            .handle
            .call(
                &mut self.store,
                (state_ptr, state_len, action_ptr, action_len, env_ptr, env_len),
            )
            .map_err(|e| trap_reason(&e))?;

        let ptr = (packed >> 32) as usize;
        let len = (packed & 0xffff_ffff) as usize;
        if len == 0 {
            return Err("handler returned an empty output".to_string());
        }

        let mut buf = vec![0u8; len];
        self.memory
            .read(&self.store, ptr, &mut buf)
            .map_err(|e| format!("failed to read handler output: {}", e))?;

        let mut output: HandlerOutput = serde_json::from_slice(&buf)
            .map_err(|e| format!("malformed handler output: {}", e))?;
        if output.result.gas_used.is_none() {
            if let Ok(remaining) = self.store.get_fuel() {
                output.result.gas_used = Some(self.gas_limit.saturating_sub(remaining));
            }
        }
        Ok(output)
    }
}

#[async_trait]
impl ProcessHandler for WasmHandler {
    async fn handle(&mut self, state: &Value, action: &Value, env: &Value) -> HandlerOutput {
        match self.invoke(state, action, env) {
            Ok(output) => output,
            Err(reason) => {
                debug!(target: "orrery::host", reason = %reason, "handler call trapped");
                HandlerOutput::step_error(reason)
            }
        }
    }
}

/// Maps a wasmtime error to a stable step-error reason. Gas and deadline
/// traps get fixed strings so records stay deterministic across runs.
fn trap_reason(error: &wasmtime::Error) -> String {
    match error.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => "gas limit exceeded".to_string(),
        Some(Trap::Interrupt) => "call deadline exceeded".to_string(),
        Some(trap) => trap.to_string(),
        None => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_trap_reasons_are_stable_for_budget_traps() {
        assert_eq!(
            trap_reason(&wasmtime::Error::from(Trap::OutOfFuel)),
            "gas limit exceeded"
        );
        assert_eq!(
            trap_reason(&wasmtime::Error::from(Trap::Interrupt)),
            "call deadline exceeded"
        );
    }

    #[test]
    fn test_deadline_rounds_up_to_whole_ticks() {
        let host = WasmModuleHost::new(HostConfig {
            call_deadline: Duration::from_millis(25),
            epoch_tick: Duration::from_millis(10),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(host.deadline_ticks(), 3);

        let host = WasmModuleHost::new(HostConfig {
            call_deadline: Duration::from_millis(0),
            epoch_tick: Duration::from_millis(10),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(host.deadline_ticks(), 1);
    }
}
