//! Operation limiter and typed interrupts for sandboxed evaluation.
//!
//! The interpreter aborts through `ErrorTerminated`; the reason for the abort
//! is recorded in the limiter's interrupt slot and read back at the executor
//! boundary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rhai::{Dynamic, EvalAltResult, Position};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::isolation::CancelToken;

/// What the operation ceiling counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitMode {
    /// Every interpreter operation (expression, statement, loop iteration).
    #[default]
    Operations,
    /// Tool and builtin invocations only.
    Calls,
}

/// Why evaluation was aborted.
#[derive(Debug, Clone, PartialEq)]
pub enum Interrupt {
    FinalAnswer(Value),
    OperationLimit(u64),
    Cancelled,
}

#[derive(Debug)]
struct LimiterState {
    mode: LimitMode,
    max_operations: u64,
    calls: AtomicU64,
    operations: AtomicU64,
    cancel: CancelToken,
    interrupt: Mutex<Option<Interrupt>>,
}

/// Shared counter state for one execution.
#[derive(Debug, Clone)]
pub struct Limiter {
    state: Arc<LimiterState>,
}

impl Limiter {
    pub fn new(mode: LimitMode, max_operations: u64, cancel: CancelToken) -> Self {
        Self {
            state: Arc::new(LimiterState {
                mode,
                max_operations,
                calls: AtomicU64::new(0),
                operations: AtomicU64::new(0),
                cancel,
                interrupt: Mutex::new(None),
            }),
        }
    }

    pub fn mode(&self) -> LimitMode {
        self.state.mode
    }

    pub fn max_operations(&self) -> u64 {
        self.state.max_operations
    }

    pub fn operations(&self) -> u64 {
        self.state.operations.load(Ordering::Relaxed)
    }

    pub fn calls(&self) -> u64 {
        self.state.calls.load(Ordering::Relaxed)
    }

    /// Progress hook body. Returning `Some` terminates evaluation.
    pub fn on_operation(&self, count: u64) -> Option<Dynamic> {
        self.state.operations.store(count, Ordering::Relaxed);
        if self.state.cancel.is_cancelled() {
            self.raise(Interrupt::Cancelled);
            return Some(Dynamic::UNIT);
        }
        if self.state.mode == LimitMode::Operations
            && self.state.max_operations > 0
            && count > self.state.max_operations
        {
            self.raise(Interrupt::OperationLimit(self.state.max_operations));
            return Some(Dynamic::UNIT);
        }
        None
    }

    /// Count one tool or builtin invocation.
    pub fn on_call(&self) -> Result<(), Box<EvalAltResult>> {
        let count = self.state.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if self.state.mode == LimitMode::Calls
            && self.state.max_operations > 0
            && count > self.state.max_operations
        {
            return Err(self.abort(Interrupt::OperationLimit(self.state.max_operations)));
        }
        Ok(())
    }

    /// Record `interrupt` and build the terminating error.
    pub fn abort(&self, interrupt: Interrupt) -> Box<EvalAltResult> {
        self.raise(interrupt);
        Box::new(EvalAltResult::ErrorTerminated(Dynamic::UNIT, Position::NONE))
    }

    /// The recorded interrupt, if evaluation was aborted.
    pub fn take_interrupt(&self) -> Option<Interrupt> {
        self.state
            .interrupt
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
    }

    fn raise(&self, interrupt: Interrupt) {
        if let Ok(mut slot) = self.state.interrupt.lock() {
            // First interrupt wins; a final answer is not overwritten by a later limit.
            if slot.is_none() {
                *slot = Some(interrupt);
            }
        }
    }
}
