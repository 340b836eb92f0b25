use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::error::AppError;
use crate::gpio::{EdgeEvent, EventHandler, GpioBackend, HIGH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinRole {
    Input,
    Output,
}

#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub pin: u32,
    pub value: u8,
    pub at: Instant,
}

/// In-memory backend that records every call, for tests and dry runs.
#[derive(Default)]
pub struct MockGpioBackend {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    claimed: FxHashMap<u32, PinRole>,
    stale: HashSet<u32>,
    handlers: FxHashMap<u32, EventHandler>,
    values: FxHashMap<u32, u8>,
    writes: Vec<WriteRecord>,
    released: Vec<u32>,
    failing_claims: HashSet<u32>,
    failing_writes: HashSet<u32>,
}

impl MockGpioBackend {
    /// Pretends a previous run left the pin exported.
    pub fn mark_stale(&self, pin: u32) {
        self.state.lock().stale.insert(pin);
    }

    pub fn fail_claim(&self, pin: u32) {
        self.state.lock().failing_claims.insert(pin);
    }

    pub fn fail_writes(&self, pin: u32) {
        self.state.lock().failing_writes.insert(pin);
    }

    /// Simulates a button press on a watched input.
    pub fn press(&self, pin: u32) -> bool {
        let handler = self.state.lock().handlers.get(&pin).cloned();
        match handler {
            Some(h) => {
                h.dispatch(EdgeEvent::now(pin));
                true
            }
            None => false,
        }
    }

    pub fn claimed(&self) -> FxHashMap<u32, PinRole> {
        self.state.lock().claimed.clone()
    }

    pub fn watched(&self) -> Vec<u32> {
        let mut pins: Vec<u32> = self.state.lock().handlers.keys().copied().collect();
        pins.sort_unstable();
        pins
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().writes.clone()
    }

    pub fn released(&self) -> Vec<u32> {
        self.state.lock().released.clone()
    }

    pub fn value(&self, pin: u32) -> Option<u8> {
        self.state.lock().values.get(&pin).copied()
    }

    fn claim(&self, pin: u32, role: PinRole) -> Result<(), AppError> {
        let mut state = self.state.lock();
        if state.failing_claims.contains(&pin) {
            return Err(AppError::Gpio(format!("pin {pin} is busy")));
        }
        if state.stale.contains(&pin) || state.claimed.contains_key(&pin) {
            return Err(AppError::Gpio(format!("pin {pin} already exported")));
        }
        state.claimed.insert(pin, role);
        if role == PinRole::Output {
            state.values.insert(pin, 0);
        }
        Ok(())
    }
}

#[async_trait]
impl GpioBackend for MockGpioBackend {
    async fn is_exported(&self, pin: u32) -> bool {
        let state = self.state.lock();
        state.stale.contains(&pin) || state.claimed.contains_key(&pin)
    }

    async fn claim_input(&self, pin: u32) -> Result<(), AppError> {
        self.claim(pin, PinRole::Input)
    }

    async fn claim_output(&self, pin: u32) -> Result<(), AppError> {
        self.claim(pin, PinRole::Output)
    }

    async fn watch(&self, pin: u32, handler: EventHandler) -> Result<(), AppError> {
        let mut state = self.state.lock();
        match state.claimed.get(&pin) {
            Some(PinRole::Input) => {
                state.handlers.insert(pin, handler);
                Ok(())
            }
            _ => Err(AppError::Gpio(format!("pin {pin} is not an input"))),
        }
    }

    async fn unwatch(&self, pin: u32) {
        self.state.lock().handlers.remove(&pin);
    }

    async fn write_value(&self, pin: u32, value: u8) -> Result<(), AppError> {
        let mut state = self.state.lock();
        if state.failing_writes.contains(&pin) {
            return Err(AppError::Gpio(format!("write to pin {pin} failed")));
        }
        if value > HIGH {
            return Err(AppError::Gpio(format!("invalid value {value} for pin {pin}")));
        }
        if state.claimed.get(&pin) != Some(&PinRole::Output) {
            return Err(AppError::Gpio(format!("pin {pin} is not an output")));
        }
        state.values.insert(pin, value);
        state.writes.push(WriteRecord {
            pin,
            value,
            at: Instant::now(),
        });
        Ok(())
    }

    async fn release(&self, pin: u32) -> Result<(), AppError> {
        let mut state = self.state.lock();
        state.handlers.remove(&pin);
        state.stale.remove(&pin);
        state.claimed.remove(&pin);
        state.values.remove(&pin);
        state.released.push(pin);
        Ok(())
    }
}
