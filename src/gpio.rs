use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::AppError;

pub const LOW: u8 = 0;
pub const HIGH: u8 = 1;

/// A press as seen by the kernel: a rising transition on an active-low switch line.
#[derive(Debug, Clone, Serialize)]
pub struct EdgeEvent {
    pub pin: u32,
    pub timestamp_ms: u64,
}

impl EdgeEvent {
    pub fn now(pin: u32) -> Self {
        Self {
            pin,
            timestamp_ms: epoch_millis(),
        }
    }
}

pub struct EdgeCallbackHandler {
    event_tx: broadcast::Sender<EdgeEvent>,
}

impl EdgeCallbackHandler {
    pub fn new(event_tx: broadcast::Sender<EdgeEvent>) -> Self {
        Self { event_tx }
    }

    pub fn dispatch(&self, event: EdgeEvent) {
        // no subscriber just means nobody is monitoring yet
        let _ = self.event_tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EdgeEvent> {
        self.event_tx.subscribe()
    }
}

pub type EventHandler = Arc<EdgeCallbackHandler>;

/// Pin-level operations the controller needs from a GPIO driver.
///
/// Inputs are claimed active-low with rising-edge detection, so a button
/// pulling the line to ground is reported as a rising edge. Outputs are
/// driven low as part of the claim.
#[async_trait]
pub trait GpioBackend: Send + Sync {
    /// Whether the pin is held from outside this process, e.g. a stale sysfs export.
    async fn is_exported(&self, pin: u32) -> bool;
    async fn claim_input(&self, pin: u32) -> Result<(), AppError>;
    async fn claim_output(&self, pin: u32) -> Result<(), AppError>;
    async fn watch(&self, pin: u32, handler: EventHandler) -> Result<(), AppError>;
    async fn unwatch(&self, pin: u32);
    async fn write_value(&self, pin: u32, value: u8) -> Result<(), AppError>;
    /// Stops any watch and gives the pin back to the kernel.
    async fn release(&self, pin: u32) -> Result<(), AppError>;
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
