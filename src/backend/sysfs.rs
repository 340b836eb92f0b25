use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;

use crate::error::AppError;
use crate::gpio::{EdgeEvent, EventHandler, GpioBackend, HIGH, LOW};

const SYSFS_EXPORT_SETTLE_ATTEMPTS: u32 = 20;
const SYSFS_EXPORT_SETTLE_INTERVAL: Duration = Duration::from_millis(10);
const SYSFS_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Legacy `/sys/class/gpio` driver. Every value access is an async file operation.
pub struct SysfsBackend {
    base: PathBuf,
    watchers: Mutex<FxHashMap<u32, JoinHandle<()>>>,
}

impl Default for SysfsBackend {
    fn default() -> Self {
        Self::new("/sys/class/gpio")
    }
}

impl SysfsBackend {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            watchers: Mutex::new(FxHashMap::default()),
        }
    }

    fn pin_dir(&self, pin: u32) -> PathBuf {
        self.base.join(format!("gpio{pin}"))
    }

    fn pin_attr(&self, pin: u32, attr: &str) -> PathBuf {
        self.pin_dir(pin).join(attr)
    }

    async fn write_attr(&self, pin: u32, attr: &str, value: &str) -> Result<(), AppError> {
        let path = self.pin_attr(pin, attr);
        tokio::fs::write(&path, value)
            .await
            .map_err(|e| AppError::Gpio(format!("write {}: {e}", path.display())))
    }

    async fn export(&self, pin: u32) -> Result<(), AppError> {
        if self.pin_dir(pin).exists() {
            return Ok(());
        }

        let export = self.base.join("export");
        tokio::fs::write(&export, pin.to_string())
            .await
            .map_err(|e| AppError::Gpio(format!("export pin {pin}: {e}")))?;

        // udev may still be fixing up permissions right after the kernel creates the node
        for _ in 0..SYSFS_EXPORT_SETTLE_ATTEMPTS {
            if self.pin_attr(pin, "direction").exists() {
                return Ok(());
            }
            tokio::time::sleep(SYSFS_EXPORT_SETTLE_INTERVAL).await;
        }
        Err(AppError::Gpio(format!(
            "pin {pin} did not appear after export"
        )))
    }

    async fn read_value(path: &Path) -> Option<u8> {
        let raw = tokio::fs::read_to_string(path).await.ok()?;
        match raw.trim() {
            "0" => Some(LOW),
            "1" => Some(HIGH),
            _ => None,
        }
    }
}

#[async_trait]
impl GpioBackend for SysfsBackend {
    async fn is_exported(&self, pin: u32) -> bool {
        self.pin_dir(pin).exists()
    }

    async fn claim_input(&self, pin: u32) -> Result<(), AppError> {
        self.export(pin).await?;
        self.write_attr(pin, "direction", "in").await?;
        self.write_attr(pin, "active_low", "1").await?;
        self.write_attr(pin, "edge", "rising").await?;
        debug!("sysfs: pin {pin} claimed as input");
        Ok(())
    }

    async fn claim_output(&self, pin: u32) -> Result<(), AppError> {
        self.export(pin).await?;
        // "low" sets direction and initial level in one step, so the line never floats high
        self.write_attr(pin, "direction", "low").await?;
        debug!("sysfs: pin {pin} claimed as output");
        Ok(())
    }

    async fn watch(&self, pin: u32, handler: EventHandler) -> Result<(), AppError> {
        let value_path = self.pin_attr(pin, "value");
        let mut previous = Self::read_value(&value_path)
            .await
            .ok_or_else(|| AppError::Gpio(format!("read value of pin {pin}")))?;

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SYSFS_POLL_INTERVAL);
            loop {
                interval.tick().await;
                let Some(current) = Self::read_value(&value_path).await else {
                    continue;
                };
                if previous == LOW && current == HIGH {
                    handler.dispatch(EdgeEvent::now(pin));
                }
                previous = current;
            }
        });

        if let Some(old) = self.watchers.lock().insert(pin, task) {
            old.abort();
        }
        Ok(())
    }

    async fn unwatch(&self, pin: u32) {
        if let Some(task) = self.watchers.lock().remove(&pin) {
            task.abort();
        }
    }

    async fn write_value(&self, pin: u32, value: u8) -> Result<(), AppError> {
        if value > HIGH {
            return Err(AppError::Gpio(format!("invalid value {value} for pin {pin}")));
        }
        self.write_attr(pin, "value", &value.to_string()).await
    }

    async fn release(&self, pin: u32) -> Result<(), AppError> {
        self.unwatch(pin).await;
        if !self.pin_dir(pin).exists() {
            return Ok(());
        }

        let unexport = self.base.join("unexport");
        tokio::fs::write(&unexport, pin.to_string())
            .await
            .map_err(|e| {
                warn!("sysfs: unexport of pin {pin} failed: {e}");
                AppError::Gpio(format!("unexport pin {pin}: {e}"))
            })
    }
}

impl Drop for SysfsBackend {
    fn drop(&mut self) {
        for (_, task) in self.watchers.get_mut().drain() {
            task.abort();
        }
    }
}
