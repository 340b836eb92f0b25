use log::warn;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, yield_now};
use std::time::Duration;

use async_trait::async_trait;
use libgpiod::{chip::Chip, line, line::EventClock, request};
use parking_lot::{FairMutex, RwLock};
use rustc_hash::FxHashMap;

use crate::error::AppError;
use crate::gpio::{EdgeEvent, EventHandler, GpioBackend, HIGH, LOW};

const LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY: usize = 64;
const LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT_MS: Duration = Duration::from_millis(10);

/// Character-device driver (`/dev/gpiochipN`) built on libgpiod v2.
///
/// Lines are requested one per pin so they can be released independently.
/// A legacy sysfs export of the same line blocks the request, so such
/// exports are reported by `is_exported` and cleared by `release`.
pub struct LibgpiodBackend {
    chip: String,
    sysfs: PathBuf,
    pins: RwLock<FxHashMap<u32, PinHandle>>,
}

struct PinHandle {
    listener: Option<EdgeListener>, // joined before the request is dropped
    gpiod_handle: Arc<FairMutex<GpiodHandle>>,
}

struct GpiodHandle {
    request: request::Request,
}

impl GpiodHandle {
    fn new(chip: &str, line_cfg: &line::Config) -> Result<Self, AppError> {
        let chip = Self::open_chip(chip)?;
        let request = Self::request_lines(&chip, line_cfg)?;
        Ok(Self { request })
    }

    fn open_chip(path: &str) -> Result<Chip, AppError> {
        let p = PathBuf::from(path);
        Chip::open(&p).map_err(|e| AppError::Gpio(format!("open chip {path}: {e}")))
    }

    fn request_lines(chip: &Chip, line_cfg: &line::Config) -> Result<request::Request, AppError> {
        let mut req_cfg =
            request::Config::new().map_err(|e| AppError::Gpio(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| AppError::Gpio(format!("request consumer: {e}")))?;
        chip.request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| AppError::Gpio(format!("request lines: {e}")))
    }
}

struct EdgeListener {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EdgeListener {
    fn new(
        pin: u32,
        gpiod_handle: Arc<FairMutex<GpiodHandle>>,
        handler: EventHandler,
    ) -> Result<Self, AppError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();
        let mut buffer = request::Buffer::new(LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY)
            .map_err(|e| AppError::Gpio(format!("event buffer: {e}")))?;

        // blocking kernel wait; the handler only forwards into the async edge channel
        let handle = std::thread::spawn(move || {
            while !cancel_flag.load(Ordering::Relaxed) {
                let hdl = gpiod_handle.lock();
                let req = &hdl.request;

                let has_event =
                    match req.wait_edge_events(Some(LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT_MS)) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("wait edge events error for pin {pin}: {e}");
                            yield_now();
                            continue;
                        }
                    };
                if !has_event {
                    continue;
                }

                let events = match req.read_edge_events(&mut buffer) {
                    Ok(evts) => evts,
                    Err(e) => {
                        warn!("read edge events error for pin {pin}: {e}");
                        yield_now();
                        continue;
                    }
                };
                for evt in events {
                    let Ok(evt) = evt else { continue };
                    if matches!(evt.event_type(), Ok(line::EdgeKind::Rising)) {
                        handler.dispatch(EdgeEvent {
                            pin,
                            timestamp_ms: evt.timestamp().as_millis() as u64,
                        });
                    }
                }
            }
        });

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }
}

impl Drop for EdgeListener {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Default for LibgpiodBackend {
    fn default() -> Self {
        Self::new("/dev/gpiochip0", "/sys/class/gpio")
    }
}

impl LibgpiodBackend {
    pub fn new(chip: impl Into<String>, sysfs: impl AsRef<Path>) -> Self {
        Self {
            chip: chip.into(),
            sysfs: sysfs.as_ref().to_path_buf(),
            pins: RwLock::new(FxHashMap::default()),
        }
    }

    fn sysfs_pin_dir(&self, pin: u32) -> PathBuf {
        self.sysfs.join(format!("gpio{pin}"))
    }

    fn input_settings() -> Result<line::Settings, AppError> {
        let mut ls =
            line::Settings::new().map_err(|e| AppError::Gpio(format!("libgpiod settings: {e}")))?;
        ls.set_direction(line::Direction::Input)
            .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;
        ls.set_bias(Some(line::Bias::PullUp))
            .map_err(|e| AppError::Gpio(format!("set bias: {e}")))?;
        ls.set_active_low(true);
        ls.set_edge_detection(Some(line::Edge::Rising))
            .map_err(|e| AppError::Gpio(format!("set edge detection: {e}")))?;
        ls.set_event_clock(EventClock::Realtime)
            .map_err(|e| AppError::Gpio(format!("set event clock: {e}")))?;
        Ok(ls)
    }

    fn output_settings() -> Result<line::Settings, AppError> {
        let mut ls =
            line::Settings::new().map_err(|e| AppError::Gpio(format!("libgpiod settings: {e}")))?;
        ls.set_direction(line::Direction::Output)
            .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;
        ls.set_drive(line::Drive::PushPull)
            .map_err(|e| AppError::Gpio(format!("set drive: {e}")))?;
        ls.set_output_value(line::Value::InActive)
            .map_err(|e| AppError::Gpio(format!("set output value: {e}")))?;
        Ok(ls)
    }

    fn make_line_config(offset: u32, settings: line::Settings) -> Result<line::Config, AppError> {
        let mut cfg =
            line::Config::new().map_err(|e| AppError::Gpio(format!("line config: {e}")))?;
        cfg.add_line_settings(&[offset], settings)
            .map_err(|e| AppError::Gpio(format!("line config add settings: {e}")))?;
        Ok(cfg)
    }

    fn claim(&self, pin: u32, settings: line::Settings) -> Result<(), AppError> {
        let mut pins = self.pins.write();
        if pins.contains_key(&pin) {
            return Err(AppError::Gpio(format!("pin {pin} already claimed")));
        }

        let line_cfg = Self::make_line_config(pin, settings)?;
        let gpiod_handle = Arc::new(FairMutex::new(GpiodHandle::new(&self.chip, &line_cfg)?));
        pins.insert(
            pin,
            PinHandle {
                listener: None,
                gpiod_handle,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl GpioBackend for LibgpiodBackend {
    async fn is_exported(&self, pin: u32) -> bool {
        self.sysfs_pin_dir(pin).exists() || self.pins.read().contains_key(&pin)
    }

    async fn claim_input(&self, pin: u32) -> Result<(), AppError> {
        self.claim(pin, Self::input_settings()?)
    }

    async fn claim_output(&self, pin: u32) -> Result<(), AppError> {
        self.claim(pin, Self::output_settings()?)
    }

    async fn watch(&self, pin: u32, handler: EventHandler) -> Result<(), AppError> {
        let mut pins = self.pins.write();
        let handle = pins
            .get_mut(&pin)
            .ok_or_else(|| AppError::Gpio(format!("pin {pin} not claimed")))?;

        // replacing the listener joins the previous thread first
        handle.listener = None;
        handle.listener = Some(EdgeListener::new(
            pin,
            handle.gpiod_handle.clone(),
            handler,
        )?);
        Ok(())
    }

    async fn unwatch(&self, pin: u32) {
        let listener = self
            .pins
            .write()
            .get_mut(&pin)
            .and_then(|h| h.listener.take());
        drop(listener);
    }

    async fn write_value(&self, pin: u32, value: u8) -> Result<(), AppError> {
        let pins = self.pins.read();
        let handle = pins
            .get(&pin)
            .ok_or_else(|| AppError::Gpio(format!("pin {pin} not claimed")))?;

        let value = match value {
            LOW => line::Value::InActive,
            HIGH => line::Value::Active,
            other => {
                return Err(AppError::Gpio(format!(
                    "invalid value {other} for pin {pin}"
                )));
            }
        };

        handle
            .gpiod_handle
            .lock()
            .request
            .set_value(pin, value)
            .map_err(|e| AppError::Gpio(format!("set value: {e}")))?;
        Ok(())
    }

    async fn release(&self, pin: u32) -> Result<(), AppError> {
        let removed = self.pins.write().remove(&pin);
        drop(removed);

        if self.sysfs_pin_dir(pin).exists() {
            tokio::fs::write(self.sysfs.join("unexport"), pin.to_string())
                .await
                .map_err(|e| AppError::Gpio(format!("unexport stale pin {pin}: {e}")))?;
        }
        Ok(())
    }
}
