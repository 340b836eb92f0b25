use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::api::{RemoteApi, SwitchEvent};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::gpio::{EdgeCallbackHandler, EdgeEvent, EventHandler, GpioBackend, HIGH, LOW};
use crate::probe::{self, GpioAvailability, Mode, ProbeSettings, SystemInfo};
use crate::users::UserDirectory;

const EDGE_CHANNEL_CAPACITY: usize = 64;
const CLAIM_SETTLE_DELAY: Duration = Duration::from_millis(50);
const SIMULATED_WRITE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulbOutcome {
    pub bulb: usize,
    pub gpio: u32,
    pub simulated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "status",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Notification {
    Sent { user_id: String, response: Value },
    NoUser { switch_input: u32 },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchPressOutcome {
    pub switch: usize,
    pub turn_on_bulb: BulbOutcome,
    pub send_api_request: Notification,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GpioStatus {
    pub gpio_available: bool,
    pub mode: Mode,
    pub is_monitoring: bool,
    pub is_docker: bool,
    pub switch_states: Vec<bool>,
    pub switch_pins: Vec<u32>,
    pub bulb_pins: Vec<u32>,
    pub switch_count: usize,
    pub bulb_count: usize,
    pub timestamp: String,
    pub system_info: SystemInfo,
}

/// Owns the switch and bulb pins and runs the press workflow.
///
/// The mode is fixed once construction returns. In simulation no pin is
/// ever claimed, and every bulb operation is logged with the same timing.
pub struct GpioController {
    config: Arc<AppConfig>,
    probe: ProbeSettings,
    availability: GpioAvailability,
    mode: Mode,
    backend: Arc<dyn GpioBackend>,
    directory: Arc<UserDirectory>,
    api: Arc<dyn RemoteApi>,
    edge_handler: EventHandler,
    monitoring: AtomicBool,
    closed: AtomicBool,
    claimed: Mutex<Vec<u32>>,
    in_flight: Vec<AtomicU32>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl GpioController {
    /// Probes the hardware (unless disabled by config) and claims the pins.
    pub async fn initialize(
        config: Arc<AppConfig>,
        probe: ProbeSettings,
        backend: Arc<dyn GpioBackend>,
        directory: Arc<UserDirectory>,
        api: Arc<dyn RemoteApi>,
    ) -> Self {
        let availability = if config.enable_gpio {
            info!("Checking GPIO availability...");
            probe::detect(&probe)
        } else {
            info!("GPIO disabled by configuration");
            GpioAvailability::unavailable()
        };
        Self::with_availability(config, probe, availability, backend, directory, api).await
    }

    pub async fn with_availability(
        config: Arc<AppConfig>,
        probe: ProbeSettings,
        availability: GpioAvailability,
        backend: Arc<dyn GpioBackend>,
        directory: Arc<UserDirectory>,
        api: Arc<dyn RemoteApi>,
    ) -> Self {
        let (mode, claimed) = match availability.mode() {
            Mode::Simulation => {
                warn!("GPIO hardware not available, activating simulation mode");
                info!("Test switches using: GET /test/switch/{{1-{}}}", config.pins.len());
                (Mode::Simulation, Vec::new())
            }
            Mode::Hardware => {
                info!("GPIO hardware detected, initializing physical pins...");
                match Self::claim_pins(&config, backend.as_ref()).await {
                    Ok(claimed) => {
                        info!("GPIO hardware initialization completed");
                        (Mode::Hardware, claimed)
                    }
                    Err(e) => {
                        error!("{e}");
                        warn!("Falling back to simulation mode due to hardware error");
                        (Mode::Simulation, Vec::new())
                    }
                }
            }
        };

        let (event_tx, _) = broadcast::channel(EDGE_CHANNEL_CAPACITY);
        let in_flight = (0..config.pins.len()).map(|_| AtomicU32::new(0)).collect();

        Self {
            config,
            probe,
            availability,
            mode,
            backend,
            directory,
            api,
            edge_handler: Arc::new(EdgeCallbackHandler::new(event_tx)),
            monitoring: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            claimed: Mutex::new(claimed),
            in_flight,
            dispatcher: Mutex::new(None),
        }
    }

    /// Claims every switch as an input, then every bulb as an output.
    /// On failure all pins claimed so far are released again.
    async fn claim_pins(
        config: &AppConfig,
        backend: &dyn GpioBackend,
    ) -> Result<Vec<u32>, AppError> {
        let pins = &config.pins;
        let plan = pins
            .switch_pins
            .iter()
            .enumerate()
            .map(|(i, pin)| (*pin, true, i + 1))
            .chain(
                pins.bulb_pins
                    .iter()
                    .enumerate()
                    .map(|(i, pin)| (*pin, false, i + 1)),
            );

        let mut claimed = Vec::with_capacity(pins.len() * 2);
        for (n, (pin, is_input, position)) in plan.enumerate() {
            if n > 0 {
                tokio::time::sleep(CLAIM_SETTLE_DELAY).await;
            }
            let kind = if is_input { "Switch" } else { "Bulb" };

            let result = async {
                if backend.is_exported(pin).await {
                    warn!("GPIO {pin} still exported from a previous run, releasing it");
                    backend.release(pin).await?;
                }
                if is_input {
                    backend.claim_input(pin).await
                } else {
                    backend.claim_output(pin).await
                }
            }
            .await;

            match result {
                Ok(()) => {
                    info!("{kind} {position} initialized on GPIO {pin}");
                    claimed.push(pin);
                }
                Err(e) => {
                    for pin in claimed.drain(..).rev() {
                        if let Err(e) = backend.release(pin).await {
                            warn!("Rollback of GPIO {pin} failed: {e}");
                        }
                    }
                    return Err(AppError::HardwareInit(format!(
                        "{kind} {position} on GPIO {pin}: {e}"
                    )));
                }
            }
        }
        Ok(claimed)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn availability(&self) -> &GpioAvailability {
        &self.availability
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::SeqCst)
    }

    /// Registers the edge handler on every switch. A second call only warns.
    /// After `shutdown` it refuses, since the pins are gone.
    pub async fn start_monitoring(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            warn!("GPIO controller already shut down, not monitoring");
            return;
        }
        if self.monitoring.swap(true, Ordering::SeqCst) {
            warn!("GPIO monitoring already active");
            return;
        }
        info!("Starting GPIO monitoring...");

        if self.mode == Mode::Simulation {
            info!("SIMULATION MODE: GPIO monitoring active");
            return;
        }

        let rx = self.edge_handler.subscribe();
        for (i, pin) in self.config.pins.switch_pins.iter().enumerate() {
            if let Err(e) = self.backend.watch(*pin, self.edge_handler.clone()).await {
                error!("Could not watch switch {} on GPIO {pin}: {e}", i + 1);
            }
        }

        let task = tokio::spawn(dispatch_edges(Arc::downgrade(self), rx));
        if let Some(old) = self.dispatcher.lock().replace(task) {
            old.abort();
        }
        info!("HARDWARE MODE: physical GPIO monitoring active");
    }

    /// Pulses the bulb and notifies the API for a 1-based switch index.
    ///
    /// Both legs always run to completion, even when the caller stops
    /// waiting. Only a failed notification fails the call; a bulb failure is
    /// reported in the outcome.
    pub async fn handle_switch_press(
        self: &Arc<Self>,
        index: usize,
    ) -> Result<SwitchPressOutcome, AppError> {
        let count = self.config.pins.len();
        if index == 0 || index > count {
            return Err(AppError::InvalidSwitchIndex { index, max: count });
        }
        info!("Switch {index} activated");

        // the press runs on its own task, dropping this future only stops the wait
        let controller = Arc::clone(self);
        tokio::spawn(async move { controller.run_press(index).await })
            .await
            .map_err(|e| AppError::Gpio(format!("switch {index} press task failed: {e}")))?
    }

    async fn run_press(&self, index: usize) -> Result<SwitchPressOutcome, AppError> {
        let position = index - 1;
        let _busy = InFlight::enter(&self.in_flight[position]);
        let (bulb, notification) =
            tokio::join!(self.pulse_bulb(position), self.notify(position));

        Ok(SwitchPressOutcome {
            switch: index,
            turn_on_bulb: bulb,
            send_api_request: notification?,
        })
    }

    async fn pulse_bulb(&self, position: usize) -> BulbOutcome {
        let bulb = position + 1;
        let pin = self.config.pins.bulb_pins[position];
        let hold = self.config.pulse_duration;
        let mut outcome = BulbOutcome {
            bulb,
            gpio: pin,
            simulated: self.mode == Mode::Simulation,
            error: None,
        };

        if self.mode == Mode::Simulation {
            info!("SIMULATION: Bulb {bulb} -> ON");
            tokio::time::sleep(SIMULATED_WRITE_DELAY).await;
            info!("SIMULATION: Bulb {bulb} illuminated ({hold:?})");
            tokio::time::sleep(hold).await;
            info!("SIMULATION: Bulb {bulb} -> OFF");
            return outcome;
        }

        if let Err(e) = self.backend.write_value(pin, HIGH).await {
            error!("Error turning on bulb {bulb} (GPIO {pin}): {e}");
            outcome.error = Some(e.to_string());
            return outcome;
        }
        info!("HARDWARE: Bulb {bulb} -> ON (GPIO {pin})");

        tokio::time::sleep(hold).await;

        if let Err(e) = self.backend.write_value(pin, LOW).await {
            error!("Error turning off bulb {bulb} (GPIO {pin}): {e}");
            outcome.error = Some(e.to_string());
            return outcome;
        }
        info!("HARDWARE: Bulb {bulb} -> OFF (GPIO {pin})");
        outcome
    }

    async fn notify(&self, position: usize) -> Result<Notification, AppError> {
        let switch_input = self.config.pins.switch_pins[position];
        let Some(user) = self.directory.get_user(switch_input).await? else {
            warn!("No user found for switch GPIO {switch_input}");
            return Ok(Notification::NoUser { switch_input });
        };

        let event = SwitchEvent::calling(&self.config.api.device_id, user.location.clone());
        info!(
            "API: sending request for switch GPIO {switch_input} (user {})",
            user.user_id
        );

        match self.api.send_switch_event(&event, &user.access_token).await {
            Ok(response) => {
                info!("API: request completed for switch GPIO {switch_input}");
                Ok(Notification::Sent {
                    user_id: user.user_id,
                    response,
                })
            }
            Err(AppError::Unauthorized) => {
                error!(
                    "API: token for user {} was rejected, credentials need rotating",
                    user.user_id
                );
                Err(AppError::Unauthorized)
            }
            Err(e) => {
                error!("API: failed for switch GPIO {switch_input}: {e}");
                Err(e)
            }
        }
    }

    pub fn status(&self) -> GpioStatus {
        let pins = &self.config.pins;
        GpioStatus {
            gpio_available: self.mode == Mode::Hardware,
            mode: self.mode,
            is_monitoring: self.is_monitoring(),
            is_docker: probe::is_docker(&self.probe),
            switch_states: self
                .in_flight
                .iter()
                .map(|n| n.load(Ordering::SeqCst) > 0)
                .collect(),
            switch_pins: pins.switch_pins.clone(),
            bulb_pins: pins.bulb_pins.clone(),
            switch_count: pins.switch_pins.len(),
            bulb_count: pins.bulb_pins.len(),
            timestamp: chrono::Local::now().to_rfc3339(),
            system_info: probe::system_info(&self.probe),
        }
    }

    /// Stops watching, forces bulbs low and releases every claimed pin.
    /// Presses already in flight finish on their own.
    pub async fn shutdown(&self) {
        info!("Cleaning up GPIO resources...");
        self.closed.store(true, Ordering::SeqCst);
        self.monitoring.store(false, Ordering::SeqCst);

        let dispatcher = self.dispatcher.lock().take();
        if let Some(task) = dispatcher {
            task.abort();
        }

        let claimed = std::mem::take(&mut *self.claimed.lock());
        if claimed.is_empty() {
            info!("Cleanup completed (no pins claimed)");
            return;
        }

        let pins = &self.config.pins;
        for pin in pins.switch_pins.iter().filter(|p| claimed.contains(p)) {
            self.backend.unwatch(*pin).await;
        }
        for (i, pin) in pins.bulb_pins.iter().enumerate() {
            if !claimed.contains(pin) {
                continue;
            }
            match self.backend.write_value(*pin, LOW).await {
                Ok(()) => info!("Bulb {} turned off", i + 1),
                Err(e) => error!("Error turning off bulb {}: {e}", i + 1),
            }
        }
        for pin in claimed {
            if let Err(e) = self.backend.release(pin).await {
                error!("Error releasing GPIO {pin}: {e}");
            }
        }
        info!("Hardware cleanup completed");
    }
}

/// Marks a switch busy for as long as the guard lives.
struct InFlight<'a>(&'a AtomicU32);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn dispatch_edges(controller: Weak<GpioController>, rx: broadcast::Receiver<EdgeEvent>) {
    let mut events = BroadcastStream::new(rx);

    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                warn!("Edge channel lagged, {n} presses dropped");
                continue;
            }
        };
        let Some(controller) = controller.upgrade() else {
            break;
        };
        let Some(position) = controller.config.pins.switch_position(event.pin) else {
            continue;
        };

        // one task per press, presses never wait on each other
        tokio::spawn(async move {
            if let Err(e) = controller.handle_switch_press(position + 1).await {
                error!("Error handling switch press: {e}");
            }
        });
    }
}
