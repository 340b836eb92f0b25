use log::{info, warn};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use serde::Serialize;

const GPIO_EXPORT: &str = "sys/class/gpio/export";
const GPIO_UNEXPORT: &str = "sys/class/gpio/unexport";
const GPIO_MEM: &str = "dev/gpiomem";
const DEVICE_MODEL: &str = "proc/device-tree/model";
const DOCKER_ENV: &str = ".dockerenv";
const INIT_CGROUP: &str = "proc/1/cgroup";

/// Whether the controller drives real pins or only logs what it would do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Hardware,
    Simulation,
}

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// Filesystem root the well-known paths are resolved against.
    pub root: PathBuf,
    pub probe_pin: Option<u32>,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            probe_pin: None,
        }
    }
}

impl ProbeSettings {
    fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    fn pin_dir(&self, pin: u32) -> PathBuf {
        self.root.join(format!("sys/class/gpio/gpio{pin}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub has_gpio_export: bool,
    pub has_gpio_mem: bool,
    pub has_device_tree: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GpioAvailability {
    pub available: bool,
    pub has_gpio_export: bool,
    pub has_gpio_mem: bool,
    pub has_device_tree: bool,
    pub export_writable: bool,
    pub is_raspberry_pi: bool,
    pub is_docker: bool,
    pub device_model: Option<String>,
    pub export_round_trip: Option<bool>,
}

impl GpioAvailability {
    pub fn mode(&self) -> Mode {
        if self.available {
            Mode::Hardware
        } else {
            Mode::Simulation
        }
    }

    pub fn system_info(&self) -> SystemInfo {
        SystemInfo {
            has_gpio_export: self.has_gpio_export,
            has_gpio_mem: self.has_gpio_mem,
            has_device_tree: self.has_device_tree,
        }
    }

    /// An availability that never touched the filesystem.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            has_gpio_export: false,
            has_gpio_mem: false,
            has_device_tree: false,
            export_writable: false,
            is_raspberry_pi: false,
            is_docker: false,
            device_model: None,
            export_round_trip: None,
        }
    }
}

/// Cheap existence checks, safe to re-run on every status request.
pub fn system_info(settings: &ProbeSettings) -> SystemInfo {
    SystemInfo {
        has_gpio_export: settings.path(GPIO_EXPORT).exists(),
        has_gpio_mem: settings.path(GPIO_MEM).exists(),
        has_device_tree: settings.path(DEVICE_MODEL).exists(),
    }
}

pub fn is_docker(settings: &ProbeSettings) -> bool {
    if settings.path(DOCKER_ENV).exists() {
        return true;
    }
    fs::read_to_string(settings.path(INIT_CGROUP))
        .map(|cgroup| cgroup.contains("docker") || cgroup.contains("containerd"))
        .unwrap_or(false)
}

/// Decides whether GPIO hardware is usable. Filesystem errors count as failed checks.
pub fn detect(settings: &ProbeSettings) -> GpioAvailability {
    let info = system_info(settings);
    let is_docker = is_docker(settings);
    if is_docker {
        info!("Running in a Docker container");
    }

    info!(
        "GPIO check: export={}, gpiomem={}, device-tree={}",
        info.has_gpio_export, info.has_gpio_mem, info.has_device_tree
    );

    let device_model = if info.has_device_tree {
        match fs::read(settings.path(DEVICE_MODEL)) {
            Ok(raw) => Some(
                String::from_utf8_lossy(&raw)
                    .trim_end_matches('\0')
                    .trim()
                    .to_string(),
            ),
            Err(e) => {
                warn!("Could not read device model: {e}");
                None
            }
        }
    } else {
        None
    };
    let is_raspberry_pi = device_model
        .as_deref()
        .is_some_and(|m| m.contains("Raspberry Pi"));
    if let Some(model) = &device_model {
        info!("Device: {model} (Raspberry Pi: {is_raspberry_pi})");
    }

    let export_writable = info.has_gpio_export && is_writable(&settings.path(GPIO_EXPORT));

    let mut availability = GpioAvailability {
        available: false,
        has_gpio_export: info.has_gpio_export,
        has_gpio_mem: info.has_gpio_mem,
        has_device_tree: info.has_device_tree,
        export_writable,
        is_raspberry_pi,
        is_docker,
        device_model,
        export_round_trip: None,
    };

    if !info.has_gpio_export || !info.has_gpio_mem || !export_writable {
        return availability;
    }
    if availability.device_model.is_some() && !is_raspberry_pi && !is_docker {
        return availability;
    }

    if let Some(pin) = settings.probe_pin {
        let ok = export_round_trip(settings, pin);
        availability.export_round_trip = Some(ok);
        if !ok {
            warn!("GPIO export round trip on pin {pin} failed");
            return availability;
        }
    }

    availability.available = true;
    availability
}

fn is_writable(path: &Path) -> bool {
    OpenOptions::new().write(true).open(path).is_ok()
}

fn export_round_trip(settings: &ProbeSettings, pin: u32) -> bool {
    let pin_dir = settings.pin_dir(pin);

    // someone else owns it, and the kernel evidently accepted that export
    if pin_dir.exists() {
        return true;
    }

    if let Err(e) = fs::write(settings.path(GPIO_EXPORT), pin.to_string()) {
        warn!("Probe export of pin {pin} failed: {e}");
        return false;
    }
    let exported = pin_dir.exists();
    if let Err(e) = fs::write(settings.path(GPIO_UNEXPORT), pin.to_string()) {
        warn!("Probe unexport of pin {pin} failed: {e}");
    }
    exported
}
