use std::{collections::HashSet, env, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub const DEFAULT_SWITCH_PINS: [u32; 5] = [2, 3, 4, 17, 27];
pub const DEFAULT_BULB_PINS: [u32; 5] = [18, 23, 24, 25, 8];

const DEFAULT_DEVICE_ID: &str = "raspberry-pi-001";
const DEFAULT_DATABASE_URL: &str = "sqlite::memory:";
const DEFAULT_PULSE_SECS: f64 = 2.0;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ApiConfig {
    pub url: String,
    pub endpoint: String,
    pub device_id: String,
    pub company_id: String,
}

impl ApiConfig {
    pub fn user_agent(&self) -> String {
        format!("RaspberryPi-GPIO-Controller/1.0/{}", self.device_id)
    }

    pub fn users_url(&self) -> String {
        format!(
            "{}/{}",
            self.url.trim_end_matches('/'),
            self.endpoint.trim_start_matches('/')
        )
    }

    pub fn event_url(&self) -> String {
        format!(
            "{}/api/v1/companies/{}/queues/call-external",
            self.url.trim_end_matches('/'),
            self.company_id
        )
    }
}

/// Index-aligned switch and bulb pins, in BCM numbering.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct PinMap {
    pub switch_pins: Vec<u32>,
    pub bulb_pins: Vec<u32>,
}

impl Default for PinMap {
    fn default() -> Self {
        Self {
            switch_pins: DEFAULT_SWITCH_PINS.to_vec(),
            bulb_pins: DEFAULT_BULB_PINS.to_vec(),
        }
    }
}

impl PinMap {
    pub fn new(switch_pins: Vec<u32>, bulb_pins: Vec<u32>) -> Result<Self, AppError> {
        let map = Self {
            switch_pins,
            bulb_pins,
        };
        map.validate()?;
        Ok(map)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.switch_pins.is_empty() {
            return Err(AppError::Config("at least one switch pin is required".into()));
        }
        if self.switch_pins.len() != self.bulb_pins.len() {
            return Err(AppError::Config(format!(
                "{} switch pins but {} bulb pins",
                self.switch_pins.len(),
                self.bulb_pins.len()
            )));
        }

        let mut seen = HashSet::new();
        for pin in self.switch_pins.iter().chain(self.bulb_pins.iter()) {
            if !seen.insert(*pin) {
                return Err(AppError::Config(format!("pin {pin} is assigned twice")));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.switch_pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.switch_pins.is_empty()
    }

    pub fn contains(&self, pin: u32) -> bool {
        self.switch_pins.contains(&pin) || self.bulb_pins.contains(&pin)
    }

    /// Zero-based position of a switch pin.
    pub fn switch_position(&self, pin: u32) -> Option<usize> {
        self.switch_pins.iter().position(|p| *p == pin)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub api: ApiConfig,
    pub pins: PinMap,
    pub database_url: String,
    pub environment: String,
    pub pulse_duration: Duration,
    pub enable_gpio: bool,
    pub probe_pin: Option<u32>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = match get("PORT") {
            Some(v) => v
                .trim()
                .parse::<u16>()
                .map_err(|_| AppError::Config(format!("invalid PORT: {v}")))?,
            None => 3000,
        };

        let pulse_duration = match get("TIME_ON_BULB") {
            Some(v) => v
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(|s| Duration::try_from_secs_f64(s).ok())
                .ok_or_else(|| AppError::Config(format!("invalid TIME_ON_BULB: {v}")))?,
            None => Duration::from_secs_f64(DEFAULT_PULSE_SECS),
        };

        let enable_gpio = match get("ENABLE_GPIO") {
            Some(v) => parse_bool(&v)
                .ok_or_else(|| AppError::Config(format!("invalid ENABLE_GPIO: {v}")))?,
            None => true,
        };

        let probe_pin = match get("GPIO_PROBE_PIN") {
            Some(v) => Some(
                v.trim()
                    .parse::<u32>()
                    .map_err(|_| AppError::Config(format!("invalid GPIO_PROBE_PIN: {v}")))?,
            ),
            None => None,
        };

        let switch_pins = match get("SWITCH_PINS") {
            Some(v) => parse_pin_list("SWITCH_PINS", &v)?,
            None => DEFAULT_SWITCH_PINS.to_vec(),
        };
        let bulb_pins = match get("BULB_PINS") {
            Some(v) => parse_pin_list("BULB_PINS", &v)?,
            None => DEFAULT_BULB_PINS.to_vec(),
        };
        let pins = PinMap::new(switch_pins, bulb_pins)?;

        if let Some(pin) = probe_pin
            && pins.contains(pin)
        {
            return Err(AppError::Config(format!(
                "GPIO_PROBE_PIN {pin} overlaps a switch or bulb pin"
            )));
        }

        Ok(Self {
            http: HttpConfig {
                host: get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                port,
            },
            api: ApiConfig {
                url: get("API_URL").unwrap_or_default(),
                endpoint: get("API_ENDPOINT").unwrap_or_default(),
                device_id: get("DEVICE_ID").unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string()),
                company_id: get("COMPANY_ID").unwrap_or_default(),
            },
            pins,
            database_url: get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            environment: get("ENVIRONMENT")
                .or_else(|| get("NODE_ENV"))
                .unwrap_or_else(|| "development".to_string()),
            pulse_duration,
            enable_gpio,
            probe_pin,
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_pin_list(key: &str, value: &str) -> Result<Vec<u32>, AppError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .map_err(|_| AppError::Config(format!("invalid pin '{s}' in {key}")))
        })
        .collect()
}
