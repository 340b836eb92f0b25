pub mod api;
pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod gpio;
pub mod probe;
pub mod routes;
pub mod users;

#[cfg(test)]
mod test_utils;

pub use api::{HttpRemoteApi, RemoteApi};
pub use config::{AppConfig, PinMap};
pub use controller::{GpioController, SwitchPressOutcome};
pub use error::AppError;
pub use gpio::{EdgeEvent, EventHandler, GpioBackend};
pub use probe::{GpioAvailability, Mode, ProbeSettings};
pub use routes::AppState;
pub use users::{UserDirectory, UserStore};

#[cfg(feature = "chardev-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::{MockGpioBackend, SysfsBackend};
