#[cfg(feature = "chardev-gpio")]
pub mod libgpiod;
pub mod mock;
pub mod sysfs;

#[cfg(feature = "chardev-gpio")]
pub use libgpiod::LibgpiodBackend;
pub use mock::{MockGpioBackend, PinRole, WriteRecord};
pub use sysfs::SysfsBackend;
