//! Wire contract, driver backend and configuration store shared by the
//! SunPCi host core.

pub mod config;
pub mod config_storage;
pub mod driver;
pub mod ioctl;
pub mod request;
pub mod types;

pub use config::*;
pub use config_storage::*;
pub use driver::{is_driver_loaded, DeviceBackend, DriverHandle, FramebufferMap, DEVICE_PATH};
// Note: ioctl module is NOT re-exported via `pub use *` to avoid naming conflicts.
// Use `sunpci_common::ioctl::*` directly for kernel interface types.
pub use request::{Request, Response};
pub use types::*;
