//! Host-side session and device control for the SunPCi coprocessor card.
//!
//! A single [`DeviceChannel`] serializes every request to the driver. The
//! [`SessionController`] owns the guest lifecycle, and the subsystem
//! controllers in [`controllers`] are driven by the [`Scheduler`] while a
//! session is running. [`SunPciHost`] wires all of them together from an
//! [`AppConfig`](sunpci_common::AppConfig).

pub mod channel;
pub mod controllers;
pub mod fault;
pub mod host;
pub mod scheduler;
pub mod session;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use channel::DeviceChannel;
pub use fault::PollHealth;
pub use host::SunPciHost;
pub use scheduler::{PeriodicTask, Scheduler, Subsystem};
pub use session::{
    SessionConfig, SessionController, SessionEvent, SessionFlags, SessionObserver,
    SessionSnapshot, SessionState, SessionStats,
};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
