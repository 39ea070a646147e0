//! Per-subsystem controllers.
//!
//! Every controller is constructed from the session controller, subscribes
//! to it once, and talks to the device only through the shared channel.

pub mod audio;
pub mod clipboard;
pub mod display;
pub mod drive_map;
pub mod media;
pub mod network;

use std::sync::{Arc, Mutex};

use sunpci_common::SunPciError;
use tracing::{debug, warn};

use crate::fault::PollHealth;
use crate::lock;
use crate::scheduler::Subsystem;
use crate::session::{SessionController, SessionObserver};

pub use audio::AudioController;
pub use clipboard::{ClipboardFormat, ClipboardPayload, ClipboardSync};
pub use display::{DisplaySync, Frame};
pub use drive_map::{DriveMapController, DriveMapEntry, DriveMapFlags, DriveMapTable};
pub use media::{MediaController, MediaSlot, SlotState};
pub use network::{BridgeConfig, NetworkBridge, NetworkTraffic};

/// Subscribe `controller` to session events without keeping it alive.
pub(crate) fn subscribe<T: SessionObserver + 'static>(
    session: &SessionController,
    controller: &Arc<T>,
) {
    let observer: Arc<dyn SessionObserver> = controller.clone();
    session.subscribe(Arc::downgrade(&observer));
}

/// Record a failed poll and force the session into `Error` once the
/// failure threshold is reached.
///
/// Failures from an epoch that is no longer running are dropped.
pub(crate) fn report_poll_failure(
    session: &SessionController,
    health: &Mutex<PollHealth>,
    subsystem: Subsystem,
    epoch: u64,
    err: SunPciError,
) {
    if !session.is_current(epoch) {
        debug!("Discarding {} result from a previous session: {}", subsystem, err);
        return;
    }

    warn!("{} poll failed: {}", subsystem, err);
    let (escalate, count) = {
        let mut health = lock(health);
        let escalate = health.record_failure(err.clone());
        (escalate, health.consecutive_failures())
    };
    if escalate {
        let reason = format!("{} poll failed {} times in a row: {}", subsystem, count, err);
        session.escalate(epoch, reason, err);
    }
}
