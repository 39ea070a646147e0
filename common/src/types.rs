//! Common types used throughout the application.

use nix::errno::Errno;
use thiserror::Error;

/// Errors that can occur in the SunPCi host core.
///
/// The enum is `Clone` so controllers can keep the last error they saw and
/// hand it to the presentation layer on request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SunPciError {
    #[error("Driver not loaded")]
    DriverNotLoaded,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Drive {0}: is already mapped")]
    DuplicateMapping(char),

    #[error("Slot {0} already holds a mounted image")]
    SlotBusy(String),

    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("Device I/O fault: {0}")]
    IoFault(Errno),

    #[error("Device did not respond within {0} ms")]
    Timeout(u64),

    #[error("Device channel is closed")]
    ChannelClosed,

    #[error("Failed to apply drive mapping {letter}: ({source})")]
    DriveMapApply {
        letter: char,
        #[source]
        source: Box<SunPciError>,
    },
}

impl SunPciError {
    /// Errors produced by local validation; these never reach the device.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            SunPciError::InvalidConfig(_)
                | SunPciError::InvalidArgument(_)
                | SunPciError::StateConflict(_)
                | SunPciError::DuplicateMapping(_)
                | SunPciError::SlotBusy(_)
                | SunPciError::ResourceLimit(_)
        )
    }

    /// Device communication failures, counted towards fault escalation.
    pub fn is_device_fault(&self) -> bool {
        match self {
            SunPciError::IoFault(_) | SunPciError::Timeout(_) | SunPciError::ChannelClosed => true,
            SunPciError::DriveMapApply { source, .. } => source.is_device_fault(),
            _ => false,
        }
    }
}

impl From<Errno> for SunPciError {
    fn from(errno: Errno) -> Self {
        SunPciError::IoFault(errno)
    }
}

pub type Result<T, E = SunPciError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(SunPciError::ResourceLimit("clipboard".into()).is_local());
        assert!(SunPciError::DuplicateMapping('H').is_local());
        assert!(!SunPciError::Timeout(500).is_local());
        assert!(SunPciError::Timeout(500).is_device_fault());
        assert!(SunPciError::from(Errno::EIO).is_device_fault());

        let apply = SunPciError::DriveMapApply {
            letter: 'F',
            source: Box::new(SunPciError::IoFault(Errno::EINVAL)),
        };
        assert!(apply.is_device_fault());
        assert!(apply.to_string().starts_with("Failed to apply drive mapping F:"));
    }
}
