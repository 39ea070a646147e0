//! Consecutive-failure tracking for periodic subsystem polls.

use sunpci_common::SunPciError;

pub const DEFAULT_FAULT_THRESHOLD: u32 = 5;

/// Counts consecutive device failures of one subsystem.
///
/// Local validation errors are remembered but never count towards the
/// threshold; only device faults do.
#[derive(Debug, Clone)]
pub struct PollHealth {
    threshold: u32,
    consecutive: u32,
    last_error: Option<SunPciError>,
}

impl Default for PollHealth {
    fn default() -> Self {
        Self::new(DEFAULT_FAULT_THRESHOLD)
    }
}

impl PollHealth {
    /// A threshold of 0 is treated as 1.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
            last_error: None,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    pub fn last_error(&self) -> Option<&SunPciError> {
        self.last_error.as_ref()
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Remember `err`; returns true exactly when the threshold is reached.
    pub fn record_failure(&mut self, err: SunPciError) -> bool {
        let counts = err.is_device_fault();
        self.last_error = Some(err);
        if !counts {
            return false;
        }
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive == self.threshold
    }

    /// Remember an error without affecting the failure count.
    pub fn note_error(&mut self, err: SunPciError) {
        self.last_error = Some(err);
    }

    /// Forget failures from a previous session.
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;

    #[test]
    fn test_threshold_reached_once() {
        let mut health = PollHealth::new(3);
        assert!(!health.record_failure(SunPciError::Timeout(100)));
        assert!(!health.record_failure(SunPciError::IoFault(Errno::EIO)));
        assert!(health.record_failure(SunPciError::Timeout(100)));
        assert!(!health.record_failure(SunPciError::Timeout(100)));
        assert_eq!(health.consecutive_failures(), 4);
    }

    #[test]
    fn test_success_resets_count() {
        let mut health = PollHealth::new(2);
        assert!(!health.record_failure(SunPciError::Timeout(100)));
        health.record_success();
        assert!(!health.record_failure(SunPciError::Timeout(100)));
        assert_eq!(health.last_error(), Some(&SunPciError::Timeout(100)));
    }

    #[test]
    fn test_local_errors_do_not_count() {
        let mut health = PollHealth::new(1);
        assert!(!health.record_failure(SunPciError::ResourceLimit("clipboard".into())));
        assert_eq!(health.consecutive_failures(), 0);
        assert!(health.last_error().is_some());
    }
}
