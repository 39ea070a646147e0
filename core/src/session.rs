//! Session lifecycle management.
//!
//! [`SessionController`] owns the guest session state machine:
//!
//! ```text
//! Stopped -start-> Starting -ack-> Running -stop-> Stopping -ack-> Stopped
//! Running -reset-> Starting
//! any -fault-> Error -stop-> Stopped
//! ```
//!
//! Every edge issues exactly one request on the device channel. Subsystem
//! controllers learn about transitions through [`SessionObserver`] and use
//! the session epoch to discard work that belongs to an earlier session.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use sunpci_common::ioctl::{
    self, DriverVersion, IoctlSessionConfig, KeyEvent, MouseEvent, SessionStatus,
    SUNPCI_MAX_MEMORY_MB, SUNPCI_MAX_PATH, SUNPCI_MIN_MEMORY_MB,
};
use sunpci_common::{AppConfig, Request, Response, Result, SunPciError};
use tracing::{debug, error, info, warn};

use crate::channel::{unexpected_response, DeviceChannel};
use crate::lock;

/// Host-side view of the guest session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl SessionState {
    /// Map a state word reported by the driver.
    pub fn from_driver(state: u32) -> Option<Self> {
        match state {
            ioctl::session_state::STOPPED => Some(SessionState::Stopped),
            ioctl::session_state::STARTING => Some(SessionState::Starting),
            ioctl::session_state::RUNNING => Some(SessionState::Running),
            ioctl::session_state::STOPPING => Some(SessionState::Stopping),
            ioctl::session_state::ERROR => Some(SessionState::Error),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Stopped => "stopped",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Session feature flags passed to the driver on start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionFlags(u32);

impl SessionFlags {
    pub const NETWORK_ENABLED: Self = Self(ioctl::flags::NETWORK_ENABLED);
    pub const CLIPBOARD_ENABLED: Self = Self(ioctl::flags::CLIPBOARD_ENABLED);
    pub const CLIPBOARD_TO_HOST: Self = Self(ioctl::flags::CLIPBOARD_TO_HOST);
    pub const CLIPBOARD_TO_GUEST: Self = Self(ioctl::flags::CLIPBOARD_TO_GUEST);

    const ALL: u32 = ioctl::flags::NETWORK_ENABLED
        | ioctl::flags::CLIPBOARD_ENABLED
        | ioctl::flags::CLIPBOARD_TO_HOST
        | ioctl::flags::CLIPBOARD_TO_GUEST;

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Unknown bits are dropped.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Guest-to-host clipboard transfer is enabled.
    pub fn clipboard_to_host(self) -> bool {
        self.contains(Self::CLIPBOARD_ENABLED) && self.contains(Self::CLIPBOARD_TO_HOST)
    }

    /// Host-to-guest clipboard transfer is enabled.
    pub fn clipboard_to_guest(self) -> bool {
        self.contains(Self::CLIPBOARD_ENABLED) && self.contains(Self::CLIPBOARD_TO_GUEST)
    }
}

impl std::ops::BitOr for SessionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Parameters of one guest session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub memory_mb: u32,
    pub flags: SessionFlags,
    pub primary_disk: Option<String>,
    pub secondary_disk: Option<String>,
    pub bios_path: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            memory_mb: 64,
            flags: SessionFlags::empty(),
            primary_disk: None,
            secondary_disk: None,
            bios_path: None,
        }
    }
}

impl SessionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        let path = |p: &Option<std::path::PathBuf>| {
            p.as_ref().map(|p| p.to_string_lossy().into_owned())
        };
        Self {
            memory_mb: config.session.memory_mb,
            flags: SessionFlags::from_bits_truncate(config.session_flags()),
            primary_disk: path(&config.session.primary_disk),
            secondary_disk: path(&config.session.secondary_disk),
            bios_path: path(&config.session.bios_path),
        }
    }

    /// Check memory size and path bounds.
    pub fn validate(&self) -> Result<()> {
        if !(SUNPCI_MIN_MEMORY_MB..=SUNPCI_MAX_MEMORY_MB).contains(&self.memory_mb) {
            return Err(SunPciError::InvalidConfig(format!(
                "memory_mb {} outside {}..={}",
                self.memory_mb, SUNPCI_MIN_MEMORY_MB, SUNPCI_MAX_MEMORY_MB
            )));
        }

        for (name, path) in [
            ("primary_disk", &self.primary_disk),
            ("secondary_disk", &self.secondary_disk),
            ("bios_path", &self.bios_path),
        ] {
            let Some(path) = path else { continue };
            if path.is_empty() {
                return Err(SunPciError::InvalidConfig(format!("{} is empty", name)));
            }
            if path.len() >= SUNPCI_MAX_PATH {
                return Err(SunPciError::InvalidConfig(format!(
                    "{} exceeds {} bytes",
                    name,
                    SUNPCI_MAX_PATH - 1
                )));
            }
            if path.contains('\0') {
                return Err(SunPciError::InvalidConfig(format!("{} contains NUL", name)));
            }
        }
        Ok(())
    }

    pub fn to_wire(&self) -> Result<IoctlSessionConfig> {
        self.validate()?;

        let mut wire = IoctlSessionConfig {
            memory_mb: self.memory_mb,
            flags: self.flags.bits(),
            ..Default::default()
        };
        if let Some(path) = &self.primary_disk {
            wire.primary_disk = ioctl::encode_path(path)?;
        }
        if let Some(path) = &self.secondary_disk {
            wire.secondary_disk = ioctl::encode_path(path)?;
        }
        if let Some(path) = &self.bios_path {
            wire.bios_path = ioctl::encode_path(path)?;
        }
        Ok(wire)
    }
}

/// Runtime statistics reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStats {
    pub cpu_usage_percent_x100: u32,
    pub memory_used_bytes: u64,
    pub uptime_ns: u64,
    pub disk_activity_bitmap: u32,
    pub rx_packets: u32,
    pub tx_packets: u32,
}

impl From<&SessionStatus> for SessionStats {
    fn from(status: &SessionStatus) -> Self {
        Self {
            cpu_usage_percent_x100: status.cpu_usage,
            memory_used_bytes: status.memory_used(),
            uptime_ns: status.uptime_ns(),
            disk_activity_bitmap: status.disk_activity,
            rx_packets: status.network_rx_packets,
            tx_packets: status.network_tx_packets,
        }
    }
}

/// Point-in-time copy of the session returned by [`SessionController::get_status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub stats: SessionStats,
    pub diagnostic: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Starting,
    Started,
    Stopping,
    Stopped,
    Faulted,
}

/// Receives session transitions.
///
/// Callbacks run on the thread that performed the transition, after the
/// session lock is released. They must not start, stop or reset the session.
pub trait SessionObserver: Send + Sync {
    fn on_session_event(&self, event: SessionEvent, epoch: u64);
}

#[derive(Debug, Default)]
struct Session {
    state: SessionState,
    config: SessionConfig,
    stats: SessionStats,
    diagnostic: Option<String>,
    last_error: Option<SunPciError>,
    epoch: u64,
}

pub struct SessionController {
    channel: DeviceChannel,
    /// Serializes start/stop/reset.
    transition: Mutex<()>,
    session: Mutex<Session>,
    observers: Mutex<Vec<Weak<dyn SessionObserver>>>,
}

impl SessionController {
    pub fn new(channel: DeviceChannel) -> Arc<Self> {
        Arc::new(Self {
            channel,
            transition: Mutex::new(()),
            session: Mutex::new(Session::default()),
            observers: Mutex::new(Vec::new()),
        })
    }

    pub fn channel(&self) -> &DeviceChannel {
        &self.channel
    }

    /// Register for transition events.
    ///
    /// `Started` is delivered in subscription order; every other event in
    /// reverse order, so the last subscriber is the first to tear down.
    pub fn subscribe(&self, observer: Weak<dyn SessionObserver>) {
        lock(&self.observers).push(observer);
    }

    pub fn state(&self) -> SessionState {
        lock(&self.session).state
    }

    pub fn config(&self) -> SessionConfig {
        lock(&self.session).config.clone()
    }

    pub fn stats(&self) -> SessionStats {
        lock(&self.session).stats
    }

    pub fn epoch(&self) -> u64 {
        lock(&self.session).epoch
    }

    /// Current epoch, if the session is running.
    pub fn running_epoch(&self) -> Option<u64> {
        let session = lock(&self.session);
        (session.state == SessionState::Running).then_some(session.epoch)
    }

    /// True while the session that produced `epoch` is still running.
    pub fn is_current(&self, epoch: u64) -> bool {
        let session = lock(&self.session);
        session.state == SessionState::Running && session.epoch == epoch
    }

    pub fn diagnostic(&self) -> Option<String> {
        lock(&self.session).diagnostic.clone()
    }

    pub fn last_error(&self) -> Option<SunPciError> {
        lock(&self.session).last_error.clone()
    }

    /// Start a session from `Stopped`.
    pub fn start(&self, config: SessionConfig) -> Result<()> {
        let _transition = lock(&self.transition);

        let current = self.state();
        if current != SessionState::Stopped {
            return Err(self.reject(format!("cannot start a session that is {}", current)));
        }
        let wire = match config.to_wire() {
            Ok(wire) => wire,
            Err(e) => return Err(self.record(e)),
        };

        info!(
            "Starting session: {} MB, flags {:#x}",
            config.memory_mb,
            config.flags.bits()
        );
        {
            let mut session = lock(&self.session);
            session.config = config;
            session.stats = SessionStats::default();
            session.diagnostic = None;
        }
        let epoch = self.enter(SessionState::Starting);
        self.notify(SessionEvent::Starting, epoch);

        match self.channel.execute(Request::StartSession(Box::new(wire))) {
            Ok(_) => self.finish_start(),
            Err(e) => Err(self.fail_transition("START_SESSION", e)),
        }
    }

    /// Stop a running or faulted session.
    ///
    /// From `Error` the stop request is best effort and the session always
    /// ends up `Stopped`.
    pub fn stop(&self) -> Result<()> {
        let _transition = lock(&self.transition);

        match self.state() {
            SessionState::Running => {
                info!("Stopping session");
                let epoch = self.enter(SessionState::Stopping);
                self.notify(SessionEvent::Stopping, epoch);

                match self.channel.execute(Request::StopSession) {
                    Ok(_) => {
                        let epoch = self.enter(SessionState::Stopped);
                        info!("Session stopped");
                        self.notify(SessionEvent::Stopped, epoch);
                        Ok(())
                    }
                    Err(e) => Err(self.fail_transition("STOP_SESSION", e)),
                }
            }
            SessionState::Error => {
                info!("Stopping faulted session");
                if let Err(e) = self.channel.execute(Request::StopSession) {
                    warn!("STOP_SESSION after fault failed: {}", e);
                    self.record(e);
                }
                let epoch = self.enter(SessionState::Stopped);
                self.notify(SessionEvent::Stopped, epoch);
                Ok(())
            }
            other => Err(self.reject(format!("cannot stop a session that is {}", other))),
        }
    }

    /// Re-initialize a running guest without a full stop.
    pub fn reset(&self) -> Result<()> {
        let _transition = lock(&self.transition);

        let current = self.state();
        if current != SessionState::Running {
            return Err(self.reject(format!("cannot reset a session that is {}", current)));
        }

        info!("Resetting session");
        let epoch = self.enter(SessionState::Starting);
        self.notify(SessionEvent::Starting, epoch);

        match self.channel.execute(Request::ResetSession) {
            Ok(_) => self.finish_start(),
            Err(e) => Err(self.fail_transition("RESET_SESSION", e)),
        }
    }

    /// Force the session into `Error` from any state.
    pub fn fault(&self, reason: impl Into<String>) {
        self.force_error(None, reason.into(), None);
    }

    /// Force `Error` on behalf of a poller, but only if the session that
    /// produced `epoch` is still running. Returns whether it took effect.
    pub fn escalate(&self, epoch: u64, reason: impl Into<String>, err: SunPciError) -> bool {
        self.force_error(Some(epoch), reason.into(), Some(err))
    }

    /// Refresh statistics while running; otherwise return the cached copy.
    pub fn get_status(&self) -> Result<SessionSnapshot> {
        let Some(epoch) = self.running_epoch() else {
            return Ok(self.snapshot());
        };

        let status = match self.channel.execute(Request::GetStatus) {
            Ok(Response::Status(status)) => status,
            Ok(other) => return Err(self.record(unexpected_response("GET_STATUS", &other))),
            Err(e) => return Err(self.record(e)),
        };

        let reported = SessionState::from_driver(status.state);
        if reported != Some(SessionState::Running) {
            debug!("Driver reports session state {:?}", reported);
        }

        let mut session = lock(&self.session);
        if session.state == SessionState::Running && session.epoch == epoch {
            session.stats = SessionStats::from(&status);
        }
        Ok(SessionSnapshot {
            state: session.state,
            stats: session.stats,
            diagnostic: session.diagnostic.clone(),
        })
    }

    pub fn driver_version(&self) -> Result<DriverVersion> {
        match self.channel.execute(Request::GetVersion) {
            Ok(Response::Version(version)) => Ok(version),
            Ok(other) => Err(self.record(unexpected_response("GET_VERSION", &other))),
            Err(e) => Err(self.record(e)),
        }
    }

    /// Forward an already translated key event to the guest.
    pub fn send_key(&self, event: KeyEvent) -> Result<()> {
        self.require_running("keyboard input")?;
        self.channel.execute(Request::KeyboardEvent(event)).map(|_| ())
    }

    /// Forward a relative mouse event to the guest.
    pub fn send_mouse(&self, event: MouseEvent) -> Result<()> {
        self.require_running("mouse input")?;
        self.channel.execute(Request::MouseEvent(event)).map(|_| ())
    }

    fn require_running(&self, what: &str) -> Result<()> {
        let state = self.state();
        if state == SessionState::Running {
            Ok(())
        } else {
            Err(SunPciError::StateConflict(format!(
                "{} requires a running session (session is {})",
                what, state
            )))
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        let session = lock(&self.session);
        SessionSnapshot {
            state: session.state,
            stats: session.stats,
            diagnostic: session.diagnostic.clone(),
        }
    }

    /// Complete start/reset once the driver acknowledged.
    fn finish_start(&self) -> Result<()> {
        let epoch = {
            let mut session = lock(&self.session);
            if session.state != SessionState::Starting {
                let err = SunPciError::StateConflict(format!(
                    "session became {} while starting",
                    session.state
                ));
                session.last_error = Some(err.clone());
                return Err(err);
            }
            session.state = SessionState::Running;
            session.epoch += 1;
            session.epoch
        };
        info!("Session running");
        self.notify(SessionEvent::Started, epoch);
        Ok(())
    }

    fn fail_transition(&self, request: &str, err: SunPciError) -> SunPciError {
        let reason = format!("{} failed: {}", request, err);
        self.force_error(None, reason, Some(err.clone()));
        err
    }

    fn force_error(&self, epoch: Option<u64>, reason: String, err: Option<SunPciError>) -> bool {
        let epoch = {
            let mut session = lock(&self.session);
            if let Some(expected) = epoch {
                if session.state != SessionState::Running || session.epoch != expected {
                    debug!("Ignoring stale escalation: {}", reason);
                    return false;
                }
            }
            if let Some(err) = err {
                session.last_error = Some(err);
            }
            if session.state == SessionState::Error {
                return false;
            }
            error!("Session fault: {}", reason);
            session.state = SessionState::Error;
            session.diagnostic = Some(reason);
            session.epoch += 1;
            session.epoch
        };
        self.notify(SessionEvent::Faulted, epoch);
        true
    }

    fn enter(&self, state: SessionState) -> u64 {
        let mut session = lock(&self.session);
        debug!("Session {} -> {}", session.state, state);
        session.state = state;
        session.epoch += 1;
        session.epoch
    }

    fn reject(&self, message: String) -> SunPciError {
        warn!("{}", message);
        self.record(SunPciError::StateConflict(message))
    }

    fn record(&self, err: SunPciError) -> SunPciError {
        lock(&self.session).last_error = Some(err.clone());
        err
    }

    fn notify(&self, event: SessionEvent, epoch: u64) {
        let mut observers: Vec<Arc<dyn SessionObserver>> = {
            let mut registered = lock(&self.observers);
            registered.retain(|observer| observer.strong_count() > 0);
            registered.iter().filter_map(Weak::upgrade).collect()
        };
        if event != SessionEvent::Started {
            observers.reverse();
        }
        for observer in observers {
            observer.on_session_event(event, epoch);
        }
    }
}
