//! Clipboard exchange between host and guest.
//!
//! Host-to-guest transfers are pushed when the presentation layer reports a
//! host clipboard change; guest-to-host transfers are polled. Payloads are
//! passed through in their original format.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use sunpci_common::ioctl::{clipboard_format, Clipboard, SUNPCI_MAX_CLIPBOARD};
use sunpci_common::{Request, Response, Result, SunPciError};
use tracing::{debug, trace, warn};

use crate::channel::{unexpected_response, DeviceChannel};
use crate::controllers::{report_poll_failure, subscribe};
use crate::fault::PollHealth;
use crate::lock;
use crate::scheduler::{PeriodicTask, Subsystem};
use crate::session::{SessionController, SessionEvent, SessionObserver, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClipboardFormat {
    /// 8-bit text in the guest code page
    Text,
    /// UTF-16LE
    Unicode,
}

impl ClipboardFormat {
    fn to_wire(self) -> u32 {
        match self {
            ClipboardFormat::Text => clipboard_format::TEXT,
            ClipboardFormat::Unicode => clipboard_format::UNICODE,
        }
    }

    fn from_wire(format: u32) -> Result<Self> {
        match format {
            clipboard_format::TEXT => Ok(ClipboardFormat::Text),
            clipboard_format::UNICODE => Ok(ClipboardFormat::Unicode),
            other => Err(SunPciError::InvalidArgument(format!(
                "unknown clipboard format {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClipboardPayload {
    pub format: ClipboardFormat,
    pub bytes: Vec<u8>,
}

impl ClipboardPayload {
    pub fn new(format: ClipboardFormat, bytes: Vec<u8>) -> Self {
        Self { format, bytes }
    }

    /// Plain text payload from UTF-8 bytes.
    pub fn text(text: &str) -> Self {
        Self::new(ClipboardFormat::Text, text.as_bytes().to_vec())
    }

    /// UTF-16LE payload with a two-byte terminator, as Windows guests expect.
    pub fn unicode(text: &str) -> Self {
        let mut bytes = encode_utf16le(text);
        bytes.extend_from_slice(&[0, 0]);
        Self::new(ClipboardFormat::Unicode, bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Lossy text rendering, for display purposes only.
    pub fn to_text(&self) -> String {
        match self.format {
            ClipboardFormat::Unicode => decode_utf16le(&self.bytes),
            ClipboardFormat::Text => String::from_utf8_lossy(&self.bytes)
                .trim_end_matches('\0')
                .to_string(),
        }
    }

    fn check_size(len: usize) -> Result<()> {
        if len > SUNPCI_MAX_CLIPBOARD {
            return Err(SunPciError::ResourceLimit(format!(
                "clipboard payload of {} bytes exceeds {}",
                len, SUNPCI_MAX_CLIPBOARD
            )));
        }
        Ok(())
    }

    fn to_wire(&self) -> Result<Box<Clipboard>> {
        Self::check_size(self.bytes.len())?;
        let mut clipboard = Box::new(Clipboard::default());
        clipboard.length = self.bytes.len() as u32;
        clipboard.format = self.format.to_wire();
        clipboard.data[..self.bytes.len()].copy_from_slice(&self.bytes);
        Ok(clipboard)
    }

    fn from_wire(clipboard: &Clipboard) -> Result<Self> {
        let len = clipboard.length as usize;
        Self::check_size(len)?;
        let format = ClipboardFormat::from_wire(clipboard.format)?;
        Ok(Self::new(format, clipboard.data[..len].to_vec()))
    }

    fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Encode text as UTF-16LE without a terminator.
pub fn encode_utf16le(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Decode UTF-16LE bytes, stopping at the first NUL code unit.
pub fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
        .take_while(|&unit| unit != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

#[derive(Debug, Default)]
struct Exchange {
    epoch: Option<u64>,
    last_host: Option<u64>,
    last_guest: Option<u64>,
    pending_for_host: Option<ClipboardPayload>,
    host_to_guest: u64,
    guest_to_host: u64,
}

pub struct ClipboardSync {
    session: Arc<SessionController>,
    channel: DeviceChannel,
    to_guest: AtomicBool,
    to_host: AtomicBool,
    exchange: Mutex<Exchange>,
    health: Mutex<PollHealth>,
}

impl ClipboardSync {
    pub fn new(session: &Arc<SessionController>, fault_threshold: u32) -> Arc<Self> {
        let clipboard = Arc::new(Self {
            session: session.clone(),
            channel: session.channel().clone(),
            to_guest: AtomicBool::new(false),
            to_host: AtomicBool::new(false),
            exchange: Mutex::new(Exchange::default()),
            health: Mutex::new(PollHealth::new(fault_threshold)),
        });
        subscribe(session, &clipboard);
        clipboard
    }

    pub fn host_to_guest_enabled(&self) -> bool {
        self.to_guest.load(Ordering::SeqCst)
    }

    pub fn guest_to_host_enabled(&self) -> bool {
        self.to_host.load(Ordering::SeqCst)
    }

    /// Override the direction for the running session.
    pub fn set_host_to_guest(&self, enabled: bool) {
        self.to_guest.store(enabled, Ordering::SeqCst);
    }

    pub fn set_guest_to_host(&self, enabled: bool) {
        self.to_host.store(enabled, Ordering::SeqCst);
    }

    /// Transfers completed in this session as `(host_to_guest, guest_to_host)`.
    pub fn transfer_counts(&self) -> (u64, u64) {
        let exchange = lock(&self.exchange);
        (exchange.host_to_guest, exchange.guest_to_host)
    }

    pub fn last_error(&self) -> Option<SunPciError> {
        lock(&self.health).last_error().cloned()
    }

    /// Push a host clipboard change to the guest.
    ///
    /// Returns `Ok(false)` when the direction is disabled or the payload is
    /// unchanged since the last push.
    pub fn push_to_guest(&self, payload: &ClipboardPayload) -> Result<bool> {
        let wire = match payload.to_wire() {
            Ok(wire) => wire,
            Err(e) => {
                warn!("Clipboard push rejected: {}", e);
                lock(&self.health).note_error(e.clone());
                return Err(e);
            }
        };
        if !self.host_to_guest_enabled() {
            trace!("Host to guest clipboard disabled");
            return Ok(false);
        }
        let Some(epoch) = self.session.running_epoch() else {
            let err = SunPciError::StateConflict(format!(
                "clipboard push requires a running session (session is {})",
                self.session.state()
            ));
            lock(&self.health).note_error(err.clone());
            return Err(err);
        };

        let fingerprint = payload.fingerprint();
        if lock(&self.exchange).last_host == Some(fingerprint) {
            trace!("Host clipboard unchanged");
            return Ok(false);
        }

        if let Err(e) = self.channel.execute(Request::SetClipboard(wire)) {
            lock(&self.health).note_error(e.clone());
            return Err(e);
        }

        let mut exchange = lock(&self.exchange);
        if exchange.epoch == Some(epoch) {
            exchange.last_host = Some(fingerprint);
            exchange.host_to_guest += 1;
        }
        debug!("Sent {} bytes of clipboard to guest", payload.len());
        Ok(true)
    }

    /// Latest guest clipboard change not yet handed to the host.
    pub fn take_guest_update(&self) -> Option<ClipboardPayload> {
        lock(&self.exchange).pending_for_host.take()
    }

    fn poll(&self, epoch: u64) -> Result<()> {
        let clipboard = match self.channel.execute(Request::GetClipboard) {
            Ok(Response::Clipboard(clipboard)) => clipboard,
            Ok(other) => return Err(unexpected_response("GET_CLIPBOARD", &other)),
            // the driver reports an empty guest clipboard this way
            Err(SunPciError::IoFault(Errno::EAGAIN | Errno::ENODATA)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let payload = match ClipboardPayload::from_wire(&clipboard) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Discarding guest clipboard: {}", e);
                lock(&self.health).note_error(e);
                return Ok(());
            }
        };
        if payload.is_empty() {
            return Ok(());
        }

        let fingerprint = payload.fingerprint();
        let mut exchange = lock(&self.exchange);
        if exchange.epoch != Some(epoch) || !self.session.is_current(epoch) {
            trace!("Discarding clipboard poll from a previous session");
            return Ok(());
        }
        if exchange.last_guest == Some(fingerprint) {
            return Ok(());
        }
        exchange.last_guest = Some(fingerprint);
        if exchange.last_host == Some(fingerprint) {
            trace!("Guest clipboard echoes the last host push");
            return Ok(());
        }

        debug!("Guest clipboard changed: {} bytes", payload.len());
        exchange.pending_for_host = Some(payload);
        exchange.guest_to_host += 1;
        Ok(())
    }
}

impl PeriodicTask for ClipboardSync {
    fn tick(&self) {
        if !self.guest_to_host_enabled() {
            return;
        }
        let Some(epoch) = self.session.running_epoch() else {
            return;
        };
        match self.poll(epoch) {
            Ok(()) => lock(&self.health).record_success(),
            Err(e) => report_poll_failure(&self.session, &self.health, Subsystem::Clipboard, epoch, e),
        }
    }
}

impl SessionObserver for ClipboardSync {
    fn on_session_event(&self, event: SessionEvent, epoch: u64) {
        let mut exchange = lock(&self.exchange);
        *exchange = Exchange::default();
        if event != SessionEvent::Started || self.session.state() != SessionState::Running {
            return;
        }

        let flags = self.session.config().flags;
        self.to_guest.store(flags.clipboard_to_guest(), Ordering::SeqCst);
        self.to_host.store(flags.clipboard_to_host(), Ordering::SeqCst);
        exchange.epoch = Some(epoch);
        lock(&self.health).reset();
        debug!(
            "Clipboard sharing: to guest {}, to host {}",
            flags.clipboard_to_guest(),
            flags.clipboard_to_host()
        );
    }
}
