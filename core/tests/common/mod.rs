//! Scriptable in-memory device shared by the integration tests.
//!
//! [`MockDevice`] answers every catalog request from plain state that the
//! test can edit, records the requests it receives, and can be told to
//! fail, stall, or block on a gate for a given request name.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use sunpci_common::ioctl::{
    audio_format, audio_status_flags, display_mode, session_state, AudioFormat, AudioStatus,
    AudioVolume, Clipboard, DisplayInfo, DriverVersion, FramebufferInfo, NetworkStatus,
    PixelFormat, SessionStatus,
};
use sunpci_common::{
    AppConfig, DeviceBackend, FramebufferMap, Request, Response, Result, SunPciError,
};
use sunpci_core::{DeviceChannel, SunPciHost};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Guest-visible state the mock reports.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub running: bool,
    pub status: SessionStatus,
    pub display: DisplayInfo,
    pub framebuffer: FramebufferInfo,
    pub audio_format: AudioFormat,
    pub audio_status: AudioStatus,
    pub audio_data: Vec<u8>,
    pub volume: AudioVolume,
    /// `None` makes GET_CLIPBOARD fail with EAGAIN, like an empty guest clipboard.
    pub clipboard: Option<Box<Clipboard>>,
    pub network: NetworkStatus,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            running: false,
            status: SessionStatus::default(),
            display: vga_graphics(640, 480),
            framebuffer: FramebufferInfo::new(0xE000_0000, 640 * 480, 640, PixelFormat::Indexed8),
            audio_format: AudioFormat {
                sample_rate: 22050,
                format: audio_format::FMT_16BIT | audio_format::FMT_SIGNED,
                channels: 1,
                bits_per_sample: 16,
            },
            audio_status: AudioStatus {
                flags: audio_status_flags::AVAILABLE,
                sample_rate: 22050,
                ..AudioStatus::default()
            },
            audio_data: Vec::new(),
            volume: AudioVolume::new(200, 200, false),
            clipboard: None,
            network: NetworkStatus::default(),
        }
    }
}

pub fn vga_graphics(width: u32, height: u32) -> DisplayInfo {
    DisplayInfo {
        width,
        height,
        color_depth: 8,
        mode: display_mode::GRAPHICS,
        text_cols: 0,
        text_rows: 0,
    }
}

/// Blocks a request until the test opens it.
#[derive(Default)]
pub struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[derive(Default)]
struct GateState {
    entered: bool,
    open: bool,
}

impl Gate {
    fn pass(&self) {
        let mut state = self.state.lock().unwrap();
        state.entered = true;
        self.changed.notify_all();
        while !state.open {
            state = self.changed.wait(state).unwrap();
        }
    }

    /// Wait until a request is blocked on the gate.
    pub fn wait_entered(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |state| !state.entered)
            .unwrap();
        state.entered
    }

    pub fn open(&self) {
        self.state.lock().unwrap().open = true;
        self.changed.notify_all();
    }
}

#[derive(Default)]
struct Script {
    /// One-shot failures: skip this many successful calls, then fail once.
    once: HashMap<&'static str, (usize, SunPciError)>,
    always: HashMap<&'static str, SunPciError>,
    delays: HashMap<&'static str, Duration>,
    gates: HashMap<&'static str, Arc<Gate>>,
}

struct Inner {
    state: Mutex<DeviceState>,
    script: Mutex<Script>,
    log: Mutex<Vec<Request>>,
    live_mappings: Arc<AtomicUsize>,
    total_mappings: AtomicUsize,
}

#[derive(Clone)]
pub struct MockDevice {
    inner: Arc<Inner>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(DeviceState::default()),
                script: Mutex::new(Script::default()),
                log: Mutex::new(Vec::new()),
                live_mappings: Arc::new(AtomicUsize::new(0)),
                total_mappings: AtomicUsize::new(0),
            }),
        }
    }

    pub fn channel(&self) -> DeviceChannel {
        self.channel_with_timeout(TEST_TIMEOUT)
    }

    pub fn channel_with_timeout(&self, timeout: Duration) -> DeviceChannel {
        DeviceChannel::with_backend(Box::new(self.clone()), timeout).unwrap()
    }

    pub fn host(&self, config: AppConfig) -> SunPciHost {
        SunPciHost::with_channel(config, self.channel()).unwrap()
    }

    pub fn edit<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        f(&mut self.inner.state.lock().unwrap())
    }

    pub fn fail_once(&self, name: &'static str, after: usize, err: SunPciError) {
        self.inner.script.lock().unwrap().once.insert(name, (after, err));
    }

    pub fn fail_always(&self, name: &'static str, err: SunPciError) {
        self.inner.script.lock().unwrap().always.insert(name, err);
    }

    pub fn clear_failures(&self) {
        let mut script = self.inner.script.lock().unwrap();
        script.once.clear();
        script.always.clear();
    }

    pub fn delay(&self, name: &'static str, delay: Duration) {
        self.inner.script.lock().unwrap().delays.insert(name, delay);
    }

    pub fn gate(&self, name: &'static str) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.inner
            .script
            .lock()
            .unwrap()
            .gates
            .insert(name, gate.clone());
        gate
    }

    pub fn requests(&self) -> Vec<Request> {
        self.inner.log.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.requests().iter().map(Request::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().iter().filter(|n| **n == name).count()
    }

    pub fn clear_log(&self) {
        self.inner.log.lock().unwrap().clear();
    }

    pub fn live_mappings(&self) -> usize {
        self.inner.live_mappings.load(Ordering::SeqCst)
    }

    pub fn total_mappings(&self) -> usize {
        self.inner.total_mappings.load(Ordering::SeqCst)
    }

    fn scripted_failure(&self, name: &'static str) -> Option<SunPciError> {
        let mut script = self.inner.script.lock().unwrap();
        if let Some(err) = script.always.get(name) {
            return Some(err.clone());
        }
        let fire = match script.once.get_mut(name) {
            Some((0, _)) => true,
            Some((remaining, _)) => {
                *remaining -= 1;
                false
            }
            None => false,
        };
        if fire {
            script.once.remove(name).map(|(_, err)| err)
        } else {
            None
        }
    }

    fn respond(&self, request: &Request) -> Result<Response> {
        let mut state = self.inner.state.lock().unwrap();
        let response = match request {
            Request::GetVersion => Response::Version(DriverVersion {
                major: 1,
                minor: 2,
                patch: 0,
            }),
            Request::GetStatus => {
                let mut status = state.status;
                status.state = if state.running {
                    session_state::RUNNING
                } else {
                    session_state::STOPPED
                };
                Response::Status(status)
            }
            Request::StartSession(_) | Request::ResetSession => {
                state.running = true;
                Response::Ack
            }
            Request::StopSession => {
                state.running = false;
                Response::Ack
            }
            Request::GetDisplay => Response::Display(state.display),
            Request::GetFramebuffer => Response::Framebuffer(state.framebuffer),
            Request::GetClipboard => match &state.clipboard {
                Some(clipboard) => Response::Clipboard(clipboard.clone()),
                None => return Err(SunPciError::IoFault(Errno::EAGAIN)),
            },
            Request::SetClipboard(clipboard) => {
                state.clipboard = Some(clipboard.clone());
                Response::Ack
            }
            Request::GetNetwork => Response::Network(state.network),
            Request::GetAudioFormat => Response::AudioFormat(state.audio_format),
            Request::GetAudioStatus => Response::AudioStatus(state.audio_status),
            Request::GetAudioVolume => Response::AudioVolume(state.volume),
            Request::SetAudioVolume(volume) => {
                state.volume = *volume;
                Response::Ack
            }
            Request::ReadAudio { max_bytes } => {
                let count = (*max_bytes as usize).min(state.audio_data.len());
                Response::AudioData(state.audio_data.drain(..count).collect())
            }
            _ => Response::Ack,
        };
        Ok(response)
    }
}

impl DeviceBackend for MockDevice {
    fn submit(&mut self, request: &Request) -> Result<Response> {
        let name = request.name();
        self.inner.log.lock().unwrap().push(request.clone());

        let (delay, gate) = {
            let script = self.inner.script.lock().unwrap();
            (script.delays.get(name).copied(), script.gates.get(name).cloned())
        };
        if let Some(gate) = gate {
            gate.pass();
        }
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        if let Some(err) = self.scripted_failure(name) {
            return Err(err);
        }
        self.respond(request)
    }

    fn map_framebuffer(&mut self, len: usize) -> Result<Box<dyn FramebufferMap>> {
        if let Some(err) = self.scripted_failure("MAP_FRAMEBUFFER") {
            return Err(err);
        }
        self.inner.live_mappings.fetch_add(1, Ordering::SeqCst);
        self.inner.total_mappings.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeFramebuffer {
            bytes: (0..len).map(|i| (i % 251) as u8).collect(),
            live: self.inner.live_mappings.clone(),
        }))
    }
}

struct FakeFramebuffer {
    bytes: Vec<u8>,
    live: Arc<AtomicUsize>,
}

impl FramebufferMap for FakeFramebuffer {
    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn copy_to(&self, dst: &mut [u8]) -> usize {
        let count = dst.len().min(self.bytes.len());
        dst[..count].copy_from_slice(&self.bytes[..count]);
        count
    }
}

impl Drop for FakeFramebuffer {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Configuration whose pollers stay idle unless a test drives them.
pub fn quiet_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.polling.display_ms = 60_000;
    config.polling.audio_ms = 60_000;
    config.polling.clipboard_ms = 60_000;
    config.polling.network_ms = 60_000;
    config
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
