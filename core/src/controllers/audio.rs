//! Guest audio playback status, sample draining and volume control.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use sunpci_common::ioctl::{AudioFormat, AudioStatus, AudioVolume, SUNPCI_AUDIO_MAX_BUFFER};
use sunpci_common::{Request, Response, Result, SunPciError};
use tracing::{debug, info, trace, warn};

use crate::channel::{unexpected_response, DeviceChannel};
use crate::controllers::{report_poll_failure, subscribe};
use crate::fault::PollHealth;
use crate::lock;
use crate::scheduler::{PeriodicTask, Subsystem};
use crate::session::{SessionController, SessionEvent, SessionObserver, SessionState};

/// Minimum capacity of the decoded sample queue, in samples.
const MIN_QUEUE_SAMPLES: usize = 8192;

/// Monotonic view of the device underrun counter.
///
/// The device counter restarts from zero when the audio hardware is reset;
/// a decrease is folded in as a fresh count rather than treated as an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnderrunCounter {
    last: Option<u32>,
    total: u64,
    resets: u32,
}

impl UnderrunCounter {
    /// Feed a reported count; returns true if it indicates a device reset.
    pub fn observe(&mut self, reported: u32) -> bool {
        let reset = match self.last {
            None => {
                self.total = reported as u64;
                false
            }
            Some(previous) if reported >= previous => {
                self.total += (reported - previous) as u64;
                false
            }
            Some(_) => {
                self.resets += 1;
                self.total += reported as u64;
                true
            }
        };
        self.last = Some(reported);
        reset
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn resets(&self) -> u32 {
        self.resets
    }
}

/// Decode raw guest PCM into signed 16-bit samples.
pub fn decode_samples(format: &AudioFormat, bytes: &[u8]) -> Vec<i16> {
    let wide = format.is_16bit() || format.bits_per_sample == 16;
    match (wide, format.is_signed()) {
        (true, true) => bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect(),
        (true, false) => bytes
            .chunks_exact(2)
            .map(|c| (u16::from_le_bytes([c[0], c[1]]) ^ 0x8000) as i16)
            .collect(),
        (false, true) => bytes.iter().map(|&b| (b as i8 as i16) * 256).collect(),
        (false, false) => bytes.iter().map(|&b| (b as i16 - 128) * 256).collect(),
    }
}

fn clamp_level(level: i32) -> u8 {
    level.clamp(0, 255) as u8
}

struct Active {
    epoch: u64,
    format: AudioFormat,
    status: Option<AudioStatus>,
    underruns: UnderrunCounter,
}

#[derive(Debug, Clone, Copy)]
struct VolumeState {
    current: AudioVolume,
    /// Changed while no session was running; pushed on the next start.
    pending: bool,
}

pub struct AudioController {
    session: Arc<SessionController>,
    channel: DeviceChannel,
    active: Mutex<Option<Active>>,
    volume: Mutex<VolumeState>,
    samples: Mutex<VecDeque<i16>>,
    dropped_samples: AtomicU64,
    health: Mutex<PollHealth>,
}

impl AudioController {
    pub fn new(session: &Arc<SessionController>, fault_threshold: u32) -> Arc<Self> {
        let audio = Arc::new(Self {
            session: session.clone(),
            channel: session.channel().clone(),
            active: Mutex::new(None),
            volume: Mutex::new(VolumeState {
                current: AudioVolume::new(255, 255, false),
                pending: false,
            }),
            samples: Mutex::new(VecDeque::new()),
            dropped_samples: AtomicU64::new(0),
            health: Mutex::new(PollHealth::new(fault_threshold)),
        });
        subscribe(session, &audio);
        audio
    }

    pub fn format(&self) -> Option<AudioFormat> {
        lock(&self.active).as_ref().map(|active| active.format)
    }

    pub fn status(&self) -> Option<AudioStatus> {
        lock(&self.active).as_ref().and_then(|active| active.status)
    }

    /// Underruns accumulated over the running session.
    pub fn underruns(&self) -> UnderrunCounter {
        lock(&self.active)
            .as_ref()
            .map(|active| active.underruns)
            .unwrap_or_default()
    }

    pub fn queued_samples(&self) -> usize {
        lock(&self.samples).len()
    }

    /// Samples discarded because the queue was full.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples.load(Ordering::Relaxed)
    }

    /// Take up to `max` decoded samples for the host output device.
    pub fn drain_samples(&self, max: usize) -> Vec<i16> {
        let mut samples = lock(&self.samples);
        let count = max.min(samples.len());
        samples.drain(..count).collect()
    }

    pub fn last_error(&self) -> Option<SunPciError> {
        lock(&self.health).last_error().cloned()
    }

    /// Cached volume, without touching the device.
    pub fn volume(&self) -> AudioVolume {
        lock(&self.volume).current
    }

    /// Read the volume from the device while running.
    pub fn get_volume(&self) -> Result<AudioVolume> {
        if self.session.state() != SessionState::Running {
            return Ok(self.volume());
        }
        let volume = self.query_volume().inspect_err(|e| self.note(e))?;
        let mut state = lock(&self.volume);
        if !state.pending {
            state.current = volume;
        }
        Ok(volume)
    }

    /// Set per-channel levels, clamped to 0..=255.
    ///
    /// Returns the levels actually applied. Outside a running session the
    /// levels are kept and pushed when the next session starts.
    pub fn set_volume(&self, left: i32, right: i32) -> Result<AudioVolume> {
        let muted = self.volume().is_muted();
        let volume = AudioVolume::new(clamp_level(left), clamp_level(right), muted);
        if volume.left as i32 != left || volume.right as i32 != right {
            debug!("Volume {}/{} clamped to {}/{}", left, right, volume.left, volume.right);
        }
        self.apply_volume(volume)?;
        Ok(volume)
    }

    /// Mute or unmute; repeating the current state sends nothing.
    pub fn set_muted(&self, muted: bool) -> Result<()> {
        let current = self.volume();
        if current.is_muted() == muted {
            return Ok(());
        }
        self.apply_volume(AudioVolume::new(current.left, current.right, muted))
    }

    /// Flip the mute state, returning the new state.
    pub fn toggle_mute(&self) -> Result<bool> {
        let muted = !self.volume().is_muted();
        self.set_muted(muted)?;
        Ok(muted)
    }

    fn apply_volume(&self, volume: AudioVolume) -> Result<()> {
        if self.session.state() != SessionState::Running {
            let mut state = lock(&self.volume);
            state.current = volume;
            state.pending = true;
            return Ok(());
        }

        self.channel
            .execute(Request::SetAudioVolume(volume))
            .inspect_err(|e| self.note(e))?;
        let mut state = lock(&self.volume);
        state.current = volume;
        state.pending = false;
        info!(
            "Audio volume: L={} R={}{}",
            volume.left,
            volume.right,
            if volume.is_muted() { " (muted)" } else { "" }
        );
        Ok(())
    }

    fn note(&self, err: &SunPciError) {
        lock(&self.health).note_error(err.clone());
    }

    fn query_format(&self) -> Result<AudioFormat> {
        match self.channel.execute(Request::GetAudioFormat)? {
            Response::AudioFormat(format) => Ok(format),
            other => Err(unexpected_response("GET_AUDIO_FORMAT", &other)),
        }
    }

    fn query_status(&self) -> Result<AudioStatus> {
        match self.channel.execute(Request::GetAudioStatus)? {
            Response::AudioStatus(status) => Ok(status),
            other => Err(unexpected_response("GET_AUDIO_STATUS", &other)),
        }
    }

    fn query_volume(&self) -> Result<AudioVolume> {
        match self.channel.execute(Request::GetAudioVolume)? {
            Response::AudioVolume(volume) => Ok(volume),
            other => Err(unexpected_response("GET_AUDIO_VOLUME", &other)),
        }
    }

    fn read_samples(&self, available: u32) -> Result<Vec<u8>> {
        let max_bytes = available.min(SUNPCI_AUDIO_MAX_BUFFER as u32);
        match self.channel.execute(Request::ReadAudio { max_bytes })? {
            Response::AudioData(bytes) => Ok(bytes),
            other => Err(unexpected_response("READ_AUDIO", &other)),
        }
    }

    fn current_format(&self, epoch: u64) -> Option<AudioFormat> {
        lock(&self.active)
            .as_ref()
            .filter(|active| active.epoch == epoch)
            .map(|active| active.format)
    }

    fn poll(&self, epoch: u64) -> Result<()> {
        let mut format = match self.current_format(epoch) {
            Some(format) => format,
            None => self.query_format()?,
        };

        let status = self.query_status()?;
        if status.sample_rate != 0 && status.sample_rate != format.sample_rate {
            format = self.query_format()?;
            info!(
                "Guest audio format: {} Hz, {} channels, {}-bit",
                format.sample_rate, format.channels, format.bits_per_sample
            );
        }

        let data = if status.is_available() && status.buffer_available > 0 {
            self.read_samples(status.buffer_available)?
        } else {
            Vec::new()
        };

        let mut active = lock(&self.active);
        if !self.session.is_current(epoch) {
            trace!("Discarding audio poll from a previous session");
            return Ok(());
        }
        let active = active.get_or_insert(Active {
            epoch,
            format,
            status: None,
            underruns: UnderrunCounter::default(),
        });
        active.format = format;
        active.status = Some(status);
        let previous = active.underruns.total();
        if active.underruns.observe(status.underruns) {
            info!(
                "Audio underrun counter restarted at {}, device was reset",
                status.underruns
            );
        } else if active.underruns.total() > previous {
            trace!("Audio underruns: {}", active.underruns.total());
        }

        if !data.is_empty() {
            self.enqueue(&format, &data);
        }
        Ok(())
    }

    fn enqueue(&self, format: &AudioFormat, data: &[u8]) {
        let decoded = decode_samples(format, data);
        let capacity = ((format.sample_rate as usize * format.channels.max(1) as usize) / 4)
            .max(MIN_QUEUE_SAMPLES);

        let mut samples = lock(&self.samples);
        samples.extend(decoded);
        if samples.len() > capacity {
            let overflow = samples.len() - capacity;
            samples.drain(..overflow);
            self.dropped_samples.fetch_add(overflow as u64, Ordering::Relaxed);
            trace!("Sample queue overflow, dropped {} samples", overflow);
        }
    }

    fn activate(&self, epoch: u64) -> Result<()> {
        let format = self.query_format()?;
        info!(
            "Guest audio format: {} Hz, {} channels, {}-bit",
            format.sample_rate, format.channels, format.bits_per_sample
        );

        let pending = {
            let state = lock(&self.volume);
            state.pending.then_some(state.current)
        };
        match pending {
            Some(volume) => {
                self.channel.execute(Request::SetAudioVolume(volume))?;
                lock(&self.volume).pending = false;
            }
            None => {
                let volume = self.query_volume()?;
                lock(&self.volume).current = volume;
            }
        }

        let mut active = lock(&self.active);
        if self.session.is_current(epoch) {
            *active = Some(Active {
                epoch,
                format,
                status: None,
                underruns: UnderrunCounter::default(),
            });
        }
        Ok(())
    }

    fn deactivate(&self) {
        if lock(&self.active).take().is_some() {
            debug!("Audio state discarded");
        }
        lock(&self.samples).clear();
    }
}

impl PeriodicTask for AudioController {
    fn tick(&self) {
        let Some(epoch) = self.session.running_epoch() else {
            return;
        };
        match self.poll(epoch) {
            Ok(()) => {
                if self.session.is_current(epoch) {
                    lock(&self.health).record_success();
                }
            }
            Err(e) => report_poll_failure(&self.session, &self.health, Subsystem::Audio, epoch, e),
        }
    }
}

impl SessionObserver for AudioController {
    fn on_session_event(&self, event: SessionEvent, epoch: u64) {
        if event != SessionEvent::Started {
            self.deactivate();
            return;
        }
        lock(&self.health).reset();
        if let Err(e) = self.activate(epoch) {
            warn!("Audio initialization failed: {}", e);
            report_poll_failure(&self.session, &self.health, Subsystem::Audio, epoch, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sunpci_common::ioctl::audio_format;

    #[test]
    fn test_underrun_decrease_is_a_reset() {
        let mut counter = UnderrunCounter::default();
        assert!(!counter.observe(3));
        assert!(!counter.observe(5));
        assert_eq!(counter.total(), 5);

        assert!(counter.observe(1));
        assert_eq!(counter.total(), 6);
        assert_eq!(counter.resets(), 1);

        assert!(!counter.observe(1));
        assert_eq!(counter.total(), 6);
    }

    #[test]
    fn test_clamp_level() {
        assert_eq!(clamp_level(300), 255);
        assert_eq!(clamp_level(-5), 0);
        assert_eq!(clamp_level(128), 128);
    }

    #[test]
    fn test_decode_unsigned_8bit() {
        let format = AudioFormat {
            sample_rate: 22050,
            format: 0,
            channels: 1,
            bits_per_sample: 8,
        };
        assert_eq!(decode_samples(&format, &[0, 128, 255]), vec![-32768, 0, 32512]);
    }

    #[test]
    fn test_decode_signed_16bit() {
        let format = AudioFormat {
            sample_rate: 44100,
            format: audio_format::FMT_16BIT | audio_format::FMT_SIGNED | audio_format::FMT_STEREO,
            channels: 2,
            bits_per_sample: 16,
        };
        let bytes = [0x00, 0x80, 0xff, 0x7f, 0x01];
        assert_eq!(decode_samples(&format, &bytes), vec![i16::MIN, i16::MAX]);
    }
}
