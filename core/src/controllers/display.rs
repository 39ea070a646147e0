//! Guest framebuffer synchronization.
//!
//! On session start the display controller queries the guest display mode
//! and framebuffer descriptor and maps the described region read-only. Each
//! tick polls the display mode alongside the pixels; a changed mode causes
//! the descriptor to be re-queried and, if it moved, the region remapped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use sunpci_common::ioctl::{display_flags, DisplayConfig, DisplayInfo, FramebufferInfo, PixelFormat};
use sunpci_common::{
    DisplaySettings, FramebufferMap, Request, Response, Result, ScalingMode, SunPciError,
};
use tracing::{debug, info, trace};

use crate::channel::{unexpected_response, DeviceChannel};
use crate::controllers::{report_poll_failure, subscribe};
use crate::fault::PollHealth;
use crate::lock;
use crate::scheduler::{PeriodicTask, Subsystem};
use crate::session::{SessionController, SessionEvent, SessionObserver, SessionState};

/// Copy of the guest framebuffer published for presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Monotonic across sessions.
    pub sequence: u64,
    pub info: DisplayInfo,
    pub format: PixelFormat,
    pub stride: u32,
    pub pixels: Vec<u8>,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.info.width
    }

    pub fn height(&self) -> u32 {
        self.info.height
    }

    /// Convert to tightly packed RGBA.
    ///
    /// Indexed8 is rendered as grayscale since the palette is not exposed.
    /// Returns `None` when the pixel buffer is too small for the geometry.
    pub fn to_rgba(&self) -> Option<Vec<u8>> {
        let width = self.info.width as usize;
        let height = self.info.height as usize;
        let stride = self.stride as usize;
        let bpp = self.format.bytes_per_pixel();
        let row_bytes = width.checked_mul(bpp)?;

        if width == 0 || height == 0 || stride < row_bytes {
            return None;
        }
        let needed = (height - 1).checked_mul(stride)?.checked_add(row_bytes)?;
        if self.pixels.len() < needed {
            return None;
        }

        let mut rgba = vec![0u8; width * height * 4];
        for (y, dst_row) in rgba.chunks_exact_mut(width * 4).enumerate() {
            let src_row = &self.pixels[y * stride..y * stride + row_bytes];
            for (src, dst) in src_row.chunks_exact(bpp).zip(dst_row.chunks_exact_mut(4)) {
                let [r, g, b] = match self.format {
                    PixelFormat::Indexed8 => [src[0]; 3],
                    PixelFormat::Rgb565 => {
                        let pixel = u16::from_le_bytes([src[0], src[1]]);
                        let r = ((pixel >> 11) & 0x1F) as u8;
                        let g = ((pixel >> 5) & 0x3F) as u8;
                        let b = (pixel & 0x1F) as u8;
                        [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]
                    }
                    // BGR byte order
                    PixelFormat::Rgb888 => [src[2], src[1], src[0]],
                    // little-endian 0x00RRGGBB
                    PixelFormat::Xrgb8888 => [src[2], src[1], src[0]],
                };
                dst.copy_from_slice(&[r, g, b, 255]);
            }
        }
        Some(rgba)
    }
}

/// Presentation hints for the driver from the stored display settings.
pub fn presentation_config(settings: &DisplaySettings) -> DisplayConfig {
    let (scale_mode, scale_factor) = match settings.scaling_mode {
        ScalingMode::None => (0, 1),
        ScalingMode::Fit => (1, 1),
        ScalingMode::Integer(factor) => (2, factor.max(1)),
    };
    let mut flags = 0;
    if settings.maintain_aspect_ratio {
        flags |= display_flags::MAINTAIN_ASPECT;
    }
    if settings.scanline_effect {
        flags |= display_flags::SCANLINES;
    }
    DisplayConfig {
        scale_mode,
        scale_factor,
        flags,
    }
}

struct Mapped {
    epoch: u64,
    info: DisplayInfo,
    descriptor: FramebufferInfo,
    format: PixelFormat,
    mapping: Box<dyn FramebufferMap>,
}

pub struct DisplaySync {
    session: Arc<SessionController>,
    channel: DeviceChannel,
    /// Taken out by a tick while it copies; a stale tick drops it.
    mapped: Mutex<Option<Mapped>>,
    geometry: Mutex<Option<(DisplayInfo, FramebufferInfo)>>,
    latest: Mutex<Option<Arc<Frame>>>,
    sequence: AtomicU64,
    mode_changes: AtomicU64,
    health: Mutex<PollHealth>,
}

impl DisplaySync {
    pub fn new(session: &Arc<SessionController>, fault_threshold: u32) -> Arc<Self> {
        let display = Arc::new(Self {
            session: session.clone(),
            channel: session.channel().clone(),
            mapped: Mutex::new(None),
            geometry: Mutex::new(None),
            latest: Mutex::new(None),
            sequence: AtomicU64::new(0),
            mode_changes: AtomicU64::new(0),
            health: Mutex::new(PollHealth::new(fault_threshold)),
        });
        subscribe(session, &display);
        display
    }

    pub fn display_info(&self) -> Option<DisplayInfo> {
        lock(&self.geometry).map(|(info, _)| info)
    }

    pub fn framebuffer(&self) -> Option<FramebufferInfo> {
        lock(&self.geometry).map(|(_, descriptor)| descriptor)
    }

    /// Most recent frame of the running session.
    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        lock(&self.latest).clone()
    }

    pub fn is_mapped(&self) -> bool {
        lock(&self.geometry).is_some()
    }

    pub fn mode_changes(&self) -> u64 {
        self.mode_changes.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<SunPciError> {
        lock(&self.health).last_error().cloned()
    }

    /// Send scaling and effect hints to the driver.
    pub fn set_presentation(&self, config: DisplayConfig) -> Result<()> {
        let state = self.session.state();
        if state != SessionState::Running {
            let err = SunPciError::StateConflict(format!(
                "display settings require a running session (session is {})",
                state
            ));
            lock(&self.health).note_error(err.clone());
            return Err(err);
        }
        self.channel
            .execute(Request::SetDisplay(config))
            .map(|_| ())
            .inspect_err(|e| lock(&self.health).note_error(e.clone()))
    }

    fn query_display(&self) -> Result<DisplayInfo> {
        match self.channel.execute(Request::GetDisplay)? {
            Response::Display(info) => Ok(info),
            other => Err(unexpected_response("GET_DISPLAY", &other)),
        }
    }

    fn query_framebuffer(&self) -> Result<FramebufferInfo> {
        match self.channel.execute(Request::GetFramebuffer)? {
            Response::Framebuffer(descriptor) => Ok(descriptor),
            other => Err(unexpected_response("GET_FRAMEBUFFER", &other)),
        }
    }

    fn map(&self, descriptor: &FramebufferInfo) -> Result<(PixelFormat, Box<dyn FramebufferMap>)> {
        let format = PixelFormat::try_from(descriptor.format)?;
        let len = usize::try_from(descriptor.size()).map_err(|_| {
            SunPciError::InvalidArgument(format!(
                "framebuffer of {} bytes cannot be mapped",
                descriptor.size()
            ))
        })?;
        let mapping = self.channel.map_framebuffer(len)?;
        Ok((format, mapping))
    }

    fn initialize(&self, epoch: u64) -> Result<Mapped> {
        let info = self.query_display()?;
        let descriptor = self.query_framebuffer()?;
        let (format, mapping) = self.map(&descriptor)?;
        info!(
            "Framebuffer mapped: {}x{} {:?}, stride {}, {} bytes",
            info.width,
            info.height,
            format,
            descriptor.stride,
            descriptor.size()
        );
        Ok(Mapped {
            epoch,
            info,
            descriptor,
            format,
            mapping,
        })
    }

    fn refresh(&self, mapped: &mut Mapped) -> Result<Frame> {
        let info = self.query_display()?;
        if info != mapped.info {
            self.mode_changes.fetch_add(1, Ordering::Relaxed);
            info!(
                "Guest display mode changed: {}x{}, depth {}, {}",
                info.width,
                info.height,
                info.color_depth,
                if info.is_text_mode() { "text" } else { "graphics" }
            );
            let descriptor = self.query_framebuffer()?;
            if descriptor != mapped.descriptor {
                let (format, mapping) = self.map(&descriptor)?;
                debug!("Remapped framebuffer: {} bytes", descriptor.size());
                mapped.descriptor = descriptor;
                mapped.format = format;
                mapped.mapping = mapping;
            }
            mapped.info = info;
        }

        let visible = (mapped.descriptor.stride as usize).saturating_mul(info.height as usize);
        let len = match visible {
            0 => mapped.mapping.len(),
            n => n.min(mapped.mapping.len()),
        };
        let mut pixels = vec![0u8; len];
        let copied = mapped.mapping.copy_to(&mut pixels);
        pixels.truncate(copied);

        Ok(Frame {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
            info,
            format: mapped.format,
            stride: mapped.descriptor.stride,
            pixels,
        })
    }

    /// Store `mapped` back if its session is still running, else release it.
    fn commit(&self, mapped: Mapped, frame: Option<Frame>) -> bool {
        let mut slot = lock(&self.mapped);
        if !self.session.is_current(mapped.epoch) {
            trace!("Dropping framebuffer state from a previous session");
            return false;
        }
        *lock(&self.geometry) = Some((mapped.info, mapped.descriptor));
        if let Some(frame) = frame {
            *lock(&self.latest) = Some(Arc::new(frame));
        }
        *slot = Some(mapped);
        true
    }

    fn deactivate(&self) {
        let released = lock(&self.mapped).take();
        *lock(&self.geometry) = None;
        *lock(&self.latest) = None;
        if released.is_some() {
            info!("Released framebuffer mapping");
        }
    }
}

impl PeriodicTask for DisplaySync {
    fn tick(&self) {
        let Some(epoch) = self.session.running_epoch() else {
            return;
        };

        let taken = lock(&self.mapped).take();
        let mut mapped = match taken {
            Some(mapped) if mapped.epoch == epoch => mapped,
            _ => match self.initialize(epoch) {
                Ok(mapped) => mapped,
                Err(e) => {
                    report_poll_failure(&self.session, &self.health, Subsystem::Display, epoch, e);
                    return;
                }
            },
        };

        match self.refresh(&mut mapped) {
            Ok(frame) => {
                trace!("Published frame {}", frame.sequence);
                if self.commit(mapped, Some(frame)) {
                    lock(&self.health).record_success();
                }
            }
            Err(e) => {
                self.commit(mapped, None);
                report_poll_failure(&self.session, &self.health, Subsystem::Display, epoch, e);
            }
        }
    }
}

impl SessionObserver for DisplaySync {
    fn on_session_event(&self, event: SessionEvent, epoch: u64) {
        if event != SessionEvent::Started {
            self.deactivate();
            return;
        }

        lock(&self.health).reset();
        match self.initialize(epoch) {
            Ok(mapped) => {
                self.commit(mapped, None);
            }
            Err(e) => report_poll_failure(&self.session, &self.health, Subsystem::Display, epoch, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sunpci_common::ioctl::display_mode;

    fn frame(format: PixelFormat, width: u32, height: u32, stride: u32, pixels: Vec<u8>) -> Frame {
        Frame {
            sequence: 1,
            info: DisplayInfo {
                width,
                height,
                color_depth: 8,
                mode: display_mode::GRAPHICS,
                ..Default::default()
            },
            format,
            stride,
            pixels,
        }
    }

    #[test]
    fn test_rgb565_conversion() {
        // pure red, pure green
        let pixels = [0x00, 0xF8, 0xE0, 0x07].to_vec();
        let rgba = frame(PixelFormat::Rgb565, 2, 1, 4, pixels).to_rgba().unwrap();
        assert_eq!(rgba, vec![255, 0, 0, 255, 0, 255, 0, 255]);
    }

    #[test]
    fn test_rgb888_is_bgr() {
        let rgba = frame(PixelFormat::Rgb888, 1, 1, 3, vec![1, 2, 3]).to_rgba().unwrap();
        assert_eq!(rgba, vec![3, 2, 1, 255]);
    }

    #[test]
    fn test_xrgb8888_and_stride_padding() {
        let mut pixels = vec![0u8; 8 * 2];
        pixels[0..4].copy_from_slice(&0x00112233u32.to_le_bytes());
        pixels[8..12].copy_from_slice(&0x00445566u32.to_le_bytes());
        let rgba = frame(PixelFormat::Xrgb8888, 1, 2, 8, pixels).to_rgba().unwrap();
        assert_eq!(rgba, vec![0x11, 0x22, 0x33, 255, 0x44, 0x55, 0x66, 255]);
    }

    #[test]
    fn test_indexed_is_grayscale() {
        let rgba = frame(PixelFormat::Indexed8, 2, 1, 2, vec![7, 200]).to_rgba().unwrap();
        assert_eq!(rgba, vec![7, 7, 7, 255, 200, 200, 200, 255]);
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        assert!(frame(PixelFormat::Indexed8, 4, 4, 4, vec![0; 15]).to_rgba().is_none());
        assert!(frame(PixelFormat::Rgb888, 4, 1, 8, vec![0; 16]).to_rgba().is_none());
    }

    #[test]
    fn test_presentation_config() {
        let settings = DisplaySettings {
            scaling_mode: ScalingMode::Integer(3),
            maintain_aspect_ratio: true,
            scanline_effect: true,
        };
        let config = presentation_config(&settings);
        assert_eq!((config.scale_mode, config.scale_factor), (2, 3));
        assert_eq!(config.flags, display_flags::MAINTAIN_ASPECT | display_flags::SCANLINES);
    }
}
