//! Interface to the SunPCi kernel driver.
//!
//! [`DeviceBackend`] is the seam between the control channel and whatever
//! answers its requests. [`DriverHandle`] is the real implementation over
//! `/dev/sunpci0`; tests substitute an in-memory backend.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr;

use nix::errno::Errno;

use crate::ioctl::{
    AudioBuffer, AudioFormat, AudioStatus, AudioVolume, Clipboard, DisplayInfo, DriverVersion,
    FramebufferInfo, NetworkStatus, SessionStatus, sunpci_add_drive_map, sunpci_eject_cdrom,
    sunpci_eject_floppy, sunpci_get_audio_format, sunpci_get_audio_status,
    sunpci_get_audio_volume, sunpci_get_clipboard, sunpci_get_display, sunpci_get_framebuffer,
    sunpci_get_network, sunpci_get_status, sunpci_get_version, sunpci_keyboard_event,
    sunpci_mount_cdrom, sunpci_mount_disk, sunpci_mount_floppy, sunpci_mouse_event,
    sunpci_read_audio, sunpci_remove_drive_map, sunpci_reset_session, sunpci_set_audio_volume,
    sunpci_set_clipboard, sunpci_set_display, sunpci_set_network, sunpci_start_session,
    sunpci_stop_session, sunpci_unmount_disk,
};
use crate::request::{Request, Response};
use crate::types::{Result, SunPciError};

pub const DEVICE_PATH: &str = "/dev/sunpci0";

/// mmap page offset selecting the framebuffer region (BAR2)
const MMAP_FRAMEBUFFER_PGOFF: libc::off_t = 0;

/// Check if the SunPCi driver is loaded
pub fn is_driver_loaded() -> bool {
    std::path::Path::new(DEVICE_PATH).exists()
}

/// Something that executes catalog requests synchronously.
///
/// Implementations are driven from a single thread at a time; the control
/// channel guarantees there is never more than one request in flight.
pub trait DeviceBackend: Send {
    fn submit(&mut self, request: &Request) -> Result<Response>;

    /// Map `len` bytes of the guest framebuffer for reading.
    fn map_framebuffer(&mut self, len: usize) -> Result<Box<dyn FramebufferMap>>;
}

/// Read-only view of guest video memory.
pub trait FramebufferMap: Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy as much of the region as fits into `dst`, returning the count.
    fn copy_to(&self, dst: &mut [u8]) -> usize;
}

/// Handle to the SunPCi device.
///
/// Only one instance should be active at a time since the hardware
/// is single-user (one display, one keyboard/mouse, one set of drives).
pub struct DriverHandle {
    file: File,
}

impl DriverHandle {
    /// Open the default device node.
    pub fn open() -> Result<Self> {
        Self::open_path(DEVICE_PATH)
    }

    /// Open a specific device node.
    ///
    /// Requires read/write access; use udev rules to grant access to a
    /// 'sunpci' group.
    pub fn open_path(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| open_error(path, e))?;

        tracing::info!("Opened SunPCi device {}", path);
        Ok(Self { file })
    }

    fn fd(&self) -> i32 {
        self.file.as_raw_fd()
    }
}

fn open_error(path: &str, err: io::Error) -> SunPciError {
    match err.kind() {
        io::ErrorKind::NotFound => SunPciError::DriverNotLoaded,
        io::ErrorKind::PermissionDenied => SunPciError::PermissionDenied(path.to_string()),
        _ => SunPciError::IoFault(Errno::from_raw(err.raw_os_error().unwrap_or(libc::EIO))),
    }
}

impl DeviceBackend for DriverHandle {
    fn submit(&mut self, request: &Request) -> Result<Response> {
        let fd = self.fd();
        // SAFETY: every wrapper is generated from the uapi struct it passes,
        // and all pointers reference live, correctly-sized values.
        let response = unsafe {
            match request {
                Request::GetVersion => {
                    let mut version = DriverVersion::default();
                    sunpci_get_version(fd, &mut version)?;
                    Response::Version(version)
                }
                Request::GetStatus => {
                    let mut status = SessionStatus::default();
                    sunpci_get_status(fd, &mut status)?;
                    Response::Status(status)
                }
                Request::StartSession(config) => {
                    sunpci_start_session(fd, config.as_ref())?;
                    Response::Ack
                }
                Request::StopSession => {
                    sunpci_stop_session(fd)?;
                    Response::Ack
                }
                Request::ResetSession => {
                    sunpci_reset_session(fd)?;
                    Response::Ack
                }
                Request::GetDisplay => {
                    let mut info = DisplayInfo::default();
                    sunpci_get_display(fd, &mut info)?;
                    Response::Display(info)
                }
                Request::SetDisplay(config) => {
                    sunpci_set_display(fd, config)?;
                    Response::Ack
                }
                Request::GetFramebuffer => {
                    let mut info = FramebufferInfo::default();
                    sunpci_get_framebuffer(fd, &mut info)?;
                    Response::Framebuffer(info)
                }
                Request::MountDisk(mount) => {
                    sunpci_mount_disk(fd, mount.as_ref())?;
                    Response::Ack
                }
                Request::UnmountDisk(slot) => {
                    sunpci_unmount_disk(fd, slot)?;
                    Response::Ack
                }
                Request::MountCdrom(path) => {
                    sunpci_mount_cdrom(fd, path.as_ref())?;
                    Response::Ack
                }
                Request::EjectCdrom => {
                    sunpci_eject_cdrom(fd)?;
                    Response::Ack
                }
                Request::MountFloppy(mount) => {
                    sunpci_mount_floppy(fd, mount.as_ref())?;
                    Response::Ack
                }
                Request::EjectFloppy(slot) => {
                    sunpci_eject_floppy(fd, slot)?;
                    Response::Ack
                }
                Request::KeyboardEvent(event) => {
                    sunpci_keyboard_event(fd, event)?;
                    Response::Ack
                }
                Request::MouseEvent(event) => {
                    sunpci_mouse_event(fd, event)?;
                    Response::Ack
                }
                Request::SetClipboard(clipboard) => {
                    sunpci_set_clipboard(fd, clipboard.as_ref())?;
                    Response::Ack
                }
                Request::GetClipboard => {
                    let mut clipboard = Box::new(Clipboard::default());
                    sunpci_get_clipboard(fd, clipboard.as_mut())?;
                    Response::Clipboard(clipboard)
                }
                Request::AddDriveMap(mapping) => {
                    sunpci_add_drive_map(fd, mapping.as_ref())?;
                    Response::Ack
                }
                Request::RemoveDriveMap(letter) => {
                    sunpci_remove_drive_map(fd, letter)?;
                    Response::Ack
                }
                Request::SetNetwork(config) => {
                    sunpci_set_network(fd, config)?;
                    Response::Ack
                }
                Request::GetNetwork => {
                    let mut status = NetworkStatus::default();
                    sunpci_get_network(fd, &mut status)?;
                    Response::Network(status)
                }
                Request::GetAudioFormat => {
                    let mut format = AudioFormat::default();
                    sunpci_get_audio_format(fd, &mut format)?;
                    Response::AudioFormat(format)
                }
                Request::SetAudioVolume(volume) => {
                    sunpci_set_audio_volume(fd, volume)?;
                    Response::Ack
                }
                Request::GetAudioVolume => {
                    let mut volume = AudioVolume::default();
                    sunpci_get_audio_volume(fd, &mut volume)?;
                    Response::AudioVolume(volume)
                }
                Request::GetAudioStatus => {
                    let mut status = AudioStatus::default();
                    sunpci_get_audio_status(fd, &mut status)?;
                    Response::AudioStatus(status)
                }
                Request::ReadAudio { max_bytes } => {
                    // 16 KiB payload, keep it off the worker stack
                    let mut buffer = Box::new(AudioBuffer::default());
                    buffer.size = (*max_bytes).min(buffer.data.len() as u32);
                    sunpci_read_audio(fd, buffer.as_mut())?;
                    let bytes_read = (buffer.size as usize).min(buffer.data.len());
                    Response::AudioData(buffer.data[..bytes_read].to_vec())
                }
            }
        };
        Ok(response)
    }

    fn map_framebuffer(&mut self, len: usize) -> Result<Box<dyn FramebufferMap>> {
        Ok(Box::new(MmapFramebuffer::map(self.fd(), len)?))
    }
}

/// Read-only shared mapping of the framebuffer BAR.
///
/// The mapping is released when the value is dropped.
pub struct MmapFramebuffer {
    ptr: *const u8,
    len: usize,
}

// SAFETY: the mapping is PROT_READ and only ever read through `copy_to`;
// moving the owner between threads does not alias it.
unsafe impl Send for MmapFramebuffer {}

impl MmapFramebuffer {
    fn map(fd: i32, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(SunPciError::InvalidArgument(
                "framebuffer size is zero".to_string(),
            ));
        }

        // SAFETY: a fresh PROT_READ mapping at a kernel-chosen address.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                MMAP_FRAMEBUFFER_PGOFF,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(SunPciError::IoFault(Errno::last()));
        }

        tracing::debug!("Mapped framebuffer: {} bytes", len);
        Ok(Self {
            ptr: ptr as *const u8,
            len,
        })
    }
}

impl FramebufferMap for MmapFramebuffer {
    fn len(&self) -> usize {
        self.len
    }

    fn copy_to(&self, dst: &mut [u8]) -> usize {
        let count = dst.len().min(self.len);
        // SAFETY: `ptr` is valid for `len` bytes until drop.
        unsafe {
            ptr::copy_nonoverlapping(self.ptr, dst.as_mut_ptr(), count);
        }
        count
    }
}

impl Drop for MmapFramebuffer {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly the region returned by mmap.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
        tracing::debug!("Unmapped framebuffer: {} bytes", self.len);
    }
}
