//! ioctl definitions that mirror the kernel driver interface.
//!
//! These definitions must stay in sync with driver/include/uapi/sunpci_ioctl.h.
//! 64-bit quantities are carried as explicit lo/hi u32 pairs so every
//! structure has the same size and offsets on 32-bit and 64-bit hosts.

use nix::ioctl_none;
use nix::ioctl_read;
use nix::ioctl_readwrite;
use nix::ioctl_write_ptr;

use crate::types::{Result, SunPciError};

/// Magic number for SunPCi ioctls
pub const SUNPCI_IOC_MAGIC: u8 = b'S';

/// Maximum path length including the terminator (must match kernel)
pub const SUNPCI_MAX_PATH: usize = 256;

/// Maximum clipboard size (must match kernel, must fit in ioctl ~8KB max)
pub const SUNPCI_MAX_CLIPBOARD: usize = 4096;

/// Maximum number of simultaneous drive mappings (must match kernel)
pub const SUNPCI_MAX_DRIVE_MAPS: usize = 24;

/// Maximum audio buffer size for single ioctl read
pub const SUNPCI_AUDIO_MAX_BUFFER: usize = 16384;

/// Host interface name length including the terminator
pub const SUNPCI_IFNAME_LEN: usize = 32;

/// Guest memory bounds accepted by START_SESSION, in MiB
pub const SUNPCI_MIN_MEMORY_MB: u32 = 1;
pub const SUNPCI_MAX_MEMORY_MB: u32 = 256;

// ============================================================================
// ioctl Command Numbers
// ============================================================================

pub mod cmd {
    // Session management
    pub const GET_VERSION: u8 = 0;
    pub const GET_STATUS: u8 = 1;
    pub const START_SESSION: u8 = 2;
    pub const STOP_SESSION: u8 = 3;
    pub const RESET_SESSION: u8 = 4;

    // Display
    pub const GET_DISPLAY: u8 = 10;
    pub const SET_DISPLAY: u8 = 11;
    pub const GET_FRAMEBUFFER: u8 = 12;

    // Storage
    pub const MOUNT_DISK: u8 = 20;
    pub const UNMOUNT_DISK: u8 = 21;
    pub const MOUNT_CDROM: u8 = 22;
    pub const EJECT_CDROM: u8 = 23;
    pub const MOUNT_FLOPPY: u8 = 24;
    pub const EJECT_FLOPPY: u8 = 25;

    // Input
    pub const KEYBOARD_EVENT: u8 = 30;
    pub const MOUSE_EVENT: u8 = 31;

    // Clipboard
    pub const SET_CLIPBOARD: u8 = 40;
    pub const GET_CLIPBOARD: u8 = 41;

    // Filesystem redirection
    pub const ADD_DRIVE_MAP: u8 = 50;
    pub const REMOVE_DRIVE_MAP: u8 = 51;

    // Network
    pub const SET_NETWORK: u8 = 60;
    pub const GET_NETWORK: u8 = 61;

    // Audio
    pub const GET_AUDIO_FORMAT: u8 = 70;
    pub const SET_AUDIO_VOLUME: u8 = 71;
    pub const GET_AUDIO_VOLUME: u8 = 72;
    pub const GET_AUDIO_STATUS: u8 = 73;
    pub const READ_AUDIO: u8 = 74;
}

// ============================================================================
// Encoding helpers
// ============================================================================

/// Split a 64-bit value into its (lo, hi) halves.
pub fn split_u64(value: u64) -> (u32, u32) {
    (value as u32, (value >> 32) as u32)
}

/// Rebuild a 64-bit value from its lo/hi halves.
pub fn join_u64(lo: u32, hi: u32) -> u64 {
    ((hi as u64) << 32) | (lo as u64)
}

/// Encode a host path into a fixed, NUL-terminated buffer.
///
/// Paths that do not fit (including the terminator) or contain an interior
/// NUL are rejected instead of being truncated.
pub fn encode_path(src: &str) -> Result<[u8; SUNPCI_MAX_PATH]> {
    let mut dest = [0u8; SUNPCI_MAX_PATH];
    encode_cstr(&mut dest, src)?;
    Ok(dest)
}

/// Copy `src` into a NUL-terminated fixed buffer.
pub fn encode_cstr(dest: &mut [u8], src: &str) -> Result<()> {
    let bytes = src.as_bytes();
    if bytes.contains(&0) {
        return Err(SunPciError::InvalidArgument(format!(
            "embedded NUL in {:?}",
            src
        )));
    }
    if bytes.len() >= dest.len() {
        return Err(SunPciError::InvalidConfig(format!(
            "{} bytes exceeds the {}-byte limit: {}",
            bytes.len(),
            dest.len() - 1,
            src
        )));
    }
    dest.fill(0);
    dest[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Decode a NUL-terminated fixed buffer.
pub fn decode_cstr(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

// ============================================================================
// Data Structures (must match kernel structs exactly)
// ============================================================================

/// Driver version information
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl std::fmt::Display for DriverVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Session state as reported by the driver
pub mod session_state {
    pub const STOPPED: u32 = 0;
    pub const STARTING: u32 = 1;
    pub const RUNNING: u32 = 2;
    pub const STOPPING: u32 = 3;
    pub const ERROR: u32 = 4;
}

/// Session status
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: u32,
    pub cpu_usage: u32,      // percent * 100 (0-10000)
    pub memory_used_lo: u32, // bytes (low 32 bits)
    pub memory_used_hi: u32, // bytes (high 32 bits)
    pub uptime_ns_lo: u32,   // nanoseconds (low 32 bits)
    pub uptime_ns_hi: u32,   // nanoseconds (high 32 bits)
    pub disk_activity: u32,  // bitmap of active drives
    pub network_rx_packets: u32,
    pub network_tx_packets: u32,
    pub _pad: u32,           // pad to 8-byte alignment
}

impl SessionStatus {
    pub fn memory_used(&self) -> u64 {
        join_u64(self.memory_used_lo, self.memory_used_hi)
    }

    pub fn set_memory_used(&mut self, bytes: u64) {
        (self.memory_used_lo, self.memory_used_hi) = split_u64(bytes);
    }

    pub fn uptime_ns(&self) -> u64 {
        join_u64(self.uptime_ns_lo, self.uptime_ns_hi)
    }

    pub fn set_uptime_ns(&mut self, ns: u64) {
        (self.uptime_ns_lo, self.uptime_ns_hi) = split_u64(ns);
    }
}

/// Session configuration flags
pub mod flags {
    pub const NETWORK_ENABLED: u32 = 1 << 0;
    pub const CLIPBOARD_ENABLED: u32 = 1 << 1;
    pub const CLIPBOARD_TO_HOST: u32 = 1 << 2;
    pub const CLIPBOARD_TO_GUEST: u32 = 1 << 3;
}

/// Session configuration for starting (ioctl version)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoctlSessionConfig {
    pub memory_mb: u32,
    pub flags: u32,
    pub primary_disk: [u8; SUNPCI_MAX_PATH],
    pub secondary_disk: [u8; SUNPCI_MAX_PATH],
    pub bios_path: [u8; SUNPCI_MAX_PATH],
}

impl Default for IoctlSessionConfig {
    fn default() -> Self {
        Self {
            memory_mb: 64,
            flags: 0,
            primary_disk: [0; SUNPCI_MAX_PATH],
            secondary_disk: [0; SUNPCI_MAX_PATH],
            bios_path: [0; SUNPCI_MAX_PATH],
        }
    }
}

/// Display mode values
pub mod display_mode {
    pub const TEXT: u32 = 0;
    pub const GRAPHICS: u32 = 1;
}

/// Display information (from guest)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayInfo {
    pub width: u32,
    pub height: u32,
    pub color_depth: u32,    // 1, 2, 4, 8, 15, 16, 24, 32
    pub mode: u32,           // display_mode::*
    pub text_cols: u32,      // for text mode
    pub text_rows: u32,      // for text mode
}

impl DisplayInfo {
    pub fn is_text_mode(&self) -> bool {
        self.mode == display_mode::TEXT
    }
}

/// Display configuration flags
pub mod display_flags {
    pub const MAINTAIN_ASPECT: u32 = 1 << 0;
    pub const SCANLINES: u32 = 1 << 1;
}

/// Display configuration (host presentation)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayConfig {
    pub scale_mode: u32,     // 0=none, 1=fit, 2=integer
    pub scale_factor: u32,   // for integer scaling
    pub flags: u32,
}

/// Pixel format
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    #[default]
    Indexed8 = 0,
    Rgb565 = 1,
    Rgb888 = 2,
    Xrgb8888 = 3,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Indexed8 => 1,
            PixelFormat::Rgb565 => 2,
            PixelFormat::Rgb888 => 3,
            PixelFormat::Xrgb8888 => 4,
        }
    }
}

impl TryFrom<u32> for PixelFormat {
    type Error = SunPciError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(PixelFormat::Indexed8),
            1 => Ok(PixelFormat::Rgb565),
            2 => Ok(PixelFormat::Rgb888),
            3 => Ok(PixelFormat::Xrgb8888),
            other => Err(SunPciError::InvalidArgument(format!(
                "unknown pixel format {}",
                other
            ))),
        }
    }
}

/// Framebuffer information
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramebufferInfo {
    pub phys_addr_lo: u32,   // physical address (low 32 bits)
    pub phys_addr_hi: u32,   // physical address (high 32 bits)
    pub size_lo: u32,        // buffer size (low 32 bits)
    pub size_hi: u32,        // buffer size (high 32 bits)
    pub stride: u32,         // bytes per row
    pub format: u32,         // PixelFormat
}

impl FramebufferInfo {
    pub fn phys_addr(&self) -> u64 {
        join_u64(self.phys_addr_lo, self.phys_addr_hi)
    }

    pub fn size(&self) -> u64 {
        join_u64(self.size_lo, self.size_hi)
    }

    pub fn new(phys_addr: u64, size: u64, stride: u32, format: PixelFormat) -> Self {
        let (phys_addr_lo, phys_addr_hi) = split_u64(phys_addr);
        let (size_lo, size_hi) = split_u64(size);
        Self {
            phys_addr_lo,
            phys_addr_hi,
            size_lo,
            size_hi,
            stride,
            format: format as u32,
        }
    }
}

/// Disk mount flags
pub mod disk_flags {
    pub const READONLY: u32 = 1 << 0;
    pub const CREATE: u32 = 1 << 1;
}

/// Disk mount request
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskMount {
    pub slot: u32,           // 0=primary, 1=secondary
    pub flags: u32,
    pub path: [u8; SUNPCI_MAX_PATH],
}

impl Default for DiskMount {
    fn default() -> Self {
        Self {
            slot: 0,
            flags: 0,
            path: [0; SUNPCI_MAX_PATH],
        }
    }
}

/// Disk slot identifier
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskSlot {
    pub slot: u32,
}

/// Path for CD-ROM
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Path {
    pub path: [u8; SUNPCI_MAX_PATH],
}

impl Default for Path {
    fn default() -> Self {
        Self {
            path: [0; SUNPCI_MAX_PATH],
        }
    }
}

/// Floppy mount request
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FloppyMount {
    pub drive: u32,          // 0=A, 1=B
    pub flags: u32,
    pub path: [u8; SUNPCI_MAX_PATH],
}

impl Default for FloppyMount {
    fn default() -> Self {
        Self {
            drive: 0,
            flags: 0,
            path: [0; SUNPCI_MAX_PATH],
        }
    }
}

/// Floppy slot identifier
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FloppySlot {
    pub drive: u32,
}

/// Key event flags
pub mod key_flags {
    pub const PRESSED: u32 = 1 << 0;
    pub const EXTENDED: u32 = 1 << 1;
}

/// Keyboard event
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyEvent {
    pub scancode: u32,       // XT scancode
    pub flags: u32,
}

/// Mouse button flags
pub mod mouse_buttons {
    pub const LEFT: u32 = 1 << 0;
    pub const RIGHT: u32 = 1 << 1;
    pub const MIDDLE: u32 = 1 << 2;
}

/// Mouse event
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MouseEvent {
    pub dx: i32,             // relative X movement
    pub dy: i32,             // relative Y movement
    pub dz: i32,             // wheel movement
    pub buttons: u32,        // button state bitmap
}

/// Clipboard format
pub mod clipboard_format {
    pub const TEXT: u32 = 0;
    pub const UNICODE: u32 = 1;
}

/// Clipboard data (variable size, up to SUNPCI_MAX_CLIPBOARD)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clipboard {
    pub length: u32,
    pub format: u32,
    pub data: [u8; SUNPCI_MAX_CLIPBOARD],
}

impl Default for Clipboard {
    fn default() -> Self {
        Self {
            length: 0,
            format: 0,
            data: [0; SUNPCI_MAX_CLIPBOARD],
        }
    }
}

/// Drive mapping flags
pub mod drive_flags {
    pub const READONLY: u8 = 1 << 0;
    pub const HIDDEN: u8 = 1 << 1;
}

/// Drive mapping
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveMapping {
    pub letter: u8,          // 'E' through 'Z'
    pub flags: u8,
    pub reserved: u16,
    pub path: [u8; SUNPCI_MAX_PATH],
}

impl Default for DriveMapping {
    fn default() -> Self {
        Self {
            letter: 0,
            flags: 0,
            reserved: 0,
            path: [0; SUNPCI_MAX_PATH],
        }
    }
}

/// Drive letter for unmapping
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriveLetter {
    pub letter: u8,
    pub _pad: [u8; 3],
}

/// Network flags
pub mod net_flags {
    pub const ENABLED: u32 = 1 << 0;
    pub const PROMISCUOUS: u32 = 1 << 1;
}

/// Network configuration
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkConfig {
    pub flags: u32,
    pub interface: [u8; SUNPCI_IFNAME_LEN], // host interface name
    pub mac_address: [u8; 6],
    pub reserved: u16,
}

/// Network status
///
/// `_pad` keeps the byte counters at offset 16, where the 64-bit kernel
/// layout puts its `__u64` fields.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStatus {
    pub flags: u32,
    pub rx_packets: u32,
    pub tx_packets: u32,
    pub _pad: u32,
    pub rx_bytes_lo: u32,
    pub rx_bytes_hi: u32,
    pub tx_bytes_lo: u32,
    pub tx_bytes_hi: u32,
}

impl NetworkStatus {
    pub fn rx_bytes(&self) -> u64 {
        join_u64(self.rx_bytes_lo, self.rx_bytes_hi)
    }

    pub fn tx_bytes(&self) -> u64 {
        join_u64(self.tx_bytes_lo, self.tx_bytes_hi)
    }

    pub fn set_rx_bytes(&mut self, bytes: u64) {
        (self.rx_bytes_lo, self.rx_bytes_hi) = split_u64(bytes);
    }

    pub fn set_tx_bytes(&mut self, bytes: u64) {
        (self.tx_bytes_lo, self.tx_bytes_hi) = split_u64(bytes);
    }
}

// ============================================================================
// Audio Structures
// ============================================================================

/// Audio format flags
pub mod audio_format {
    pub const FMT_16BIT: u32 = 1 << 0;   // 16-bit samples (vs 8-bit)
    pub const FMT_STEREO: u32 = 1 << 1;  // Stereo (vs mono)
    pub const FMT_SIGNED: u32 = 1 << 2;  // Signed (vs unsigned)
}

/// Audio status flags
pub mod audio_status_flags {
    pub const PLAYING: u32 = 1 << 0;     // Playback active
    pub const AVAILABLE: u32 = 1 << 1;   // Audio hardware present
    pub const MUTED: u32 = 1 << 2;       // Output muted
}

/// Audio format information
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,        // Sample rate in Hz (e.g., 44100)
    pub format: u32,             // Format flags (audio_format::*)
    pub channels: u32,           // Number of channels (1=mono, 2=stereo)
    pub bits_per_sample: u32,    // Bits per sample (8 or 16)
}

impl AudioFormat {
    /// Get bytes per sample (including all channels)
    pub fn bytes_per_sample(&self) -> u32 {
        (self.bits_per_sample / 8) * self.channels
    }

    /// Get bytes per second
    pub fn bytes_per_second(&self) -> u32 {
        self.sample_rate * self.bytes_per_sample()
    }

    pub fn is_16bit(&self) -> bool {
        self.format & audio_format::FMT_16BIT != 0
    }

    pub fn is_stereo(&self) -> bool {
        self.format & audio_format::FMT_STEREO != 0
    }

    pub fn is_signed(&self) -> bool {
        self.format & audio_format::FMT_SIGNED != 0
    }
}

/// Audio volume levels
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioVolume {
    pub left: u8,                // Left channel volume (0-255)
    pub right: u8,               // Right channel volume (0-255)
    pub muted: u8,               // Mute flag
    pub reserved: u8,            // Reserved for alignment
}

impl AudioVolume {
    pub fn new(left: u8, right: u8, muted: bool) -> Self {
        Self {
            left,
            right,
            muted: muted as u8,
            reserved: 0,
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted != 0
    }
}

/// Audio subsystem status
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioStatus {
    pub flags: u32,              // Status flags (audio_status_flags::*)
    pub sample_rate: u32,        // Current sample rate
    pub format: u32,             // Current format flags
    pub buffer_available: u32,   // Bytes of audio data available
    pub samples_played_lo: u32,  // Total samples played (low 32 bits)
    pub samples_played_hi: u32,  // Total samples played (high 32 bits)
    pub underruns: u32,          // Buffer underrun count
    pub reserved: u32,           // Reserved for alignment
}

impl AudioStatus {
    pub fn samples_played(&self) -> u64 {
        join_u64(self.samples_played_lo, self.samples_played_hi)
    }

    pub fn set_samples_played(&mut self, samples: u64) {
        (self.samples_played_lo, self.samples_played_hi) = split_u64(samples);
    }

    pub fn is_playing(&self) -> bool {
        self.flags & audio_status_flags::PLAYING != 0
    }

    pub fn is_available(&self) -> bool {
        self.flags & audio_status_flags::AVAILABLE != 0
    }

    pub fn is_muted(&self) -> bool {
        self.flags & audio_status_flags::MUTED != 0
    }
}

/// Audio buffer for reading samples
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AudioBuffer {
    pub size: u32,               // On input: max bytes. On output: bytes read.
    pub reserved: u32,
    pub data: [u8; SUNPCI_AUDIO_MAX_BUFFER],
}

impl Default for AudioBuffer {
    fn default() -> Self {
        Self {
            size: SUNPCI_AUDIO_MAX_BUFFER as u32,
            reserved: 0,
            data: [0; SUNPCI_AUDIO_MAX_BUFFER],
        }
    }
}

// ============================================================================
// ioctl Function Wrappers
// ============================================================================

// Session management
ioctl_read!(sunpci_get_version, SUNPCI_IOC_MAGIC, cmd::GET_VERSION, DriverVersion);
ioctl_read!(sunpci_get_status, SUNPCI_IOC_MAGIC, cmd::GET_STATUS, SessionStatus);
ioctl_write_ptr!(sunpci_start_session, SUNPCI_IOC_MAGIC, cmd::START_SESSION, IoctlSessionConfig);
ioctl_none!(sunpci_stop_session, SUNPCI_IOC_MAGIC, cmd::STOP_SESSION);
ioctl_none!(sunpci_reset_session, SUNPCI_IOC_MAGIC, cmd::RESET_SESSION);

// Display
ioctl_read!(sunpci_get_display, SUNPCI_IOC_MAGIC, cmd::GET_DISPLAY, DisplayInfo);
ioctl_write_ptr!(sunpci_set_display, SUNPCI_IOC_MAGIC, cmd::SET_DISPLAY, DisplayConfig);
ioctl_read!(sunpci_get_framebuffer, SUNPCI_IOC_MAGIC, cmd::GET_FRAMEBUFFER, FramebufferInfo);

// Storage
ioctl_write_ptr!(sunpci_mount_disk, SUNPCI_IOC_MAGIC, cmd::MOUNT_DISK, DiskMount);
ioctl_write_ptr!(sunpci_unmount_disk, SUNPCI_IOC_MAGIC, cmd::UNMOUNT_DISK, DiskSlot);
ioctl_write_ptr!(sunpci_mount_cdrom, SUNPCI_IOC_MAGIC, cmd::MOUNT_CDROM, Path);
ioctl_none!(sunpci_eject_cdrom, SUNPCI_IOC_MAGIC, cmd::EJECT_CDROM);
ioctl_write_ptr!(sunpci_mount_floppy, SUNPCI_IOC_MAGIC, cmd::MOUNT_FLOPPY, FloppyMount);
ioctl_write_ptr!(sunpci_eject_floppy, SUNPCI_IOC_MAGIC, cmd::EJECT_FLOPPY, FloppySlot);

// Input
ioctl_write_ptr!(sunpci_keyboard_event, SUNPCI_IOC_MAGIC, cmd::KEYBOARD_EVENT, KeyEvent);
ioctl_write_ptr!(sunpci_mouse_event, SUNPCI_IOC_MAGIC, cmd::MOUSE_EVENT, MouseEvent);

// Clipboard
ioctl_write_ptr!(sunpci_set_clipboard, SUNPCI_IOC_MAGIC, cmd::SET_CLIPBOARD, Clipboard);
ioctl_read!(sunpci_get_clipboard, SUNPCI_IOC_MAGIC, cmd::GET_CLIPBOARD, Clipboard);

// Filesystem redirection
ioctl_write_ptr!(sunpci_add_drive_map, SUNPCI_IOC_MAGIC, cmd::ADD_DRIVE_MAP, DriveMapping);
ioctl_write_ptr!(sunpci_remove_drive_map, SUNPCI_IOC_MAGIC, cmd::REMOVE_DRIVE_MAP, DriveLetter);

// Network
ioctl_write_ptr!(sunpci_set_network, SUNPCI_IOC_MAGIC, cmd::SET_NETWORK, NetworkConfig);
ioctl_read!(sunpci_get_network, SUNPCI_IOC_MAGIC, cmd::GET_NETWORK, NetworkStatus);

// Audio
ioctl_read!(sunpci_get_audio_format, SUNPCI_IOC_MAGIC, cmd::GET_AUDIO_FORMAT, AudioFormat);
ioctl_write_ptr!(sunpci_set_audio_volume, SUNPCI_IOC_MAGIC, cmd::SET_AUDIO_VOLUME, AudioVolume);
ioctl_read!(sunpci_get_audio_volume, SUNPCI_IOC_MAGIC, cmd::GET_AUDIO_VOLUME, AudioVolume);
ioctl_read!(sunpci_get_audio_status, SUNPCI_IOC_MAGIC, cmd::GET_AUDIO_STATUS, AudioStatus);
ioctl_readwrite!(sunpci_read_audio, SUNPCI_IOC_MAGIC, cmd::READ_AUDIO, AudioBuffer);

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn test_struct_sizes() {
        // Sizes are part of the ioctl numbers, so they must never drift
        assert_eq!(mem::size_of::<DriverVersion>(), 12);
        assert_eq!(mem::size_of::<SessionStatus>(), 40);
        assert_eq!(mem::size_of::<IoctlSessionConfig>(), 8 + 3 * SUNPCI_MAX_PATH);
        assert_eq!(mem::size_of::<DisplayInfo>(), 24);
        assert_eq!(mem::size_of::<FramebufferInfo>(), 24);
        assert_eq!(mem::size_of::<DiskMount>(), 264);
        assert_eq!(mem::size_of::<KeyEvent>(), 8);
        assert_eq!(mem::size_of::<MouseEvent>(), 16);
        assert_eq!(mem::size_of::<Clipboard>(), 8 + SUNPCI_MAX_CLIPBOARD);
        assert_eq!(mem::size_of::<DriveMapping>(), 260);
        assert_eq!(mem::size_of::<DriveLetter>(), 4);
        assert_eq!(mem::size_of::<NetworkConfig>(), 44);
        assert_eq!(mem::size_of::<NetworkStatus>(), 32);
        assert_eq!(mem::size_of::<AudioVolume>(), 4);
        assert_eq!(mem::size_of::<AudioStatus>(), 32);
    }

    #[test]
    fn test_network_status_offsets() {
        let status = NetworkStatus::default();
        let base = &status as *const _ as usize;
        assert_eq!(&status.rx_bytes_lo as *const _ as usize - base, 16);
        assert_eq!(&status.tx_bytes_lo as *const _ as usize - base, 24);
    }

    #[test]
    fn test_u64_halves_boundaries() {
        for value in [0u64, u32::MAX as u64, u64::MAX, 1 << 32] {
            let (lo, hi) = split_u64(value);
            assert_eq!(join_u64(lo, hi), value);

            let mut status = SessionStatus::default();
            status.set_memory_used(value);
            status.set_uptime_ns(value);
            assert_eq!(status.memory_used(), value);
            assert_eq!(status.uptime_ns(), value);

            let mut net = NetworkStatus::default();
            net.set_rx_bytes(value);
            net.set_tx_bytes(value);
            assert_eq!(net.rx_bytes(), value);
            assert_eq!(net.tx_bytes(), value);

            let mut audio = AudioStatus::default();
            audio.set_samples_played(value);
            assert_eq!(audio.samples_played(), value);

            let fb = FramebufferInfo::new(value, value, 0, PixelFormat::Xrgb8888);
            assert_eq!(fb.phys_addr(), value);
            assert_eq!(fb.size(), value);
        }
        assert_eq!(split_u64(u32::MAX as u64), (u32::MAX, 0));
    }

    #[test]
    fn test_encode_path() {
        let path = encode_path("/path/to/disk.img").unwrap();
        assert_eq!(&path[..18], b"/path/to/disk.img\0");
        assert_eq!(decode_cstr(&path), "/path/to/disk.img");

        let longest = "a".repeat(SUNPCI_MAX_PATH - 1);
        assert!(encode_path(&longest).is_ok());

        let too_long = "a".repeat(SUNPCI_MAX_PATH);
        assert!(matches!(encode_path(&too_long), Err(SunPciError::InvalidConfig(_))));
        assert!(matches!(encode_path("a\0b"), Err(SunPciError::InvalidArgument(_))));
    }

    #[test]
    fn test_pixel_format_conversion() {
        assert_eq!(PixelFormat::try_from(1).unwrap(), PixelFormat::Rgb565);
        assert_eq!(PixelFormat::Rgb888.bytes_per_pixel(), 3);
        assert!(PixelFormat::try_from(9).is_err());
    }
}
