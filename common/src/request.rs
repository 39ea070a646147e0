//! Typed request catalog for the device control channel.
//!
//! Every variant corresponds to exactly one ioctl in [`crate::ioctl::cmd`].
//! Payload bounds are checked by [`Request::validate`] before a request is
//! handed to a backend, so malformed requests never reach the driver.

use crate::ioctl::{
    AudioFormat, AudioStatus, AudioVolume, Clipboard, DiskMount, DiskSlot, DisplayConfig,
    DisplayInfo, DriveLetter, DriveMapping, DriverVersion, FloppyMount, FloppySlot,
    FramebufferInfo, IoctlSessionConfig, KeyEvent, MouseEvent, NetworkConfig, NetworkStatus,
    Path, SessionStatus, SUNPCI_AUDIO_MAX_BUFFER, SUNPCI_MAX_CLIPBOARD, SUNPCI_MAX_MEMORY_MB,
    SUNPCI_MIN_MEMORY_MB, clipboard_format, cmd,
};
use crate::types::{Result, SunPciError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    GetVersion,
    GetStatus,
    StartSession(Box<IoctlSessionConfig>),
    StopSession,
    ResetSession,

    GetDisplay,
    SetDisplay(DisplayConfig),
    GetFramebuffer,

    MountDisk(Box<DiskMount>),
    UnmountDisk(DiskSlot),
    MountCdrom(Box<Path>),
    EjectCdrom,
    MountFloppy(Box<FloppyMount>),
    EjectFloppy(FloppySlot),

    KeyboardEvent(KeyEvent),
    MouseEvent(MouseEvent),

    SetClipboard(Box<Clipboard>),
    GetClipboard,

    AddDriveMap(Box<DriveMapping>),
    RemoveDriveMap(DriveLetter),

    SetNetwork(NetworkConfig),
    GetNetwork,

    GetAudioFormat,
    SetAudioVolume(AudioVolume),
    GetAudioVolume,
    GetAudioStatus,
    ReadAudio { max_bytes: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Write-only requests acknowledge with no payload.
    Ack,
    Version(DriverVersion),
    Status(SessionStatus),
    Display(DisplayInfo),
    Framebuffer(FramebufferInfo),
    Clipboard(Box<Clipboard>),
    Network(NetworkStatus),
    AudioFormat(AudioFormat),
    AudioVolume(AudioVolume),
    AudioStatus(AudioStatus),
    AudioData(Vec<u8>),
}

impl Request {
    /// ioctl command number of this request.
    pub fn opcode(&self) -> u8 {
        match self {
            Request::GetVersion => cmd::GET_VERSION,
            Request::GetStatus => cmd::GET_STATUS,
            Request::StartSession(_) => cmd::START_SESSION,
            Request::StopSession => cmd::STOP_SESSION,
            Request::ResetSession => cmd::RESET_SESSION,
            Request::GetDisplay => cmd::GET_DISPLAY,
            Request::SetDisplay(_) => cmd::SET_DISPLAY,
            Request::GetFramebuffer => cmd::GET_FRAMEBUFFER,
            Request::MountDisk(_) => cmd::MOUNT_DISK,
            Request::UnmountDisk(_) => cmd::UNMOUNT_DISK,
            Request::MountCdrom(_) => cmd::MOUNT_CDROM,
            Request::EjectCdrom => cmd::EJECT_CDROM,
            Request::MountFloppy(_) => cmd::MOUNT_FLOPPY,
            Request::EjectFloppy(_) => cmd::EJECT_FLOPPY,
            Request::KeyboardEvent(_) => cmd::KEYBOARD_EVENT,
            Request::MouseEvent(_) => cmd::MOUSE_EVENT,
            Request::SetClipboard(_) => cmd::SET_CLIPBOARD,
            Request::GetClipboard => cmd::GET_CLIPBOARD,
            Request::AddDriveMap(_) => cmd::ADD_DRIVE_MAP,
            Request::RemoveDriveMap(_) => cmd::REMOVE_DRIVE_MAP,
            Request::SetNetwork(_) => cmd::SET_NETWORK,
            Request::GetNetwork => cmd::GET_NETWORK,
            Request::GetAudioFormat => cmd::GET_AUDIO_FORMAT,
            Request::SetAudioVolume(_) => cmd::SET_AUDIO_VOLUME,
            Request::GetAudioVolume => cmd::GET_AUDIO_VOLUME,
            Request::GetAudioStatus => cmd::GET_AUDIO_STATUS,
            Request::ReadAudio { .. } => cmd::READ_AUDIO,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::GetVersion => "GET_VERSION",
            Request::GetStatus => "GET_STATUS",
            Request::StartSession(_) => "START_SESSION",
            Request::StopSession => "STOP_SESSION",
            Request::ResetSession => "RESET_SESSION",
            Request::GetDisplay => "GET_DISPLAY",
            Request::SetDisplay(_) => "SET_DISPLAY",
            Request::GetFramebuffer => "GET_FRAMEBUFFER",
            Request::MountDisk(_) => "MOUNT_DISK",
            Request::UnmountDisk(_) => "UNMOUNT_DISK",
            Request::MountCdrom(_) => "MOUNT_CDROM",
            Request::EjectCdrom => "EJECT_CDROM",
            Request::MountFloppy(_) => "MOUNT_FLOPPY",
            Request::EjectFloppy(_) => "EJECT_FLOPPY",
            Request::KeyboardEvent(_) => "KEYBOARD_EVENT",
            Request::MouseEvent(_) => "MOUSE_EVENT",
            Request::SetClipboard(_) => "SET_CLIPBOARD",
            Request::GetClipboard => "GET_CLIPBOARD",
            Request::AddDriveMap(_) => "ADD_DRIVE_MAP",
            Request::RemoveDriveMap(_) => "REMOVE_DRIVE_MAP",
            Request::SetNetwork(_) => "SET_NETWORK",
            Request::GetNetwork => "GET_NETWORK",
            Request::GetAudioFormat => "GET_AUDIO_FORMAT",
            Request::SetAudioVolume(_) => "SET_AUDIO_VOLUME",
            Request::GetAudioVolume => "GET_AUDIO_VOLUME",
            Request::GetAudioStatus => "GET_AUDIO_STATUS",
            Request::ReadAudio { .. } => "READ_AUDIO",
        }
    }

    /// Check documented payload bounds without touching the device.
    pub fn validate(&self) -> Result<()> {
        match self {
            Request::StartSession(config) => {
                if !(SUNPCI_MIN_MEMORY_MB..=SUNPCI_MAX_MEMORY_MB).contains(&config.memory_mb) {
                    return Err(invalid(format!("memory_mb {} out of range", config.memory_mb)));
                }
                for path in [&config.primary_disk, &config.secondary_disk, &config.bios_path] {
                    check_terminated(path)?;
                }
            }
            Request::MountDisk(mount) => {
                if mount.slot > 1 {
                    return Err(invalid(format!("disk slot {}", mount.slot)));
                }
                check_terminated(&mount.path)?;
            }
            Request::UnmountDisk(slot) if slot.slot > 1 => {
                return Err(invalid(format!("disk slot {}", slot.slot)));
            }
            Request::MountCdrom(path) => check_terminated(&path.path)?,
            Request::MountFloppy(mount) => {
                if mount.drive > 1 {
                    return Err(invalid(format!("floppy drive {}", mount.drive)));
                }
                check_terminated(&mount.path)?;
            }
            Request::EjectFloppy(slot) if slot.drive > 1 => {
                return Err(invalid(format!("floppy drive {}", slot.drive)));
            }
            Request::SetClipboard(clipboard) => {
                if clipboard.length as usize > SUNPCI_MAX_CLIPBOARD {
                    return Err(invalid(format!(
                        "clipboard length {} exceeds {}",
                        clipboard.length, SUNPCI_MAX_CLIPBOARD
                    )));
                }
                if clipboard.format != clipboard_format::TEXT
                    && clipboard.format != clipboard_format::UNICODE
                {
                    return Err(invalid(format!("clipboard format {}", clipboard.format)));
                }
            }
            Request::AddDriveMap(mapping) => {
                check_drive_letter(mapping.letter)?;
                check_terminated(&mapping.path)?;
            }
            Request::RemoveDriveMap(letter) => check_drive_letter(letter.letter)?,
            Request::SetNetwork(config) => check_terminated(&config.interface)?,
            Request::ReadAudio { max_bytes } => {
                if *max_bytes as usize > SUNPCI_AUDIO_MAX_BUFFER {
                    return Err(invalid(format!(
                        "audio read of {} bytes exceeds {}",
                        max_bytes, SUNPCI_AUDIO_MAX_BUFFER
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn invalid(message: String) -> SunPciError {
    SunPciError::InvalidArgument(message)
}

fn check_terminated(buf: &[u8]) -> Result<()> {
    if buf.contains(&0) {
        Ok(())
    } else {
        Err(invalid("path buffer is not NUL-terminated".to_string()))
    }
}

fn check_drive_letter(letter: u8) -> Result<()> {
    if (b'E'..=b'Z').contains(&letter) {
        Ok(())
    } else {
        Err(invalid(format!("drive letter {:?}", letter as char)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ioctl::{encode_path, SUNPCI_MAX_PATH};

    #[test]
    fn test_opcodes_follow_catalog() {
        assert_eq!(Request::GetVersion.opcode(), 0);
        assert_eq!(Request::ResetSession.opcode(), 4);
        assert_eq!(Request::GetFramebuffer.opcode(), 12);
        assert_eq!(Request::EjectFloppy(FloppySlot::default()).opcode(), 25);
        assert_eq!(Request::MouseEvent(MouseEvent::default()).opcode(), 31);
        assert_eq!(Request::GetClipboard.opcode(), 41);
        assert_eq!(Request::RemoveDriveMap(DriveLetter::default()).opcode(), 51);
        assert_eq!(Request::GetNetwork.opcode(), 61);
        assert_eq!(Request::ReadAudio { max_bytes: 0 }.opcode(), 74);
    }

    #[test]
    fn test_oversized_clipboard_rejected() {
        let mut clipboard = Clipboard::default();
        clipboard.length = SUNPCI_MAX_CLIPBOARD as u32;
        assert!(Request::SetClipboard(Box::new(clipboard)).validate().is_ok());

        clipboard.length += 1;
        assert!(matches!(
            Request::SetClipboard(Box::new(clipboard)).validate(),
            Err(SunPciError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_audio_read_bound() {
        assert!(Request::ReadAudio { max_bytes: 16384 }.validate().is_ok());
        assert!(Request::ReadAudio { max_bytes: 16385 }.validate().is_err());
    }

    #[test]
    fn test_drive_letter_bounds() {
        let mut mapping = DriveMapping::default();
        mapping.path = encode_path("/home/user").unwrap();
        for letter in [b'E', b'Z'] {
            mapping.letter = letter;
            assert!(Request::AddDriveMap(Box::new(mapping)).validate().is_ok());
        }
        for letter in [b'A', b'D', b'a', 0] {
            mapping.letter = letter;
            assert!(Request::AddDriveMap(Box::new(mapping)).validate().is_err());
        }
    }

    #[test]
    fn test_session_config_bounds() {
        let mut config = IoctlSessionConfig::default();
        assert!(Request::StartSession(Box::new(config)).validate().is_ok());

        config.memory_mb = 0;
        assert!(Request::StartSession(Box::new(config)).validate().is_err());
        config.memory_mb = 257;
        assert!(Request::StartSession(Box::new(config)).validate().is_err());

        config.memory_mb = 64;
        config.bios_path = [b'x'; SUNPCI_MAX_PATH];
        assert!(Request::StartSession(Box::new(config)).validate().is_err());
    }
}
