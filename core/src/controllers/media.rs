//! Disk, floppy and CD-ROM image slots.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sunpci_common::ioctl::{self, disk_flags, DiskMount, DiskSlot, FloppyMount, FloppySlot};
use sunpci_common::{Request, Result, SunPciError};
use tracing::{debug, error, info};

use crate::channel::DeviceChannel;
use crate::controllers::subscribe;
use crate::lock;
use crate::session::{SessionController, SessionEvent, SessionObserver, SessionState};

/// Largest image accepted for a floppy drive (2.88 MB media plus slack).
pub const MAX_FLOPPY_IMAGE_BYTES: u64 = 3 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaSlot {
    PrimaryDisk,
    SecondaryDisk,
    FloppyA,
    FloppyB,
    Optical,
}

impl MediaSlot {
    pub const ALL: [MediaSlot; 5] = [
        MediaSlot::PrimaryDisk,
        MediaSlot::SecondaryDisk,
        MediaSlot::FloppyA,
        MediaSlot::FloppyB,
        MediaSlot::Optical,
    ];

    /// Floppy and optical media can be ejected; hard disks are unmounted.
    pub fn is_removable(self) -> bool {
        !matches!(self, MediaSlot::PrimaryDisk | MediaSlot::SecondaryDisk)
    }

    fn index(self) -> usize {
        match self {
            MediaSlot::PrimaryDisk => 0,
            MediaSlot::SecondaryDisk => 1,
            MediaSlot::FloppyA => 2,
            MediaSlot::FloppyB => 3,
            MediaSlot::Optical => 4,
        }
    }

    fn mount_request(self, path: &str, readonly: bool) -> Result<Request> {
        let path = ioctl::encode_path(path)?;
        let flags = if readonly { disk_flags::READONLY } else { 0 };
        Ok(match self {
            MediaSlot::PrimaryDisk | MediaSlot::SecondaryDisk => {
                Request::MountDisk(Box::new(DiskMount {
                    slot: self.index() as u32,
                    flags,
                    path,
                }))
            }
            MediaSlot::FloppyA | MediaSlot::FloppyB => Request::MountFloppy(Box::new(FloppyMount {
                drive: (self.index() - 2) as u32,
                flags,
                path,
            })),
            MediaSlot::Optical => Request::MountCdrom(Box::new(ioctl::Path { path })),
        })
    }

    fn release_request(self) -> Request {
        match self {
            MediaSlot::PrimaryDisk | MediaSlot::SecondaryDisk => Request::UnmountDisk(DiskSlot {
                slot: self.index() as u32,
            }),
            MediaSlot::FloppyA | MediaSlot::FloppyB => Request::EjectFloppy(FloppySlot {
                drive: (self.index() - 2) as u32,
            }),
            MediaSlot::Optical => Request::EjectCdrom,
        }
    }
}

impl fmt::Display for MediaSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MediaSlot::PrimaryDisk => "C:",
            MediaSlot::SecondaryDisk => "D:",
            MediaSlot::FloppyA => "A:",
            MediaSlot::FloppyB => "B:",
            MediaSlot::Optical => "CD-ROM",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SlotState {
    pub mounted: bool,
    pub path: Option<String>,
    /// Advisory; passed to the driver, not enforced here.
    pub readonly: bool,
}

/// Expand a leading `~/` to the home directory.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(path)
}

pub struct MediaController {
    session: Arc<SessionController>,
    channel: DeviceChannel,
    /// Held across device requests so a slot changes atomically.
    slots: Mutex<[SlotState; 5]>,
    last_error: Mutex<Option<SunPciError>>,
}

impl MediaController {
    pub fn new(session: &Arc<SessionController>) -> Arc<Self> {
        let media = Arc::new(Self {
            session: session.clone(),
            channel: session.channel().clone(),
            slots: Mutex::new(Default::default()),
            last_error: Mutex::new(None),
        });
        subscribe(session, &media);
        media
    }

    pub fn slot(&self, slot: MediaSlot) -> SlotState {
        lock(&self.slots)[slot.index()].clone()
    }

    pub fn slots(&self) -> Vec<(MediaSlot, SlotState)> {
        let slots = lock(&self.slots);
        MediaSlot::ALL
            .iter()
            .map(|&slot| (slot, slots[slot.index()].clone()))
            .collect()
    }

    pub fn last_error(&self) -> Option<SunPciError> {
        lock(&self.last_error).clone()
    }

    /// Mount an image into an empty slot of the running session.
    pub fn mount(&self, slot: MediaSlot, path: &str, readonly: bool) -> Result<()> {
        self.mount_inner(slot, path, readonly)
            .inspect_err(|e| self.record(e))
    }

    /// Release a slot. Returns whether an image was mounted.
    pub fn unmount(&self, slot: MediaSlot) -> Result<bool> {
        self.release(slot).inspect_err(|e| self.record(e))
    }

    /// Eject removable media.
    pub fn eject(&self, slot: MediaSlot) -> Result<bool> {
        if !slot.is_removable() {
            let err = SunPciError::InvalidArgument(format!("{} is not removable", slot));
            self.record(&err);
            return Err(err);
        }
        self.unmount(slot)
    }

    fn mount_inner(&self, slot: MediaSlot, path: &str, readonly: bool) -> Result<()> {
        let state = self.session.state();
        if state != SessionState::Running {
            return Err(SunPciError::StateConflict(format!(
                "mounting {} requires a running session (session is {})",
                slot, state
            )));
        }

        let mut slots = lock(&self.slots);
        if slots[slot.index()].mounted {
            return Err(SunPciError::SlotBusy(slot.to_string()));
        }

        let expanded = expand_path(path);
        let expanded_str = expanded.to_string_lossy().into_owned();
        let request = slot.mount_request(&expanded_str, readonly)?;
        check_image(slot, &expanded)?;

        info!("Mounting {} as {}", expanded_str, slot);
        self.channel.execute(request).inspect_err(|e| {
            error!("Failed to mount {} as {}: {}", expanded_str, slot, e);
        })?;

        slots[slot.index()] = SlotState {
            mounted: true,
            path: Some(expanded_str),
            readonly,
        };
        Ok(())
    }

    fn release(&self, slot: MediaSlot) -> Result<bool> {
        let mut slots = lock(&self.slots);
        if !slots[slot.index()].mounted {
            debug!("{} is already empty", slot);
            return Ok(false);
        }

        if self.session.state() == SessionState::Running {
            info!("Releasing {}", slot);
            self.channel.execute(slot.release_request()).inspect_err(|e| {
                error!("Failed to release {}: {}", slot, e);
            })?;
        }
        slots[slot.index()] = SlotState::default();
        Ok(true)
    }

    fn record(&self, err: &SunPciError) {
        *lock(&self.last_error) = Some(err.clone());
    }
}

fn check_image(slot: MediaSlot, path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path).map_err(|e| {
        SunPciError::InvalidArgument(format!("cannot access image {}: {}", path.display(), e))
    })?;
    if !meta.is_file() {
        return Err(SunPciError::InvalidArgument(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    if matches!(slot, MediaSlot::FloppyA | MediaSlot::FloppyB) && meta.len() > MAX_FLOPPY_IMAGE_BYTES
    {
        return Err(SunPciError::ResourceLimit(format!(
            "floppy image of {} bytes exceeds {}",
            meta.len(),
            MAX_FLOPPY_IMAGE_BYTES
        )));
    }
    Ok(())
}

impl SessionObserver for MediaController {
    fn on_session_event(&self, event: SessionEvent, _epoch: u64) {
        let mut slots = lock(&self.slots);
        *slots = Default::default();
        if event != SessionEvent::Started {
            return;
        }

        // the session mounts its configured hard disks itself
        let config = self.session.config();
        for (slot, path) in [
            (MediaSlot::PrimaryDisk, config.primary_disk),
            (MediaSlot::SecondaryDisk, config.secondary_disk),
        ] {
            if let Some(path) = path {
                slots[slot.index()] = SlotState {
                    mounted: true,
                    path: Some(path),
                    readonly: false,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_target_the_right_slot() {
        let request = MediaSlot::SecondaryDisk.mount_request("/img/d.img", true).unwrap();
        match request {
            Request::MountDisk(mount) => {
                assert_eq!(mount.slot, 1);
                assert_eq!(mount.flags, disk_flags::READONLY);
                assert_eq!(ioctl::decode_cstr(&mount.path), "/img/d.img");
            }
            other => panic!("unexpected request {:?}", other.name()),
        }

        assert_eq!(
            MediaSlot::FloppyB.release_request(),
            Request::EjectFloppy(FloppySlot { drive: 1 })
        );
        assert_eq!(MediaSlot::Optical.release_request(), Request::EjectCdrom);
    }

    #[test]
    fn test_long_path_is_invalid_config() {
        let path = "/".repeat(300);
        assert!(matches!(
            MediaSlot::Optical.mount_request(&path, false),
            Err(SunPciError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(expand_path("/abs/disk.img"), PathBuf::from("/abs/disk.img"));
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(expand_path("~/disk.img"), Path::new(&home).join("disk.img"));
        }
    }

    #[test]
    fn test_oversized_floppy_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.img");
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(MAX_FLOPPY_IMAGE_BYTES + 1).unwrap();

        assert!(matches!(
            check_image(MediaSlot::FloppyA, &path),
            Err(SunPciError::ResourceLimit(_))
        ));
        assert!(check_image(MediaSlot::Optical, &path).is_ok());
        assert!(check_image(MediaSlot::Optical, &dir.path().join("missing.iso")).is_err());
    }
}
