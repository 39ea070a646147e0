//! Configuration storage for persistent application state.
//!
//! Stores user preferences and session configuration in a TOML file
//! located at ~/.config/sunpci/config.toml (or XDG_CONFIG_HOME).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::driver::DEVICE_PATH;
use crate::ioctl::flags;

/// Main configuration structure containing all persistent settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Device node and request timeout
    pub device: DeviceSettings,
    /// Guest session parameters
    pub session: SessionSettings,
    /// Display/presentation settings
    pub display: DisplaySettings,
    /// Keyboard settings
    pub keyboard: KeyboardSettings,
    /// Clipboard settings
    pub clipboard: ClipboardSettings,
    /// Network adapter settings
    pub network: NetworkSettings,
    /// Subsystem poll cadences
    pub polling: PollingSettings,
    /// Host directory to guest drive letter mappings
    pub drive_mappings: Vec<DriveMappingEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceSettings {
    /// Device node of the card
    pub path: String,
    /// Upper bound for any single request, in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            path: DEVICE_PATH.to_string(),
            request_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    /// Guest memory in MiB (1-256)
    pub memory_mb: u32,
    /// Primary hard disk image (C:)
    pub primary_disk: Option<PathBuf>,
    /// Secondary hard disk image (D:)
    pub secondary_disk: Option<PathBuf>,
    /// Alternate BIOS image
    pub bios_path: Option<PathBuf>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            memory_mb: 64,
            primary_disk: None,
            secondary_disk: None,
            bios_path: None,
        }
    }
}

/// Display presentation settings (host-side only)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DisplaySettings {
    /// Scaling mode for the guest display
    pub scaling_mode: ScalingMode,
    /// Maintain aspect ratio when scaling
    pub maintain_aspect_ratio: bool,
    /// Apply CRT scanline effect
    pub scanline_effect: bool,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            scaling_mode: ScalingMode::Fit,
            maintain_aspect_ratio: true,
            scanline_effect: false,
        }
    }
}

/// Display scaling modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ScalingMode {
    /// No scaling (1:1 pixels)
    None,
    /// Scale to fit window while maintaining aspect ratio
    #[default]
    Fit,
    /// Fixed integer scale factor
    Integer(u32),
}

/// Keyboard settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeyboardSettings {
    /// Keyboard layout (e.g., "us", "uk", "de")
    pub layout: String,
    /// DOS code page (e.g., "437", "850")
    pub code_page: String,
}

impl Default for KeyboardSettings {
    fn default() -> Self {
        Self {
            layout: "us".to_string(),
            code_page: "437".to_string(),
        }
    }
}

/// Clipboard sharing settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClipboardSettings {
    /// Enable clipboard sharing
    pub enabled: bool,
    /// Direction of clipboard sharing
    pub direction: ClipboardDirection,
}

impl Default for ClipboardSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            direction: ClipboardDirection::Bidirectional,
        }
    }
}

/// Clipboard sharing direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ClipboardDirection {
    #[default]
    Bidirectional,
    HostToGuest,
    GuestToHost,
}

/// Network adapter settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct NetworkSettings {
    /// Enable network adapter
    pub enabled: bool,
    /// Host network interface to bridge
    pub host_interface: String,
    /// MAC address (empty = driver assigns)
    pub mac_address: String,
    /// Enable promiscuous mode
    pub promiscuous: bool,
}

/// Poll cadences in milliseconds, plus the escalation threshold
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollingSettings {
    pub display_ms: u64,
    pub audio_ms: u64,
    pub clipboard_ms: u64,
    pub network_ms: u64,
    /// Consecutive poll failures before the session is forced into Error
    pub fault_threshold: u32,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            display_ms: 16,
            audio_ms: 250,
            clipboard_ms: 500,
            network_ms: 1000,
            fault_threshold: 5,
        }
    }
}

/// Host directory to guest drive letter mapping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriveMappingEntry {
    /// Guest drive letter (e.g., "F:")
    pub drive_letter: String,
    /// Host directory path
    pub host_path: PathBuf,
    /// Expose the drive read-only
    #[serde(default)]
    pub readonly: bool,
    /// Hide the drive from guest listings
    #[serde(default)]
    pub hidden: bool,
    /// Whether this mapping is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Get the default configuration directory
    pub fn config_dir() -> PathBuf {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(xdg_config).join("sunpci")
        } else if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home).join(".config").join("sunpci")
        } else {
            PathBuf::from(".config").join("sunpci")
        }
    }

    /// Get the default configuration file path
    pub fn config_file() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Session flag word derived from the network and clipboard settings
    pub fn session_flags(&self) -> u32 {
        let mut session_flags = 0u32;
        if self.network.enabled {
            session_flags |= flags::NETWORK_ENABLED;
        }
        if self.clipboard.enabled {
            session_flags |= flags::CLIPBOARD_ENABLED;
            match self.clipboard.direction {
                ClipboardDirection::Bidirectional => {
                    session_flags |= flags::CLIPBOARD_TO_GUEST;
                    session_flags |= flags::CLIPBOARD_TO_HOST;
                }
                ClipboardDirection::HostToGuest => {
                    session_flags |= flags::CLIPBOARD_TO_GUEST;
                }
                ClipboardDirection::GuestToHost => {
                    session_flags |= flags::CLIPBOARD_TO_HOST;
                }
            }
        }
        session_flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_flags_from_clipboard_direction() {
        let mut config = AppConfig::default();
        assert_eq!(
            config.session_flags(),
            flags::CLIPBOARD_ENABLED | flags::CLIPBOARD_TO_GUEST | flags::CLIPBOARD_TO_HOST
        );

        config.clipboard.direction = ClipboardDirection::GuestToHost;
        config.network.enabled = true;
        assert_eq!(
            config.session_flags(),
            flags::NETWORK_ENABLED | flags::CLIPBOARD_ENABLED | flags::CLIPBOARD_TO_HOST
        );

        config.clipboard.enabled = false;
        assert_eq!(config.session_flags(), flags::NETWORK_ENABLED);
    }

    #[test]
    fn test_drive_mapping_defaults_when_omitted() {
        let entry: DriveMappingEntry =
            toml::from_str("drive_letter = \"H:\"\nhost_path = \"/home/user\"\n").unwrap();
        assert!(entry.enabled);
        assert!(!entry.readonly);
    }
}
