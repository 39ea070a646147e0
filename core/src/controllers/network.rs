//! Guest network adapter bridging.

use std::sync::{Arc, Mutex};

use sunpci_common::ioctl::{self, net_flags, NetworkConfig, NetworkStatus, SUNPCI_IFNAME_LEN};
use sunpci_common::{NetworkSettings, Request, Response, Result, SunPciError};
use tracing::{debug, info, trace, warn};

use crate::channel::{unexpected_response, DeviceChannel};
use crate::controllers::{report_poll_failure, subscribe};
use crate::fault::PollHealth;
use crate::lock;
use crate::scheduler::{PeriodicTask, Subsystem};
use crate::session::{SessionController, SessionEvent, SessionObserver, SessionState};

/// Adapter configuration pushed with SET_NETWORK.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BridgeConfig {
    pub enabled: bool,
    pub promiscuous: bool,
    /// Host interface to bridge onto
    pub interface: String,
    /// `None` lets the driver assign an address
    pub mac_address: Option<[u8; 6]>,
}

impl BridgeConfig {
    pub fn from_settings(settings: &NetworkSettings) -> Result<Self> {
        let mac_address = match settings.mac_address.trim() {
            "" => None,
            mac => Some(parse_mac_address(mac).ok_or_else(|| {
                SunPciError::InvalidConfig(format!("invalid MAC address {:?}", mac))
            })?),
        };
        Ok(Self {
            enabled: settings.enabled,
            promiscuous: settings.promiscuous,
            interface: settings.host_interface.clone(),
            mac_address,
        })
    }

    pub fn to_wire(&self) -> Result<NetworkConfig> {
        if self.interface.len() >= SUNPCI_IFNAME_LEN {
            return Err(SunPciError::InvalidConfig(format!(
                "interface name {:?} exceeds {} bytes",
                self.interface,
                SUNPCI_IFNAME_LEN - 1
            )));
        }

        let mut config = NetworkConfig::default();
        if self.enabled {
            config.flags |= net_flags::ENABLED;
        }
        if self.promiscuous {
            config.flags |= net_flags::PROMISCUOUS;
        }
        ioctl::encode_cstr(&mut config.interface, &self.interface)?;
        config.mac_address = self.mac_address.unwrap_or_default();
        Ok(config)
    }
}

/// Traffic counters reported by GET_NETWORK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkTraffic {
    pub enabled: bool,
    pub promiscuous: bool,
    pub rx_packets: u32,
    pub tx_packets: u32,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl From<&NetworkStatus> for NetworkTraffic {
    fn from(status: &NetworkStatus) -> Self {
        Self {
            enabled: status.flags & net_flags::ENABLED != 0,
            promiscuous: status.flags & net_flags::PROMISCUOUS != 0,
            rx_packets: status.rx_packets,
            tx_packets: status.tx_packets,
            rx_bytes: status.rx_bytes(),
            tx_bytes: status.tx_bytes(),
        }
    }
}

impl NetworkTraffic {
    pub fn summary(&self) -> String {
        format!(
            "RX: {} ({} pkts) | TX: {} ({} pkts)",
            format_byte_size(self.rx_bytes),
            self.rx_packets,
            format_byte_size(self.tx_bytes),
            self.tx_packets
        )
    }
}

/// Parse `XX:XX:XX:XX:XX:XX`.
pub fn parse_mac_address(mac: &str) -> Option<[u8; 6]> {
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return None;
    }

    let mut bytes = [0u8; 6];
    for (byte, part) in bytes.iter_mut().zip(parts) {
        if part.is_empty() || part.len() > 2 || !part.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    Some(bytes)
}

pub fn format_mac_address(mac: &[u8; 6]) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

pub fn format_byte_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[derive(Debug, Default)]
struct BridgeState {
    /// Most recent configuration requested by the user.
    desired: Option<BridgeConfig>,
    /// Configuration acknowledged by the device, and in which session.
    applied: Option<(u64, BridgeConfig)>,
    traffic: Option<NetworkTraffic>,
}

pub struct NetworkBridge {
    session: Arc<SessionController>,
    channel: DeviceChannel,
    state: Mutex<BridgeState>,
    health: Mutex<PollHealth>,
}

impl NetworkBridge {
    pub fn new(session: &Arc<SessionController>, fault_threshold: u32) -> Arc<Self> {
        let bridge = Arc::new(Self {
            session: session.clone(),
            channel: session.channel().clone(),
            state: Mutex::new(BridgeState::default()),
            health: Mutex::new(PollHealth::new(fault_threshold)),
        });
        subscribe(session, &bridge);
        bridge
    }

    /// Apply `config` to the adapter.
    ///
    /// Returns whether a request was sent. Re-applying the configuration
    /// already in effect is a no-op; while no session runs the configuration
    /// is kept and applied on the next start.
    pub fn apply_config(&self, config: BridgeConfig) -> Result<bool> {
        let wire = config.to_wire().inspect_err(|e| self.note(e))?;

        let epoch = {
            let mut state = lock(&self.state);
            state.desired = Some(config.clone());
            let Some(epoch) = self.session.running_epoch() else {
                debug!("Network configuration stored until the next session");
                return Ok(false);
            };
            if state.applied.as_ref() == Some(&(epoch, config.clone())) {
                trace!("Network configuration unchanged");
                return Ok(false);
            }
            epoch
        };

        self.channel
            .execute(Request::SetNetwork(wire))
            .inspect_err(|e| self.note(e))?;

        let mut state = lock(&self.state);
        if self.session.is_current(epoch) {
            info!(
                "Network adapter {} on {:?}{}",
                if config.enabled { "enabled" } else { "disabled" },
                config.interface,
                if config.promiscuous { " (promiscuous)" } else { "" }
            );
            state.applied = Some((epoch, config));
        }
        Ok(true)
    }

    pub fn applied_config(&self) -> Option<BridgeConfig> {
        let state = lock(&self.state);
        state
            .applied
            .as_ref()
            .filter(|(epoch, _)| self.session.is_current(*epoch))
            .map(|(_, config)| config.clone())
    }

    /// Counters from the last completed poll of the running session.
    pub fn traffic(&self) -> Option<NetworkTraffic> {
        lock(&self.state).traffic
    }

    pub fn last_error(&self) -> Option<SunPciError> {
        lock(&self.health).last_error().cloned()
    }

    fn note(&self, err: &SunPciError) {
        lock(&self.health).note_error(err.clone());
    }

    fn poll(&self) -> Result<NetworkStatus> {
        match self.channel.execute(Request::GetNetwork)? {
            Response::Network(status) => Ok(status),
            other => Err(unexpected_response("GET_NETWORK", &other)),
        }
    }
}

impl PeriodicTask for NetworkBridge {
    fn tick(&self) {
        let Some(epoch) = self.session.running_epoch() else {
            return;
        };
        match self.poll() {
            Ok(status) => {
                let mut state = lock(&self.state);
                if !self.session.is_current(epoch) {
                    debug!("Discarding network status from a previous session");
                    return;
                }
                state.traffic = Some(NetworkTraffic::from(&status));
                lock(&self.health).record_success();
            }
            Err(e) => report_poll_failure(&self.session, &self.health, Subsystem::Network, epoch, e),
        }
    }
}

impl SessionObserver for NetworkBridge {
    fn on_session_event(&self, event: SessionEvent, _epoch: u64) {
        let desired = {
            let mut state = lock(&self.state);
            state.applied = None;
            state.traffic = None;
            state.desired.clone()
        };
        if event != SessionEvent::Started || self.session.state() != SessionState::Running {
            return;
        }

        lock(&self.health).reset();
        if let Some(config) = desired {
            if let Err(e) = self.apply_config(config) {
                warn!("Failed to apply network configuration: {}", e);
            }
        }
    }
}
