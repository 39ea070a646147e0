//! Top-level wiring of the channel, session and subsystem controllers.

use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use sunpci_common::{AppConfig, Result, SunPciError};
use tracing::{info, warn};

use crate::channel::DeviceChannel;
use crate::controllers::display::presentation_config;
use crate::controllers::{
    AudioController, BridgeConfig, ClipboardSync, DisplaySync, DriveMapController,
    DriveMapTable, MediaController, NetworkBridge,
};
use crate::scheduler::{PeriodicTask, Scheduler, Subsystem};
use crate::session::{
    SessionConfig, SessionController, SessionObserver, SessionSnapshot, SessionState,
};

/// One open SunPCi card with every controller attached.
pub struct SunPciHost {
    config: AppConfig,
    session: Arc<SessionController>,
    display: Arc<DisplaySync>,
    audio: Arc<AudioController>,
    clipboard: Arc<ClipboardSync>,
    network: Arc<NetworkBridge>,
    drive_maps: Arc<DriveMapController>,
    media: Arc<MediaController>,
    scheduler: Arc<Scheduler>,
}

impl SunPciHost {
    /// Open the configured device node and attach the controllers.
    pub fn open(config: AppConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.device.request_timeout_ms.max(1));
        let channel = DeviceChannel::open(&config.device.path, timeout)?;
        Self::with_channel(config, channel)
    }

    /// Attach the controllers to an already open channel.
    pub fn with_channel(config: AppConfig, channel: DeviceChannel) -> Result<Self> {
        let drive_table = DriveMapTable::from_config(&config.drive_mappings)?;
        let bridge = BridgeConfig::from_settings(&config.network)?;
        let threshold = config.polling.fault_threshold;

        let session = SessionController::new(channel);
        let display = DisplaySync::new(&session, threshold);
        let audio = AudioController::new(&session, threshold);
        let clipboard = ClipboardSync::new(&session, threshold);
        let network = NetworkBridge::new(&session, threshold);
        let drive_maps = DriveMapController::with_table(&session, drive_table);
        let media = MediaController::new(&session);

        // stored until the next session starts
        network.apply_config(bridge)?;

        let scheduler = Arc::new(Scheduler::new().map_err(|e| {
            SunPciError::IoFault(Errno::from_raw(e.raw_os_error().unwrap_or(Errno::EIO as i32)))
        })?);
        let tasks: [(Subsystem, Arc<dyn PeriodicTask>); 4] = [
            (Subsystem::Display, display.clone()),
            (Subsystem::Audio, audio.clone()),
            (Subsystem::Clipboard, clipboard.clone()),
            (Subsystem::Network, network.clone()),
        ];
        for (subsystem, task) in tasks {
            scheduler.register(subsystem, subsystem.period(&config.polling), task);
        }
        // last, so pollers start after every controller is ready
        let observer: Arc<dyn SessionObserver> = scheduler.clone();
        session.subscribe(Arc::downgrade(&observer));

        info!(
            "SunPCi host ready on {} ({} drive mappings)",
            config.device.path,
            drive_maps.len()
        );
        Ok(Self {
            config,
            session,
            display,
            audio,
            clipboard,
            network,
            drive_maps,
            media,
            scheduler,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<SessionController> {
        &self.session
    }

    pub fn display(&self) -> &Arc<DisplaySync> {
        &self.display
    }

    pub fn audio(&self) -> &Arc<AudioController> {
        &self.audio
    }

    pub fn clipboard(&self) -> &Arc<ClipboardSync> {
        &self.clipboard
    }

    pub fn network(&self) -> &Arc<NetworkBridge> {
        &self.network
    }

    pub fn drive_maps(&self) -> &Arc<DriveMapController> {
        &self.drive_maps
    }

    pub fn media(&self) -> &Arc<MediaController> {
        &self.media
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Start a session from the stored configuration.
    pub fn start(&self) -> Result<()> {
        self.start_with(SessionConfig::from_app_config(&self.config))
    }

    /// Start a session and push the display presentation settings.
    pub fn start_with(&self, config: SessionConfig) -> Result<()> {
        self.session.start(config)?;
        let presentation = presentation_config(&self.config.display);
        if let Err(e) = self.display.set_presentation(presentation) {
            warn!("Failed to apply display settings: {}", e);
        }
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.session.stop()
    }

    pub fn reset(&self) -> Result<()> {
        self.session.reset()
    }

    pub fn status(&self) -> Result<SessionSnapshot> {
        self.session.get_status()
    }

    /// Stop any live session and close the device channel.
    pub fn shutdown(&self) {
        if matches!(
            self.session.state(),
            SessionState::Running | SessionState::Error
        ) {
            if let Err(e) = self.session.stop() {
                warn!("Stopping session during shutdown failed: {}", e);
            }
        }
        self.scheduler.cancel_all();
        self.session.channel().close();
    }
}
