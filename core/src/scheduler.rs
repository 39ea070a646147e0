//! Cancellable periodic ticks for the subsystem controllers.
//!
//! Each registered subsystem gets one tokio task that sleeps for its period
//! and then runs a tick on the blocking pool. The task awaits the tick
//! before sleeping again, so ticks of one subsystem never overlap while
//! different subsystems run side by side and meet at the device channel.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sunpci_common::PollingSettings;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::lock;
use crate::session::{SessionEvent, SessionObserver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    Display,
    Audio,
    Clipboard,
    Network,
}

impl Subsystem {
    pub const ALL: [Subsystem; 4] = [
        Subsystem::Display,
        Subsystem::Audio,
        Subsystem::Clipboard,
        Subsystem::Network,
    ];

    /// Configured tick period.
    pub fn period(self, polling: &PollingSettings) -> Duration {
        let millis = match self {
            Subsystem::Display => polling.display_ms,
            Subsystem::Audio => polling.audio_ms,
            Subsystem::Clipboard => polling.clipboard_ms,
            Subsystem::Network => polling.network_ms,
        };
        Duration::from_millis(millis.max(1))
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Subsystem::Display => "display",
            Subsystem::Audio => "audio",
            Subsystem::Clipboard => "clipboard",
            Subsystem::Network => "network",
        };
        f.write_str(name)
    }
}

/// One bounded, synchronous unit of subsystem work.
pub trait PeriodicTask: Send + Sync + 'static {
    fn tick(&self);
}

struct Registration {
    period: Duration,
    task: Arc<dyn PeriodicTask>,
}

/// Drives registered subsystems while the session is running.
///
/// Subscribe it to the session controller last: it then activates after
/// every controller has initialized and cancels before any tears down.
pub struct Scheduler {
    runtime: Option<Runtime>,
    registrations: Mutex<HashMap<Subsystem, Registration>>,
    running: Mutex<HashMap<Subsystem, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("sunpci-poll")
            .enable_time()
            .build()?;

        Ok(Self {
            runtime: Some(runtime),
            registrations: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        })
    }

    /// Register (or replace) the task for `subsystem`.
    pub fn register(&self, subsystem: Subsystem, period: Duration, task: Arc<dyn PeriodicTask>) {
        debug!("Registered {} poller every {:?}", subsystem, period);
        lock(&self.registrations).insert(subsystem, Registration { period, task });
    }

    /// Start every registered subsystem that is not already ticking.
    pub fn activate(&self) {
        let Some(runtime) = self.runtime.as_ref() else {
            return;
        };
        let registrations = lock(&self.registrations);
        let mut running = lock(&self.running);
        for (&subsystem, registration) in registrations.iter() {
            if running.get(&subsystem).is_some_and(|handle| !handle.is_finished()) {
                continue;
            }
            let handle = runtime.spawn(run_periodic(
                subsystem,
                registration.period,
                registration.task.clone(),
            ));
            running.insert(subsystem, handle);
        }
        info!("Activated {} subsystem pollers", running.len());
    }

    /// Stop future ticks of `subsystem`.
    ///
    /// A tick already executing finishes on the blocking pool; its owner is
    /// responsible for discarding the result.
    pub fn cancel(&self, subsystem: Subsystem) {
        if let Some(handle) = lock(&self.running).remove(&subsystem) {
            handle.abort();
            debug!("Cancelled {} poller", subsystem);
        }
    }

    pub fn cancel_all(&self) {
        let mut running = lock(&self.running);
        if running.is_empty() {
            return;
        }
        for (_, handle) in running.drain() {
            handle.abort();
        }
        info!("Cancelled all subsystem pollers");
    }

    pub fn is_active(&self, subsystem: Subsystem) -> bool {
        lock(&self.running)
            .get(&subsystem)
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl SessionObserver for Scheduler {
    fn on_session_event(&self, event: SessionEvent, _epoch: u64) {
        match event {
            SessionEvent::Started => self.activate(),
            _ => self.cancel_all(),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn run_periodic(subsystem: Subsystem, period: Duration, task: Arc<dyn PeriodicTask>) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick of an interval completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;
        let task = task.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || task.tick()).await {
            if e.is_panic() {
                error!("{} tick panicked", subsystem);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default)]
    struct SlowTask {
        ticks: AtomicUsize,
        busy: AtomicBool,
        overlapped: AtomicBool,
    }

    impl PeriodicTask for SlowTask {
        fn tick(&self) {
            if self.busy.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(15));
            self.ticks.fetch_add(1, Ordering::SeqCst);
            self.busy.store(false, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_ticks_never_overlap() {
        let scheduler = Scheduler::new().unwrap();
        let task = Arc::new(SlowTask::default());
        scheduler.register(Subsystem::Display, Duration::from_millis(1), task.clone());
        scheduler.activate();
        thread::sleep(Duration::from_millis(200));
        scheduler.cancel_all();

        assert!(task.ticks.load(Ordering::SeqCst) >= 2);
        assert!(!task.overlapped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancel_stops_future_ticks() {
        let scheduler = Scheduler::new().unwrap();
        let task = Arc::new(SlowTask::default());
        scheduler.register(Subsystem::Network, Duration::from_millis(5), task.clone());

        scheduler.on_session_event(SessionEvent::Started, 1);
        assert!(scheduler.is_active(Subsystem::Network));
        thread::sleep(Duration::from_millis(60));

        scheduler.on_session_event(SessionEvent::Stopping, 2);
        assert!(!scheduler.is_active(Subsystem::Network));
        // let a tick that was already running drain
        thread::sleep(Duration::from_millis(30));
        let after_cancel = task.ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(task.ticks.load(Ordering::SeqCst), after_cancel);
    }

    #[test]
    fn test_periods_from_settings() {
        let polling = PollingSettings::default();
        assert_eq!(Subsystem::Display.period(&polling), Duration::from_millis(16));
        assert_eq!(Subsystem::Network.period(&polling), Duration::from_millis(1000));
    }
}
