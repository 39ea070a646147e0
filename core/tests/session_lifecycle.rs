//! Session state machine driven through the public API against the mock
//! device: transitions, rejected transitions, and device failures.

mod common;

use std::time::Duration;

use common::{quiet_config, MockDevice};
use nix::errno::Errno;
use sunpci_common::ioctl::{self, flags, net_flags};
use sunpci_common::{Request, SunPciError};
use sunpci_core::{SessionConfig, SessionController, SessionFlags, SessionState};

#[test]
fn test_out_of_range_memory_sends_nothing() {
    let device = MockDevice::new();
    let session = SessionController::new(device.channel());

    for memory_mb in [0, 257] {
        let config = SessionConfig {
            memory_mb,
            ..SessionConfig::default()
        };
        assert!(matches!(session.start(config), Err(SunPciError::InvalidConfig(_))));
        assert_eq!(session.state(), SessionState::Stopped);
    }
    assert!(device.requests().is_empty());
    assert!(matches!(session.last_error(), Some(SunPciError::InvalidConfig(_))));
}

#[test]
fn test_start_and_stop_issue_one_request_each() {
    let device = MockDevice::new();
    let session = SessionController::new(device.channel());

    session.start(SessionConfig::default()).unwrap();
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(device.names(), vec!["START_SESSION"]);

    session.stop().unwrap();
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(device.names(), vec!["START_SESSION", "STOP_SESSION"]);
}

#[test]
fn test_disallowed_transitions_are_state_conflicts() {
    let device = MockDevice::new();
    let session = SessionController::new(device.channel());

    assert!(matches!(session.stop(), Err(SunPciError::StateConflict(_))));
    assert!(matches!(session.reset(), Err(SunPciError::StateConflict(_))));
    assert_eq!(session.state(), SessionState::Stopped);

    session.start(SessionConfig::default()).unwrap();
    assert!(matches!(
        session.start(SessionConfig::default()),
        Err(SunPciError::StateConflict(_))
    ));
    assert_eq!(session.state(), SessionState::Running);
    assert!(matches!(session.last_error(), Some(SunPciError::StateConflict(_))));

    // only the successful start reached the device
    assert_eq!(device.names(), vec!["START_SESSION"]);
}

#[test]
fn test_reset_restarts_the_epoch() {
    let device = MockDevice::new();
    let session = SessionController::new(device.channel());
    session.start(SessionConfig::default()).unwrap();
    let first = session.running_epoch().unwrap();

    session.reset().unwrap();
    let second = session.running_epoch().unwrap();
    assert!(second > first);
    assert!(!session.is_current(first));
    assert_eq!(device.count("RESET_SESSION"), 1);
}

#[test]
fn test_start_timeout_faults_the_session() {
    let device = MockDevice::new();
    device.delay("START_SESSION", Duration::from_millis(400));
    let session = SessionController::new(device.channel_with_timeout(Duration::from_millis(100)));

    let err = session.start(SessionConfig::default()).unwrap_err();
    assert_eq!(err, SunPciError::Timeout(100));
    assert_eq!(session.state(), SessionState::Error);
    let diagnostic = session.diagnostic().unwrap();
    assert!(diagnostic.contains("START_SESSION"), "{diagnostic}");

    // stopping a faulted session always lands in Stopped
    session.stop().unwrap();
    assert_eq!(session.state(), SessionState::Stopped);
}

#[test]
fn test_stop_failure_faults_the_session() {
    let device = MockDevice::new();
    let session = SessionController::new(device.channel());
    session.start(SessionConfig::default()).unwrap();

    device.fail_once("STOP_SESSION", 0, SunPciError::IoFault(Errno::EIO));
    assert_eq!(session.stop(), Err(SunPciError::IoFault(Errno::EIO)));
    assert_eq!(session.state(), SessionState::Error);

    session.stop().unwrap();
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(device.count("STOP_SESSION"), 2);
}

#[test]
fn test_status_refreshes_only_while_running() {
    let device = MockDevice::new();
    device.edit(|state| {
        state.status.set_memory_used(48 << 20);
        state.status.set_uptime_ns(5_000_000_000);
        state.status.cpu_usage = 1250;
    });
    let session = SessionController::new(device.channel());

    let idle = session.get_status().unwrap();
    assert_eq!(idle.state, SessionState::Stopped);
    assert_eq!(idle.stats.memory_used_bytes, 0);
    assert!(device.requests().is_empty());

    session.start(SessionConfig::default()).unwrap();
    let live = session.get_status().unwrap();
    assert_eq!(live.state, SessionState::Running);
    assert_eq!(live.stats.memory_used_bytes, 48 << 20);
    assert_eq!(live.stats.uptime_ns, 5_000_000_000);
    assert_eq!(live.stats.cpu_usage_percent_x100, 1250);
}

#[test]
fn test_input_requires_running_session() {
    let device = MockDevice::new();
    let session = SessionController::new(device.channel());
    let key = ioctl::KeyEvent {
        scancode: 0x1E,
        flags: ioctl::key_flags::PRESSED,
    };

    assert!(matches!(session.send_key(key), Err(SunPciError::StateConflict(_))));
    session.start(SessionConfig::default()).unwrap();
    session.send_key(key).unwrap();
    session.send_mouse(ioctl::MouseEvent { dx: 3, dy: -2, dz: 0, buttons: 0 }).unwrap();
    assert_eq!(device.names(), vec!["START_SESSION", "KEYBOARD_EVENT", "MOUSE_EVENT"]);
}

#[test]
fn test_host_start_with_network_enabled() {
    let device = MockDevice::new();
    let mut config = quiet_config();
    config.session.memory_mb = 128;
    config.network.enabled = true;
    config.network.host_interface = "eth0".to_string();
    let host = device.host(config);

    host.start().unwrap();
    assert_eq!(host.session().state(), SessionState::Running);

    let requests = device.requests();
    let Some(Request::StartSession(wire)) = requests.first() else {
        panic!("first request was {:?}", requests.first().map(Request::name));
    };
    assert_eq!(wire.memory_mb, 128);
    assert_ne!(wire.flags & flags::NETWORK_ENABLED, 0);
    assert!(SessionFlags::from_bits_truncate(wire.flags).contains(SessionFlags::NETWORK_ENABLED));

    let network = requests
        .iter()
        .find_map(|request| match request {
            Request::SetNetwork(config) => Some(*config),
            _ => None,
        })
        .expect("SET_NETWORK after start");
    assert_ne!(network.flags & net_flags::ENABLED, 0);
    assert_eq!(ioctl::decode_cstr(&network.interface), "eth0");
    assert!(host.network().applied_config().is_some());

    host.stop().unwrap();
    assert_eq!(host.session().state(), SessionState::Stopped);
    assert!(host.network().applied_config().is_none());
}
