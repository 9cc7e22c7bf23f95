use std::net::UdpSocket;
use std::thread;
use std::time::{Duration, Instant};
use swarm_bridge::codec::{BinaryCodec, ChecksumMode, WireCodec, WireFormat};
use swarm_bridge::telemetry::*;
use swarm_bridge::transport::TransportStatus;
use swarm_bridge::*;

const WAIT: Duration = Duration::from_secs(3);

const POSITION_FRAME: [u8; 12] = [
    0xEE, 0xEE, 0x01, 0x06, 0x00, 0x64, 0x00, 0xC8, 0x00, 0x32, 0x65, 0xFF,
];

const COMPLEMENT_POSITION_FRAME: [u8; 12] = [
    0xEE, 0xEE, 0x01, 0x06, 0x00, 0x64, 0x00, 0xC8, 0x00, 0x32, 0x9B, 0xFF,
];

fn test_config(format: WireFormat, port: u16) -> (ListenerConfig, BridgeConfig) {
    let listener = ListenerConfig {
        bind_address: "127.0.0.1".to_string(),
        ..ListenerConfig::new(format, port)
    };
    let config = BridgeConfig {
        listeners: vec![listener.clone()],
        poll_interval_ms: 20,
        ..BridgeConfig::default()
    };
    (listener, config)
}

fn started_bridge(format: WireFormat) -> SwarmBridge {
    let (listener, config) = test_config(format, 0);
    let mut bridge = SwarmBridge::new(&listener, &config);
    bridge.start().unwrap();
    bridge
}

/// Ticks the bridge until `condition` holds or the wait expires.
fn tick_until(bridge: &mut SwarmBridge, condition: impl Fn(&SwarmBridge) -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        bridge.update().unwrap();
        if condition(bridge) {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn test_bridge_initial_state() {
    let (listener, config) = test_config(WireFormat::Binary, 0);
    let mut bridge = SwarmBridge::new(&listener, &config);

    let state = bridge.get_state();
    assert!(!state.running);
    assert_eq!(state.tick_count, 0);
    assert!(state.last_error.is_none());
    assert_eq!(bridge.records().len(), DEFAULT_UNIT_CAPACITY);

    assert!(bridge.update().unwrap().is_none());
    assert_eq!(bridge.get_state().tick_count, 0);
}

#[test]
fn test_binary_position_reaches_record() {
    let mut bridge = started_bridge(WireFormat::Binary);
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = bridge.transport().local_addr().unwrap();

    client.send_to(&POSITION_FRAME, addr).unwrap();
    assert!(tick_until(&mut bridge, |b| {
        b.snapshot(UnitId(0)).map(|r| r.position) == Some(Position { x: 100, y: 200, z: 50 })
    }));

    assert_eq!(bridge.registry().len(), 1);
    assert_eq!(bridge.get_state().registered_units, 1);
    assert_eq!(bridge.get_state().messages_applied, 1);
    assert_eq!(bridge.registered_records().len(), 1);
    assert!(bridge.status_line().starts_with("[binary]"));
}

#[test]
fn test_complement_checksum_follows_config() {
    let mut strict = started_bridge(WireFormat::Binary);
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client
        .send_to(&COMPLEMENT_POSITION_FRAME, strict.transport().local_addr().unwrap())
        .unwrap();
    assert!(tick_until(&mut strict, |b| b.store().stats().messages_processed == 1));
    assert_eq!(strict.store().stats().framing_faults, 1);
    assert_eq!(strict.snapshot(UnitId(0)).unwrap().position, Position::default());

    let (listener, mut config) = test_config(WireFormat::Binary, 0);
    config.checksum_mode = ChecksumMode::AcceptComplement;
    let mut lenient = SwarmBridge::new(&listener, &config);
    lenient.start().unwrap();
    client
        .send_to(&COMPLEMENT_POSITION_FRAME, lenient.transport().local_addr().unwrap())
        .unwrap();
    assert!(tick_until(&mut lenient, |b| {
        b.snapshot(UnitId(0)).map(|r| r.position) == Some(Position { x: 100, y: 200, z: 50 })
    }));
}

#[test]
fn test_binary_update_with_unit_id_lands_on_that_unit() {
    let mut bridge = started_bridge(WireFormat::Binary);
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = bridge.transport().local_addr().unwrap();

    let update = TelemetryUpdate::new().with_battery(77).with_unit_id(3);
    for frame in BinaryCodec::default().encode(&update).unwrap() {
        client.send_to(&frame, addr).unwrap();
    }
    assert!(tick_until(&mut bridge, |b| b.store().stats().messages_processed == 2));

    assert_eq!(bridge.snapshot(UnitId(3)).unwrap().battery, 77);
    assert_eq!(bridge.snapshot(UnitId(0)).unwrap().battery, 0);
}

#[test]
fn test_text_bridge_explicit_addressing() {
    let mut bridge = started_bridge(WireFormat::Text);
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = bridge.transport().local_addr().unwrap();

    client.send_to(b"id=3,batt=11", addr).unwrap();
    assert!(tick_until(&mut bridge, |b| b.snapshot(UnitId(3)).unwrap().battery == 11));

    let record = bridge.snapshot(UnitId(3)).unwrap();
    assert_eq!(record.unit_id, 3);
    assert_eq!(record.position, Position::default());
}

#[test]
fn test_faults_are_counted_not_fatal() {
    let mut bridge = started_bridge(WireFormat::Json);
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = bridge.transport().local_addr().unwrap();

    client.send_to(b"not json", addr).unwrap();
    client.send_to(br#"{"batt":64}"#, addr).unwrap();
    assert!(tick_until(&mut bridge, |b| b.store().stats().messages_processed == 2));

    assert_eq!(bridge.get_state().faults, 1);
    assert!(bridge.get_state().last_error.is_some());
    assert_eq!(bridge.store().stats().framing_faults, 1);
    assert_eq!(bridge.snapshot(UnitId(0)).unwrap().battery, 64);
}

#[test]
fn test_send_update_to_registered_unit() {
    let mut bridge = started_bridge(WireFormat::Binary);
    let unit_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    unit_socket.set_read_timeout(Some(WAIT)).unwrap();
    let addr = bridge.transport().local_addr().unwrap();

    unit_socket.send_to(&POSITION_FRAME, addr).unwrap();
    assert!(tick_until(&mut bridge, |b| !b.registry().is_empty()));

    let command = TelemetryUpdate::new().with_pid(1, PidGains { kp: 5, ki: 6, kd: 7 });
    bridge.send_update(UnitId(0), &command).unwrap();

    let mut buf = [0u8; 64];
    let (len, _) = unit_socket.recv_from(&mut buf).unwrap();
    assert_eq!(BinaryCodec::default().decode(&buf[..len]).unwrap(), command);
}

#[test]
fn test_send_update_unknown_unit() {
    let bridge = started_bridge(WireFormat::Text);
    let result = bridge.send_update(UnitId(9), &TelemetryUpdate::new().with_battery(1));
    assert!(matches!(result, Err(BridgeError::UnknownUnit(UnitId(9)))));
}

#[test]
fn test_unavailable_transport_restarts_on_tick() {
    let blocker = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = blocker.local_addr().unwrap().port();
    let (listener, config) = test_config(WireFormat::Text, port);
    let mut bridge = SwarmBridge::new(&listener, &config);

    assert!(bridge.start().is_err());
    assert!(bridge.get_state().running);
    assert_eq!(bridge.transport().status(), TransportStatus::Unavailable);
    assert!(bridge.get_state().last_error.is_some());

    // Still blocked: the tick reports the failure and stays up.
    assert!(bridge.update().is_err());

    drop(blocker);
    assert!(bridge.update().unwrap().is_some());
    assert_eq!(bridge.transport().status(), TransportStatus::Running);
    assert_eq!(bridge.get_state().transport_restarts, 1);
}

#[test]
fn test_stop_halts_ticks() {
    let mut bridge = started_bridge(WireFormat::Binary);
    bridge.update().unwrap();
    bridge.stop();

    assert!(!bridge.get_state().running);
    assert_eq!(bridge.transport().status(), TransportStatus::Stopped);
    assert!(bridge.update().unwrap().is_none());
    assert_eq!(bridge.get_state().tick_count, 1);
}
