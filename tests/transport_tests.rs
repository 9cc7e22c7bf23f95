use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use swarm_bridge::codec::{codec_for, BinaryCodec, WireCodec, WireFormat};
use swarm_bridge::registry::Endpoint;
use swarm_bridge::telemetry::TelemetryUpdate;
use swarm_bridge::transport::*;

const WAIT: Duration = Duration::from_secs(3);

fn loopback_config() -> TransportConfig {
    TransportConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        poll_interval: Duration::from_millis(20),
        ..TransportConfig::default()
    }
}

fn started(format: WireFormat) -> UdpTransport {
    let mut transport = UdpTransport::new(loopback_config(), codec_for(format));
    transport.start().unwrap();
    transport
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn sender() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").unwrap()
}

fn target(transport: &UdpTransport) -> SocketAddr {
    transport.local_addr().unwrap()
}

#[test]
fn test_start_binds_ephemeral_port() {
    let mut transport = UdpTransport::new(loopback_config(), codec_for(WireFormat::Text));
    assert_eq!(transport.status(), TransportStatus::Stopped);
    assert!(transport.local_addr().is_none());

    transport.start().unwrap();
    assert_eq!(transport.status(), TransportStatus::Running);
    let addr = target(&transport);
    assert_ne!(addr.port(), 0);

    // Starting again is a no-op.
    transport.start().unwrap();
    assert_eq!(target(&transport), addr);
}

#[test]
fn test_drain_returns_messages_in_arrival_order() {
    let transport = started(WireFormat::Text);
    let client = sender();

    client.send_to(b"batt=1", target(&transport)).unwrap();
    client.send_to(b"batt=2", target(&transport)).unwrap();
    assert!(wait_until(|| transport.pending_count() == 2));

    let messages = transport.drain();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].payload, b"batt=1".to_vec());
    assert_eq!(messages[1].payload, b"batt=2".to_vec());
    assert!(messages[0].sequence < messages[1].sequence);
    assert_eq!(
        messages[0].source,
        Endpoint::from(client.local_addr().unwrap())
    );

    assert_eq!(transport.pending_count(), 0);
    assert!(transport.drain().is_empty());
    assert_eq!(transport.pending_count(), 0);
}

#[test]
fn test_callback_bypasses_queue() {
    let transport = started(WireFormat::Binary);
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    transport.set_callback(move |message| sink.lock().unwrap().push(message));

    let client = sender();
    client.send_to(b"one", target(&transport)).unwrap();
    assert!(wait_until(|| received.lock().unwrap().len() == 1));
    assert_eq!(transport.pending_count(), 0);

    transport.clear_callback();
    client.send_to(b"two", target(&transport)).unwrap();
    assert!(wait_until(|| transport.pending_count() == 1));
    assert_eq!(received.lock().unwrap().len(), 1);
    assert_eq!(transport.drain()[0].payload, b"two".to_vec());
}

#[test]
fn test_clear_discards_queue() {
    let transport = started(WireFormat::Text);
    let client = sender();
    for _ in 0..3 {
        client.send_to(b"x=1", target(&transport)).unwrap();
    }
    assert!(wait_until(|| transport.pending_count() == 3));

    assert_eq!(transport.clear(), 3);
    assert_eq!(transport.pending_count(), 0);
    assert_eq!(transport.stats().datagrams_received, 3);
    assert_eq!(transport.stats().bytes_received, 9);
}

#[test]
fn test_stop_is_repeatable_and_stops_queueing() {
    let mut transport = started(WireFormat::Text);
    let addr = target(&transport);

    transport.stop();
    assert_eq!(transport.status(), TransportStatus::Stopped);
    transport.stop();
    assert_eq!(transport.status(), TransportStatus::Stopped);

    let client = sender();
    client.send_to(b"batt=9", addr).unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(transport.pending_count(), 0);
}

#[test]
fn test_restart_after_stop() {
    let mut transport = started(WireFormat::Text);
    transport.stop();
    transport.start().unwrap();
    assert!(transport.is_running());

    let client = sender();
    client.send_to(b"id=1", target(&transport)).unwrap();
    assert!(wait_until(|| transport.pending_count() == 1));
}

#[test]
fn test_detached_receive_loop_does_not_resume_after_restart() {
    let config = TransportConfig {
        shutdown_timeout: Duration::from_millis(50),
        ..loopback_config()
    };
    let mut transport = UdpTransport::new(config, codec_for(WireFormat::Text));
    transport.start().unwrap();
    assert!(wait_until(|| transport.active_receive_loops() == 1));

    let entered = Arc::new(AtomicBool::new(false));
    let received = Arc::new(Mutex::new(Vec::new()));
    let (flag, sink) = (Arc::clone(&entered), Arc::clone(&received));
    transport.set_callback(move |message| {
        if !flag.swap(true, Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(300));
        }
        sink.lock().unwrap().push(message.payload);
    });

    let client = sender();
    client.send_to(b"batt=1", target(&transport)).unwrap();
    assert!(wait_until(|| entered.load(Ordering::SeqCst)));

    // The first loop is still inside the callback, so stop detaches it.
    transport.stop();
    transport.start().unwrap();

    assert!(wait_until(|| transport.active_receive_loops() == 1));
    client.send_to(b"batt=2", target(&transport)).unwrap();
    assert!(wait_until(|| received.lock().unwrap().len() == 2));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(transport.active_receive_loops(), 1);
    assert_eq!(
        *received.lock().unwrap(),
        vec![b"batt=1".to_vec(), b"batt=2".to_vec()]
    );
}

#[test]
fn test_oversized_datagram_is_dropped_and_counted() {
    let config = TransportConfig {
        recv_buffer_size: 16,
        ..loopback_config()
    };
    let mut transport = UdpTransport::new(config, codec_for(WireFormat::Text));
    transport.start().unwrap();
    let client = sender();

    client.send_to(&[b'x'; 40], target(&transport)).unwrap();
    client.send_to(&[b'y'; 17], target(&transport)).unwrap();
    client.send_to(&[b'z'; 16], target(&transport)).unwrap();
    assert!(wait_until(|| transport.pending_count() == 1));
    assert!(wait_until(|| transport.stats().oversized_datagrams == 2));

    let messages = transport.drain();
    assert_eq!(messages[0].payload, vec![b'z'; 16]);
    assert_eq!(transport.stats().datagrams_received, 1);
    assert_eq!(transport.stats().bytes_received, 16);
}

#[test]
fn test_bind_failure_marks_unavailable() {
    let blocker = UdpSocket::bind("127.0.0.1:0").unwrap();
    let config = TransportConfig::new(blocker.local_addr().unwrap().to_string());
    let mut transport = UdpTransport::new(config, codec_for(WireFormat::Json));

    let err = transport.start().unwrap_err();
    assert!(matches!(err, TransportError::Bind { .. }));
    assert_eq!(transport.status(), TransportStatus::Unavailable);

    drop(blocker);
    transport.start().unwrap();
    assert_eq!(transport.status(), TransportStatus::Running);
}

#[test]
fn test_send_reports_failures() {
    let idle = UdpTransport::new(loopback_config(), codec_for(WireFormat::Text));
    assert!(matches!(
        idle.send(b"x=1", "127.0.0.1", 9),
        Err(TransportError::NotRunning)
    ));

    let transport = started(WireFormat::Text);
    assert!(matches!(
        transport.send(b"x=1", "not-an-ip", 9),
        Err(TransportError::InvalidDestination { .. })
    ));
    assert_eq!(idle.stats().send_failures, 1);
}

#[test]
fn test_send_reaches_peer() {
    let transport = started(WireFormat::Text);
    let peer = sender();
    peer.set_read_timeout(Some(WAIT)).unwrap();
    let peer_addr = peer.local_addr().unwrap();

    let sent = transport
        .send(b"batt=4", &peer_addr.ip().to_string(), peer_addr.port())
        .unwrap();
    assert_eq!(sent, 6);

    let mut buf = [0u8; 64];
    let (len, from) = peer.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"batt=4");
    assert_eq!(from, target(&transport));
    assert_eq!(transport.stats().datagrams_sent, 1);
}

#[test]
fn test_send_update_between_transports() {
    let a = started(WireFormat::Binary);
    let b = started(WireFormat::Binary);

    let update = TelemetryUpdate::new().with_battery(33).with_unit_id(2);
    let bytes = a.send_update(&update, &Endpoint::from(target(&b))).unwrap();
    assert_eq!(bytes, 14);

    assert!(wait_until(|| b.pending_count() == 2));
    let mut merged = TelemetryUpdate::new();
    for message in b.drain() {
        BinaryCodec::default().decode_into(&message.payload, &mut merged).unwrap();
        assert_eq!(message.source, Endpoint::from(target(&a)));
    }
    assert_eq!(merged, update);
}
