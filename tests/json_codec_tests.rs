use serde_json::Value;
use swarm_bridge::codec::{CodecError, JsonCodec, WireCodec};
use swarm_bridge::telemetry::*;

#[test]
fn test_top_level_fields() {
    let update = JsonCodec
        .decode(br#"{"id":2,"roll":-5,"pitch":6,"yaw":7,"x":1,"y":2,"z":3,"batt":88}"#)
        .unwrap();

    assert_eq!(update.unit_id, Some(2));
    assert_eq!(update.attitude(), Some(Attitude { roll: -5, pitch: 6, yaw: 7 }));
    assert_eq!(update.position(), Some(Position { x: 1, y: 2, z: 3 }));
    assert_eq!(update.battery, Some(88));
}

#[test]
fn test_pid_array_takes_priority_over_flattened_keys() {
    let update = JsonCodec
        .decode(br#"{"pid":[{"kp":1,"ki":2,"kd":3}],"pid0_kp":9,"pid1_kp":7}"#)
        .unwrap();

    assert_eq!(update.pid[0].complete(), Some(PidGains { kp: 1, ki: 2, kd: 3 }));
    assert!(update.pid[1].is_empty());
}

#[test]
fn test_flattened_pid_keys() {
    let update = JsonCodec
        .decode(br#"{"pid1_kp":4,"pid1_ki":5,"pid1_kd":6,"pid3_kd":1}"#)
        .unwrap();

    assert_eq!(update.pid[1].complete(), Some(PidGains { kp: 4, ki: 5, kd: 6 }));
    assert_eq!(update.pid[3].kd, Some(1));
    assert_eq!(update.pid[3].kp, None);
}

#[test]
fn test_pid_array_skips_non_objects_and_extra_entries() {
    let update = JsonCodec
        .decode(br#"{"pid":[null,{"kp":4,"ki":5,"kd":6},{},{},{"kp":1}]}"#)
        .unwrap();

    assert!(update.pid[0].is_empty());
    assert_eq!(update.pid[1].complete(), Some(PidGains { kp: 4, ki: 5, kd: 6 }));
    assert_eq!(update.field_count(), 3);
}

#[test]
fn test_mistyped_fields_are_skipped() {
    let update = JsonCodec
        .decode(br#"{"batt":"high","x":5,"y":1.5,"z":70000,"id":300,"roll":null}"#)
        .unwrap();

    assert_eq!(update.x, Some(5));
    assert_eq!(update.field_count(), 1);
}

#[test]
fn test_unparseable_payload_is_malformed() {
    let payloads: [&[u8]; 2] = [b"{not json", b""];
    for payload in payloads {
        let err = JsonCodec.decode(payload).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)), "{:?}", err);
        assert!(err.is_framing());
    }
}

#[test]
fn test_non_object_json_is_a_field_fault() {
    let cases: [(&[u8], &str); 4] = [
        (b"[1,2]", "array"),
        (b"42", "number"),
        (b"\"batt\"", "string"),
        (b"null", "null"),
    ];
    for (payload, kind) in cases {
        let err = JsonCodec.decode(payload).unwrap_err();
        assert_eq!(err, CodecError::NotAnObject(kind));
        assert!(!err.is_framing());
    }
}

#[test]
fn test_encode_trims_trailing_pid_entries() {
    let update = TelemetryUpdate::new()
        .with_battery(50)
        .with_pid(1, PidGains { kp: 1, ki: 2, kd: 3 });

    let datagrams = JsonCodec.encode(&update).unwrap();
    assert_eq!(datagrams.len(), 1);

    let value: Value = serde_json::from_slice(&datagrams[0]).unwrap();
    assert_eq!(value["batt"], 50);
    assert!(value.get("x").is_none());
    let pid = value["pid"].as_array().unwrap();
    assert_eq!(pid.len(), 2);
    assert_eq!(pid[0], serde_json::json!({}));
    assert_eq!(pid[1], serde_json::json!({"kp": 1, "ki": 2, "kd": 3}));

    assert_eq!(JsonCodec.decode(&datagrams[0]).unwrap(), update);
}

#[test]
fn test_encode_without_pid_omits_array() {
    let update = TelemetryUpdate::new().with_attitude(Attitude { roll: 1, pitch: -2, yaw: 3 });
    let datagrams = JsonCodec.encode(&update).unwrap();

    let value: Value = serde_json::from_slice(&datagrams[0]).unwrap();
    assert!(value.get("pid").is_none());
    assert_eq!(value["pitch"], -2);
    assert!(JsonCodec.encode(&TelemetryUpdate::new()).unwrap().is_empty());
}
