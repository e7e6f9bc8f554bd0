//! Contract golden tests: decode literal wire frames, re-encode them, and
//! verify the frame survives byte for byte. These pin the frozen wire
//! format so an accidental rename of a field alias fails loudly.

use meridian_edge::messages::{EdgeMessage, MessageType};

/// Decode a literal frame, assert the expected type, and assert that
/// re-encoding reproduces the frame exactly.
fn round_trip(frame: &str, expected: MessageType) -> EdgeMessage {
    let message = EdgeMessage::decode(frame)
        .unwrap_or_else(|e| panic!("failed to decode frame '{frame}': {e}"));
    assert_eq!(message.message_type(), expected);
    assert_eq!(message.encode(), frame, "re-encode mismatch for '{frame}'");
    message
}

#[test]
fn ping_pong_frames() {
    round_trip("ping", MessageType::Ping);
    round_trip("pong", MessageType::Pong);
}

#[test]
fn edge_version_frame() {
    let message = round_trip(r#"edge_version|{"v":"2.1.0"}"#, MessageType::EdgeVersion);
    match message {
        EdgeMessage::EdgeVersion(payload) => assert_eq!(payload.version, "2.1.0"),
        other => panic!("unexpected message: {other:?}"),
    }
}

#[test]
fn device_data_frame() {
    let frame = r#"device_data|{"sid":"Zk93qA","d":{"42":{"ts":[1705320000,1705320030,1705320060],"v":[21.5,21.6,21.7]}}}"#;
    let message = round_trip(frame, MessageType::DeviceData);
    match message {
        EdgeMessage::DeviceData(payload) => {
            assert_eq!(payload.staging_id, "Zk93qA");
            let series = payload.data.get(&42).expect("series 42");
            assert_eq!(series.timestamps_utc.len(), series.values.len());
            assert_eq!(series.values, vec![21.5, 21.6, 21.7]);
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[test]
fn device_data_ack_frame() {
    let message = round_trip(r#"device_data_ack|{"sid":"Zk93qA"}"#, MessageType::DeviceDataAck);
    match message {
        EdgeMessage::DeviceDataAck(payload) => assert_eq!(payload.staging_id, "Zk93qA"),
        other => panic!("unexpected message: {other:?}"),
    }
}

#[test]
fn device_config_response_frame() {
    let frame = r#"device_config_response|{"timeseries_index":{"greenhouse-climate":{"humidity":43,"temperature":42}}}"#;
    let message = round_trip(frame, MessageType::DeviceConfigResponse);
    match message {
        EdgeMessage::DeviceConfigResponse(payload) => {
            assert_eq!(
                payload.timeseries_index["greenhouse-climate"]["temperature"],
                42
            );
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[test]
fn device_config_frame() {
    let frame = r#"device_config|{"drivers":[{"identifier":"host","driver_module":"meridian.device.driver.device_metrics","direction":"input","signals":[{"signal_identifier":"cpu.load_percent","unit_of_measurement":100}]}]}"#;
    let message = round_trip(frame, MessageType::DeviceConfig);
    match message {
        EdgeMessage::DeviceConfig(payload) => {
            assert_eq!(payload.drivers.len(), 1);
            assert_eq!(payload.drivers[0].identifier, "host");
        }
        other => panic!("unexpected message: {other:?}"),
    }
}
