use station_io::protocol::{ProtocolVersion, RelayAction, Request};

#[test]
fn parses_hello_message() {
    let raw = r#"{
        "type":"hello",
        "protocol_version":{"major":1,"minor":0},
        "client_id":"line-hmi"
    }"#;

    let msg = Request::parse(raw).expect("hello should parse");
    match msg {
        Request::Hello {
            protocol_version,
            client_id,
        } => {
            assert!(protocol_version.is_supported());
            assert_eq!(client_id.as_deref(), Some("line-hmi"));
        }
        _ => panic!("expected hello message"),
    }
}

#[test]
fn parses_pulse_without_length() {
    let raw = r#"{"type":"relay","name":"feeder","action":"pulse"}"#;

    let msg = Request::parse(raw).expect("relay should parse");
    match msg {
        Request::Relay { name, action, ms } => {
            assert_eq!(name, "feeder");
            assert_eq!(action, RelayAction::Pulse);
            assert_eq!(ms, None);
        }
        _ => panic!("expected relay message"),
    }
}

#[test]
fn parses_bare_commands() {
    let cases = [
        (r#"{"type":"status"}"#, "status"),
        (r#"{"type":"start"}"#, "start"),
        (r#"{"type":"stop"}"#, "stop"),
        (r#"{"type":"torque_status"}"#, "torque_status"),
        (r#"{"type":"torque_restart"}"#, "torque_restart"),
        (r#"{"type":"torque_globals"}"#, "torque_globals"),
    ];
    for (raw, name) in cases {
        let msg = Request::parse(raw).unwrap_or_else(|e| panic!("{raw}: {e}"));
        assert_eq!(msg.name(), name);
    }
}

#[test]
fn ignores_unknown_fields() {
    let raw = r#"{"type":"stop","sequence":9,"client_unix_us":1700000000000000}"#;
    assert_eq!(Request::parse(raw), Ok(Request::Stop));
}

#[test]
fn rejects_future_major_version_only_at_handshake() {
    let raw = r#"{"type":"hello","protocol_version":{"major":2,"minor":1}}"#;
    let Ok(Request::Hello {
        protocol_version, ..
    }) = Request::parse(raw)
    else {
        panic!("hello should parse");
    };
    assert!(!protocol_version.is_supported());
    assert_ne!(protocol_version, ProtocolVersion::v1());
}
