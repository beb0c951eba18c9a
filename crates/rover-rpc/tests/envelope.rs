use rover_rpc::{decode_call, encode_call, Call, RemoteError, RpcError};
use serde_json::json;

#[test]
fn request_round_trip() {
    let call = Call::Request {
        request_id: 0xDEAD_BEEF,
        method: "subscribe".into(),
        args: vec![json!("12345"), json!(["duty_cycle"]), json!(0.25)],
    };
    let encoded = encode_call(&call).unwrap();
    assert_eq!(decode_call(&encoded).unwrap(), call);
}

#[test]
fn response_round_trip() {
    let ok = Call::Response {
        request_id: 7,
        error: None,
        result: json!({"uids": ["1", "2"], "count": 2}),
    };
    let encoded = encode_call(&ok).unwrap();
    assert_eq!(decode_call(&encoded).unwrap(), ok);

    let failed = Call::Response {
        request_id: 8,
        error: Some(
            RemoteError::new("no such method exists")
                .with("method", "frobnicate")
                .with("attempts", 3),
        ),
        result: serde_json::Value::Null,
    };
    let encoded = encode_call(&failed).unwrap();
    assert_eq!(decode_call(&encoded).unwrap(), failed);
}

#[test]
fn notification_round_trip() {
    let call = Call::Notification {
        method: "update_gamepads".into(),
        args: vec![json!({"0": {"lx": -0.5, "btn": 1}})],
    };
    let encoded = encode_call(&call).unwrap();
    assert_eq!(decode_call(&encoded).unwrap(), call);
}

#[test]
fn rejects_malformed_payloads() {
    assert!(matches!(decode_call(b""), Err(RpcError::Malformed(_))));
    assert!(matches!(
        decode_call(b"\xf6"), // CBOR null
        Err(RpcError::Malformed(_))
    ));
    // An array with an unknown type id.
    let mut buf = Vec::new();
    ciborium_smoke(&mut buf);
    assert!(matches!(decode_call(&buf), Err(RpcError::Malformed(_))));
}

fn ciborium_smoke(buf: &mut Vec<u8>) {
    // [9, "x"] — structurally valid CBOR, not a call envelope.
    buf.extend_from_slice(&[0x82, 0x09, 0x61, 0x78]);
}
