use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rover_buffer::{Buffer, BufferError, Catalog, DeviceType, Value};
use rover_proto::{DeviceUid, Message};

const CATALOG: &str = r#"{
    "example-device": {
        "device_id": 1,
        "params": [
            {"name": "flag", "type": "bool", "readable": false, "writeable": true},
            {"name": "duty_cycle", "type": "f64"},
            {"name": "id", "type": "u32", "writeable": true},
            {"name": "blob_a", "type": {"bytes": {"width": 130}}, "readable": false, "writeable": true},
            {"name": "blob_b", "type": {"bytes": {"width": 130}}, "readable": false, "writeable": true},
            {"name": "pos", "type": "f64", "writeable": true, "lower": -1, "upper": 1}
        ]
    }
}"#;

fn example_type() -> Arc<DeviceType> {
    let catalog = Catalog::from_json(CATALOG).unwrap();
    Arc::clone(catalog.get("example-device").unwrap())
}

/// Region names are global to the host; isolate each test.
fn unique_name(tag: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "rover-test-{}-{}-{tag}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed),
    )
}

struct Fixture {
    name: String,
    buffer: Buffer,
}

impl Fixture {
    fn new(tag: &str) -> Self {
        let name = unique_name(tag);
        let buffer = Buffer::open(example_type(), &name, true, true).unwrap();
        Self { name, buffer }
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        rover_buffer::ShmRegion::unlink(&self.name);
    }
}

#[test]
fn update_data_applies_and_reports() {
    let fx = Fixture::new("update");
    assert_eq!(fx.buffer.last_update().unwrap(), 0.0);

    // id = 0xDEADBEEF (bitmap 0b100).
    let msg = Message::decode(b"\x04\x15\x06\x04\x06\xef\xbe\xad\xde\x35").unwrap();
    fx.buffer.update_data(&msg).unwrap();
    assert!(fx.buffer.last_update().unwrap() > 0.0);
    assert_eq!(fx.buffer.get_value("id").unwrap(), Value::Uint(0xDEADBEEF));
    assert_eq!(
        fx.buffer.get_update().unwrap(),
        vec![("id".to_owned(), Value::Uint(0xDEADBEEF))]
    );

    // duty_cycle = -0.123 (bitmap 0b010), then id again: the union shows up.
    let msg = Message::decode(b"\x04\x15\x06\x04\x06\xef\xbe\xad\xde\x35").unwrap();
    fx.buffer.update_data(&msg).unwrap();
    let msg = Message::decode(b"\x04\x15\x06\x02\x06\x6d\xe7\xfb\xbd\xdd").unwrap();
    fx.buffer.update_data(&msg).unwrap();
    let update = fx.buffer.get_update().unwrap();
    assert_eq!(update.len(), 2);
    assert_eq!(update[0].0, "duty_cycle");
    match update[0].1 {
        Value::Float(v) => assert!((v - (-0.123)).abs() < 1e-6),
        ref other => panic!("unexpected value {other:?}"),
    }
    assert_eq!(update[1], ("id".to_owned(), Value::Uint(0xDEADBEEF)));

    // A frame touching only unmapped parameters is a no-op.
    let before = fx.buffer.last_update().unwrap();
    let msg = Message::decode(b"\x03\x15\x02\x01\x02\x17").unwrap();
    fx.buffer.update_data(&msg).unwrap();
    assert_eq!(fx.buffer.last_update().unwrap(), before);
    assert!(fx.buffer.get_update().unwrap().is_empty());
}

#[test]
fn set_read_filters_capability_and_drains() {
    let fx = Fixture::new("read");
    fx.buffer.set_read(&["flag", "duty_cycle"]).unwrap();
    fx.buffer.set_read(&["id"]).unwrap();
    // flag is write-only, so only duty_cycle|id survive.
    let msg = fx.buffer.get_read().unwrap().unwrap();
    assert_eq!(msg.encode(), b"\x04\x13\x02\x06\x02\x17");
    fx.buffer.set_read(&["id"]).unwrap();
    let msg = fx.buffer.get_read().unwrap().unwrap();
    assert_eq!(msg.encode(), b"\x04\x13\x02\x04\x02\x15");
    assert!(fx.buffer.get_read().unwrap().is_none());

    assert!(matches!(
        fx.buffer.set_read(&["nope"]),
        Err(BufferError::NoSuchParam { .. })
    ));
}

#[test]
fn writes_batch_into_one_frame() {
    let fx = Fixture::new("write");
    assert_eq!(fx.buffer.last_write().unwrap(), 0.0);
    fx.buffer.set_value("flag", Value::Bool(true)).unwrap();
    fx.buffer.set_value("id", Value::Uint(0xDEADBEEF)).unwrap();
    assert!(fx.buffer.last_write().unwrap() > 0.0);

    let messages = fx.buffer.get_write().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(
        messages[0].encode(),
        b"\x04\x14\x07\x05\x07\x01\xef\xbe\xad\xde\x35"
    );
    assert!(fx.buffer.get_write().unwrap().is_empty());
}

#[test]
fn oversized_writes_split_per_parameter() {
    let fx = Fixture::new("split");
    fx.buffer.set_value("id", Value::Uint(7)).unwrap();
    fx.buffer
        .set_value("blob_a", Value::Bytes(vec![0xAA; 130]))
        .unwrap();
    fx.buffer
        .set_value("blob_b", Value::Bytes(vec![0xBB; 130]))
        .unwrap();

    // 4 + 130 + 130 value bytes cannot share one 253-byte payload.
    let messages = fx.buffer.get_write().unwrap();
    assert_eq!(messages.len(), 3);
    let bitmaps: Vec<u16> = messages
        .iter()
        .map(|m| u16::from_le_bytes([m.payload()[0], m.payload()[1]]))
        .collect();
    assert_eq!(bitmaps, vec![0b00100, 0b01000, 0b10000]);
    assert_eq!(messages[1].payload().len(), 2 + 130);
    assert!(fx.buffer.get_write().unwrap().is_empty());
}

#[test]
fn read_denied_for_write_only_parameter() {
    let fx = Fixture::new("deny-read");
    match fx.buffer.get_value("flag") {
        Err(BufferError::NotReadable { param }) => assert_eq!(param, "flag"),
        other => panic!("expected NotReadable, got {other:?}"),
    }
}

#[test]
fn write_denied_for_read_only_parameter() {
    let fx = Fixture::new("deny-write");
    match fx.buffer.set_value("duty_cycle", Value::Float(-0.123)) {
        Err(BufferError::NotWriteable { param }) => assert_eq!(param, "duty_cycle"),
        other => panic!("expected NotWriteable, got {other:?}"),
    }
    assert_eq!(fx.buffer.last_write().unwrap(), 0.0);
}

#[test]
fn out_of_bound_floats_clamp() {
    let fx = Fixture::new("clamp");
    for (written, stored) in [(-1.0, -1.0), (-1.01, -1.0), (1.0, 1.0), (1.01, 1.0)] {
        fx.buffer.set_value("pos", Value::Float(written)).unwrap();
        let messages = fx.buffer.get_write().unwrap();
        let payload = messages[0].payload();
        let value = f32::from_le_bytes(payload[2..].try_into().unwrap());
        assert_eq!(value, stored as f32, "write {written} should store {stored}");
    }
}

#[test]
fn subscription_round_trip() {
    let fx = Fixture::new("sub");
    let uid = DeviceUid::new(0xFFFF, 0xEE, 0xC0DE_BEEF_DEAD_BEEF);
    fx.buffer
        .set_subscription(uid, &["duty_cycle", "flag"])
        .unwrap();
    assert_eq!(fx.buffer.uid().unwrap(), uid);
    assert_eq!(fx.buffer.subscription().unwrap(), ["flag", "duty_cycle"]);
    fx.buffer.set_subscription(DeviceUid::default(), &[]).unwrap();
    assert!(fx.buffer.subscription().unwrap().is_empty());
}

#[test]
fn sub_res_updates_control_block() {
    let fx = Fixture::new("subres");
    let uid = DeviceUid::new(1, 2, 3);
    let msg = Message::sub_res(0b110, 250, uid);
    fx.buffer.apply_sub_res(&msg).unwrap();
    assert_eq!(fx.buffer.uid().unwrap(), uid);
    assert_eq!(fx.buffer.delay_ms().unwrap(), 250);
    assert_eq!(fx.buffer.subscription().unwrap(), ["duty_cycle", "id"]);
    assert_eq!(fx.buffer.make_sub_res().unwrap(), msg);
}

#[test]
fn invalid_buffer_gates_every_operation() {
    let fx = Fixture::new("valid");
    fx.buffer.set_valid(false).unwrap();

    let dev_data = Message::decode(b"\x03\x15\x02\x01\x02\x17").unwrap();
    let all: Vec<Box<dyn Fn() -> Result<(), BufferError> + '_>> = vec![
        Box::new(|| fx.buffer.get_value("id").map(drop)),
        Box::new(|| fx.buffer.set_value("id", Value::Uint(1))),
        Box::new(|| fx.buffer.set_read(&[])),
        Box::new(|| fx.buffer.get_read().map(drop)),
        Box::new(|| fx.buffer.get_write().map(drop)),
        Box::new(|| fx.buffer.get_update().map(drop)),
        Box::new(|| fx.buffer.update_data(&dev_data)),
        Box::new(|| fx.buffer.set_subscription(DeviceUid::default(), &[])),
        Box::new(|| fx.buffer.last_update().map(drop)),
        Box::new(|| fx.buffer.last_write().map(drop)),
        Box::new(|| fx.buffer.uid().map(drop)),
        Box::new(|| fx.buffer.subscription().map(drop)),
    ];
    for op in &all {
        assert!(matches!(op(), Err(BufferError::Invalid)));
    }
    fx.buffer.set_valid(true).unwrap();
    for op in &all {
        op().unwrap();
    }
}

#[test]
fn attach_to_missing_region_fails() {
    let name = unique_name("absent");
    match Buffer::open(example_type(), &name, false, true) {
        Err(BufferError::NoSuchRegion { name: reported }) => assert_eq!(reported, name),
        other => panic!("expected NoSuchRegion, got {other:?}"),
    }
}

#[test]
fn two_handles_share_one_region() {
    let fx = Fixture::new("shared");
    let peer = Buffer::open(example_type(), &fx.name, true, true).unwrap();
    peer.set_value("id", Value::Uint(0xC0DE_BEEF)).unwrap();
    let msg = Message::decode(b"\x04\x15\x06\x02\x06\x6d\xe7\xfb\xbd\xdd").unwrap();
    peer.update_data(&msg).unwrap();

    match fx.buffer.get_value("duty_cycle").unwrap() {
        Value::Float(v) => assert!((v - (-0.123)).abs() < 1e-6),
        other => panic!("unexpected value {other:?}"),
    }
    let messages = fx.buffer.get_write().unwrap();
    assert_eq!(
        messages[0].encode(),
        b"\x04\x14\x06\x04\x06\xef\xbe\xde\xc0\x59"
    );
}

#[test]
fn concurrent_writers_do_not_tear() {
    let fx = Fixture::new("contend");
    let name = fx.name.clone();
    let threads: Vec<_> = (0u32..4)
        .map(|seed| {
            let name = name.clone();
            std::thread::spawn(move || {
                let buffer = Buffer::open(example_type(), &name, true, true).unwrap();
                for i in 0..200u32 {
                    let v = (seed * 1000 + i) % 0xFF;
                    // Every byte of the word must come from the same write.
                    let pattern = u64::from(v) * 0x0101_0101;
                    buffer.set_data("id", Value::Uint(pattern)).unwrap();
                    match buffer.get_value("id") {
                        Ok(Value::Uint(read)) => {
                            let byte = read & 0xFF;
                            assert_eq!(read, byte * 0x0101_0101, "torn read: {read:#x}");
                        }
                        other => panic!("unexpected read {other:?}"),
                    }
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }
}
