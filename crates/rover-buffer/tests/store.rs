use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rover_buffer::{BufferError, BufferKey, BufferStore, Catalog, Value};
use rover_proto::DeviceUid;

const CATALOG: &str = r#"{
    "limit-switch": {
        "device_id": 0,
        "params": [{"name": "switch0", "type": "bool"}]
    },
    "polar-bear": {
        "device_id": 12,
        "params": [
            {"name": "duty_cycle", "type": "f64", "writeable": true, "lower": -1, "upper": 1}
        ]
    },
    "gamepad": {
        "device_id": 32768,
        "params": [
            {"name": "button_a", "type": "bool"},
            {"name": "joystick_left_x", "type": "f64", "lower": -1, "upper": 1}
        ]
    },
    "field": {
        "device_id": 61440,
        "params": [{"name": "alliance", "type": "u8"}]
    }
}"#;

fn store(tag: &str) -> BufferStore {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let namespace = format!(
        "rover-store-{}-{}-{tag}-",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed),
    );
    let catalog = Arc::new(Catalog::from_json(CATALOG).unwrap());
    BufferStore::with_namespace(catalog, &namespace)
}

#[test]
fn device_buffers_resolve_by_device_id() {
    let store = store("resolve");
    let uid = DeviceUid::new(12, 0, 42);
    let buffer = store.get_or_create(BufferKey::Device(uid)).unwrap();
    assert_eq!(buffer.device_type().name, "polar-bear");
    assert!(buffer.is_device());
    assert!(buffer.name().ends_with(&format!("dev-{}", uid.as_u128())));

    let unknown = DeviceUid::new(0x4444, 0, 0);
    assert!(matches!(
        store.get_or_create(BufferKey::Device(unknown)),
        Err(BufferError::UnknownDeviceId(0x4444))
    ));
    store.unlink_all();
}

#[test]
fn gamepad_and_field_buffers_have_no_control_block() {
    let store = store("plain");
    let gamepad = store.get_or_create(BufferKey::Gamepad(0)).unwrap();
    assert!(!gamepad.is_device());
    assert!(gamepad.name().ends_with("gamepad-0"));
    gamepad
        .set_data("joystick_left_x", Value::Float(-0.5))
        .unwrap();
    assert_eq!(
        gamepad.get_value("joystick_left_x").unwrap(),
        Value::Float(-0.5)
    );
    assert!(matches!(
        gamepad.get_read(),
        Err(BufferError::NoControlBlock)
    ));

    let field = store.get_or_create(BufferKey::Field).unwrap();
    assert!(field.name().ends_with("field-0"));
    store.unlink_all();
}

#[test]
fn cached_handles_are_shared() {
    let store = store("cache");
    let first = store.get_or_create(BufferKey::Gamepad(1)).unwrap();
    let second = store.get_or_create(BufferKey::Gamepad(1)).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(store.keys(), vec![BufferKey::Gamepad(1)]);
    store.unlink_all();
}

#[test]
fn unlink_all_removes_regions() {
    let store = store("unlink");
    let uid = DeviceUid::new(0, 0, 7);
    store.get_or_create(BufferKey::Device(uid)).unwrap();
    store.unlink_all();

    // A fresh store can no longer attach.
    let fresh = self::store("unlink2");
    assert!(fresh.get_cached(&BufferKey::Device(uid)).is_none());
    assert!(matches!(
        store.attach(BufferKey::Device(uid)),
        Err(BufferError::NoSuchRegion { .. })
    ));
}

#[test]
fn device_uid_listing() {
    let store = store("uids");
    let uid_a = DeviceUid::new(0, 0, 1);
    let uid_b = DeviceUid::new(12, 0, 2);
    store.get_or_create(BufferKey::Device(uid_a)).unwrap();
    store.get_or_create(BufferKey::Device(uid_b)).unwrap();
    store.get_or_create(BufferKey::Gamepad(0)).unwrap();
    let mut uids = store.device_uids();
    uids.sort_by_key(|uid| uid.as_u128());
    assert_eq!(uids, vec![uid_a, uid_b]);
    store.unlink_all();
}
