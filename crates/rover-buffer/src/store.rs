//! Per-process cache of open buffers.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::buffer::Buffer;
use crate::catalog::Catalog;
use crate::shm::ShmRegion;
use crate::BufferError;
use rover_proto::DeviceUid;

/// Addresses one shared-memory buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKey {
    Device(DeviceUid),
    Gamepad(usize),
    Field,
}

impl BufferKey {
    pub fn shm_name(&self) -> String {
        match self {
            Self::Device(uid) => format!("dev-{}", uid.as_u128()),
            Self::Gamepad(index) => format!("gamepad-{index}"),
            Self::Field => "field-0".to_owned(),
        }
    }

    /// Only device buffers carry a control block.
    fn has_control(&self) -> bool {
        matches!(self, Self::Device(_))
    }
}

impl fmt::Display for BufferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.shm_name())
    }
}

/// Opens buffers on demand and keeps them alive for the process lifetime.
///
/// The store tracks every region name it has opened so the supervising
/// process can remove them all at exit. An optional namespace prefixes every
/// region name (tests use it to avoid colliding with a live runtime).
pub struct BufferStore {
    catalog: Arc<Catalog>,
    namespace: String,
    buffers: Mutex<HashMap<BufferKey, Arc<Buffer>>>,
    opened: Mutex<HashSet<String>>,
}

impl BufferStore {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self::with_namespace(catalog, "")
    }

    pub fn with_namespace(catalog: Arc<Catalog>, namespace: &str) -> Self {
        Self {
            catalog,
            namespace: namespace.to_owned(),
            buffers: Mutex::new(HashMap::new()),
            opened: Mutex::new(HashSet::new()),
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    fn region_name(&self, key: &BufferKey) -> String {
        format!("{}{}", self.namespace, key.shm_name())
    }

    fn open(&self, key: BufferKey, create: bool) -> Result<Arc<Buffer>, BufferError> {
        if let Some(buffer) = self.buffers.lock().unwrap().get(&key) {
            return Ok(Arc::clone(buffer));
        }
        let ty = match &key {
            BufferKey::Device(uid) => self.catalog.by_device_id(uid.device_id)?,
            BufferKey::Gamepad(_) => self.catalog.get("gamepad")?,
            BufferKey::Field => self.catalog.get("field")?,
        };
        let name = self.region_name(&key);
        let buffer = Arc::new(Buffer::open(
            Arc::clone(ty),
            &name,
            create,
            key.has_control(),
        )?);
        self.opened.lock().unwrap().insert(name);
        self.buffers.lock().unwrap().insert(key, Arc::clone(&buffer));
        Ok(buffer)
    }

    /// Open the buffer, creating the region if needed.
    pub fn get_or_create(&self, key: BufferKey) -> Result<Arc<Buffer>, BufferError> {
        self.open(key, true)
    }

    /// Attach to an existing region; fails if nobody created it.
    pub fn attach(&self, key: BufferKey) -> Result<Arc<Buffer>, BufferError> {
        self.open(key, false)
    }

    /// The already-open buffer, if any.
    pub fn get_cached(&self, key: &BufferKey) -> Option<Arc<Buffer>> {
        self.buffers.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<BufferKey> {
        self.buffers.lock().unwrap().keys().copied().collect()
    }

    pub fn device_uids(&self) -> Vec<DeviceUid> {
        self.buffers
            .lock()
            .unwrap()
            .keys()
            .filter_map(|key| match key {
                BufferKey::Device(uid) => Some(*uid),
                _ => None,
            })
            .collect()
    }

    /// Remove every region this store has opened. Memory is freed once the
    /// last process unmaps.
    pub fn unlink_all(&self) {
        self.buffers.lock().unwrap().clear();
        for name in self.opened.lock().unwrap().drain() {
            ShmRegion::unlink(&name);
        }
    }
}
