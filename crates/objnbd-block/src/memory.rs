//! In-process object backend
//!
//! Serves volumes from memory. Used by the gateway in demo mode and by tests,
//! which can inject latency and per-object faults.

use crate::backend::{
    BackendRequest, BackendResponse, Correlation, ObjectBackend, ObjectKey, VolumeGeometry,
};
use crate::error::BackendError;
use crate::translator::ObjectIndex;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use objnbd_common::VolumeConfig;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Snapshot of backend call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendCalls {
    pub attach: u64,
    pub detach: u64,
    pub get: u64,
    pub put: u64,
}

impl BackendCalls {
    /// Total calls of any kind
    pub fn total(&self) -> u64 {
        self.attach + self.detach + self.get + self.put
    }
}

#[derive(Default)]
struct Counters {
    attach: AtomicU64,
    detach: AtomicU64,
    get: AtomicU64,
    put: AtomicU64,
}

#[derive(Default)]
struct Faults {
    attach: bool,
    get: HashSet<ObjectIndex>,
    put: HashSet<ObjectIndex>,
}

/// Object store held in memory
pub struct MemoryBackend {
    volumes: RwLock<HashMap<String, VolumeGeometry>>,
    objects: DashMap<ObjectKey, Bytes>,
    attached: DashMap<String, u64>,
    latency: Duration,
    faults: Mutex<Faults>,
    counters: Counters,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty backend with no volumes
    pub fn new() -> Self {
        Self {
            volumes: RwLock::new(HashMap::new()),
            objects: DashMap::new(),
            attached: DashMap::new(),
            latency: Duration::ZERO,
            faults: Mutex::new(Faults::default()),
            counters: Counters::default(),
        }
    }

    /// Create a backend serving the configured volumes
    pub fn from_config(volumes: &[VolumeConfig], latency: Duration) -> Self {
        let backend = Self::new().with_latency(latency);
        for vol in volumes {
            backend.add_volume(&vol.name, vol.object_size, vol.capacity);
        }
        backend
    }

    /// Delay every call by `latency`
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Define a volume
    pub fn add_volume(&self, name: &str, object_size: u64, capacity: u64) {
        self.volumes.write().insert(
            name.to_string(),
            VolumeGeometry {
                object_size,
                capacity,
            },
        );
        info!("memory backend: volume '{name}' ({capacity}B, {object_size}B objects)");
    }

    /// Make every attach fail
    pub fn fail_attach(&self, fail: bool) {
        self.faults.lock().attach = fail;
    }

    /// Make gets of `index` fail with an I/O error
    pub fn fail_get(&self, index: ObjectIndex) {
        self.faults.lock().get.insert(index);
    }

    /// Make puts of `index` fail with an I/O error
    pub fn fail_put(&self, index: ObjectIndex) {
        self.faults.lock().put.insert(index);
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// Current content of an object, if ever written
    pub fn object(&self, volume: &str, blob: &str, index: ObjectIndex) -> Option<Bytes> {
        self.objects
            .get(&ObjectKey::new(volume, blob, index))
            .map(|v| v.clone())
    }

    /// Number of live attachments of a volume
    pub fn attach_count(&self, volume: &str) -> u64 {
        self.attached.get(volume).map_or(0, |c| *c)
    }

    /// Call counters so far
    pub fn calls(&self) -> BackendCalls {
        BackendCalls {
            attach: self.counters.attach.load(Ordering::Relaxed),
            detach: self.counters.detach.load(Ordering::Relaxed),
            get: self.counters.get.load(Ordering::Relaxed),
            put: self.counters.put.load(Ordering::Relaxed),
        }
    }

    fn geometry(&self, volume: &str) -> Result<VolumeGeometry, BackendError> {
        self.volumes
            .read()
            .get(volume)
            .copied()
            .ok_or_else(|| BackendError::VolumeNotFound(volume.to_string()))
    }

    fn check_index(geometry: VolumeGeometry, index: ObjectIndex) -> Result<(), BackendError> {
        if index.saturating_mul(geometry.object_size) >= geometry.capacity {
            return Err(BackendError::OffsetInvalid);
        }
        Ok(())
    }

    fn attach(&self, volume: &str) -> Result<VolumeGeometry, BackendError> {
        self.counters.attach.fetch_add(1, Ordering::Relaxed);
        if self.faults.lock().attach {
            return Err(BackendError::Unavailable("injected attach fault".into()));
        }
        let geometry = self.geometry(volume)?;
        *self.attached.entry(volume.to_string()).or_insert(0) += 1;
        Ok(geometry)
    }

    fn detach(&self, volume: &str) -> Result<(), BackendError> {
        self.counters.detach.fetch_add(1, Ordering::Relaxed);
        let mut count = self
            .attached
            .get_mut(volume)
            .ok_or_else(|| BackendError::VolumeNotFound(volume.to_string()))?;
        *count = count.saturating_sub(1);
        Ok(())
    }

    fn get(&self, key: &ObjectKey) -> Result<Bytes, BackendError> {
        self.counters.get.fetch_add(1, Ordering::Relaxed);
        let geometry = self.geometry(&key.volume)?;
        Self::check_index(geometry, key.index)?;
        if self.faults.lock().get.contains(&key.index) {
            return Err(BackendError::Io(format!("injected get fault on {key}")));
        }
        self.objects
            .get(key)
            .map(|v| v.clone())
            .ok_or(BackendError::NotFound)
    }

    fn put(&self, key: ObjectKey, data: Bytes) -> Result<(), BackendError> {
        self.counters.put.fetch_add(1, Ordering::Relaxed);
        let geometry = self.geometry(&key.volume)?;
        Self::check_index(geometry, key.index)?;
        if data.len() as u64 != geometry.object_size {
            return Err(BackendError::InvalidLength {
                expected: geometry.object_size,
                actual: data.len() as u64,
            });
        }
        if self.faults.lock().put.contains(&key.index) {
            return Err(BackendError::Io(format!("injected put fault on {key}")));
        }
        self.objects.insert(key, data);
        Ok(())
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn submit(&self, token: Correlation, request: BackendRequest) -> BackendResponse {
        if self.latency.is_zero() {
            // Still hand control back so concurrent calls interleave
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.latency).await;
        }

        let result = match request {
            BackendRequest::Attach { domain, volume } => {
                debug!("memory backend: attach {domain}/{volume}");
                self.attach(&volume).map(BackendResponse::Attached)
            }
            BackendRequest::Detach { domain, volume } => {
                debug!("memory backend: detach {domain}/{volume}");
                self.detach(&volume).map(|()| BackendResponse::Detached)
            }
            BackendRequest::Get { key, .. } => self.get(&key).map(BackendResponse::GotObject),
            BackendRequest::Put { key, data } => {
                self.put(key, data).map(|()| BackendResponse::PutObject)
            }
        };

        result.unwrap_or_else(|e| {
            debug!("memory backend: call {token} failed: {e}");
            BackendResponse::Failed(e)
        })
    }
}
