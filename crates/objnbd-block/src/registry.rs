//! Reference-counted volume attachments
//!
//! Several connections may serve the same volume. The registry attaches a
//! volume on first use, hands every user a handle sharing one geometry and
//! one update serializer, and detaches from the backend when the last handle
//! is released.

use crate::backend::{BackendRequest, Correlation, ObjectBackend, VolumeGeometry};
use crate::engine::WriteSubOp;
use crate::error::{BackendError, BlockError, BlockResult};
use crate::serializer::SectorSerializer;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

/// Update serializer shared by every user of one attachment
pub type WriteSerializer = SectorSerializer<WriteSubOp>;

/// Live attachment state of one volume
struct AttachmentEntry {
    geometry: VolumeGeometry,
    serializer: Arc<WriteSerializer>,
}

/// Per-volume slot; its lock is held across that volume's attach and detach
#[derive(Default)]
struct VolumeSlot {
    refs: usize,
    attached: Option<AttachmentEntry>,
}

/// One user's reference to an attached volume
pub struct AttachmentHandle {
    volume: String,
    geometry: VolumeGeometry,
    serializer: Arc<WriteSerializer>,
    released: AtomicBool,
}

impl AttachmentHandle {
    pub fn volume(&self) -> &str {
        &self.volume
    }

    pub fn geometry(&self) -> VolumeGeometry {
        self.geometry
    }

    pub fn serializer(&self) -> &Arc<WriteSerializer> {
        &self.serializer
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for AttachmentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentHandle")
            .field("volume", &self.volume)
            .field("geometry", &self.geometry)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Process-wide volume attachment bookkeeping
///
/// The map lock is only held to look up a volume's slot. Backend attach and
/// detach calls run under that volume's own lock, so a slow backend call
/// stalls users of the same volume and no one else.
pub struct AttachmentRegistry {
    backend: Arc<dyn ObjectBackend>,
    domain: String,
    slots: Mutex<HashMap<String, Arc<AsyncMutex<VolumeSlot>>>>,
}

impl AttachmentRegistry {
    pub fn new(backend: Arc<dyn ObjectBackend>, domain: impl Into<String>) -> Self {
        Self {
            backend,
            domain: domain.into(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Backend the registry attaches through
    pub fn backend(&self) -> Arc<dyn ObjectBackend> {
        Arc::clone(&self.backend)
    }

    fn slot(&self, volume: &str) -> Arc<AsyncMutex<VolumeSlot>> {
        Arc::clone(self.slots.lock().entry(volume.to_string()).or_default())
    }

    /// Forget an unused slot. Slots are only handed out under the map lock,
    /// so a count of two (map plus caller) means nobody else can reach it.
    fn prune(&self, volume: &str, slot: &Arc<AsyncMutex<VolumeSlot>>) {
        let mut slots = self.slots.lock();
        if Arc::strong_count(slot) == 2
            && let Some(current) = slots.get(volume)
            && Arc::ptr_eq(current, slot)
        {
            slots.remove(volume);
        }
    }

    /// Attach `volume` (or join an existing attachment) and return a handle.
    pub async fn acquire(&self, volume: &str) -> BlockResult<Arc<AttachmentHandle>> {
        let slot = self.slot(volume);
        let mut state = slot.lock().await;

        if let Some(entry) = &state.attached {
            let handle = AttachmentHandle {
                volume: volume.to_string(),
                geometry: entry.geometry,
                serializer: Arc::clone(&entry.serializer),
                released: AtomicBool::new(false),
            };
            state.refs += 1;
            info!("volume '{volume}' attachment joined (refs={})", state.refs);
            return Ok(Arc::new(handle));
        }

        let attached = self.attach(volume).await;
        let geometry = match attached {
            Ok(geometry) => geometry,
            Err(e) => {
                drop(state);
                self.prune(volume, &slot);
                return Err(e);
            }
        };

        let serializer = Arc::new(WriteSerializer::new());
        state.refs = 1;
        state.attached = Some(AttachmentEntry {
            geometry,
            serializer: Arc::clone(&serializer),
        });
        info!(
            "volume '{volume}' attached: {}B capacity, {}B objects",
            geometry.capacity, geometry.object_size
        );

        Ok(Arc::new(AttachmentHandle {
            volume: volume.to_string(),
            geometry,
            serializer,
            released: AtomicBool::new(false),
        }))
    }

    async fn attach(&self, volume: &str) -> BlockResult<VolumeGeometry> {
        let geometry = self
            .backend
            .submit(
                Correlation::CONTROL,
                BackendRequest::Attach {
                    domain: self.domain.clone(),
                    volume: volume.to_string(),
                },
            )
            .await
            .into_attached()
            .map_err(|source| BlockError::Attach {
                volume: volume.to_string(),
                source,
            })?;

        if geometry.object_size == 0 || geometry.object_size > u64::from(u32::MAX) {
            return Err(BlockError::Attach {
                volume: volume.to_string(),
                source: BackendError::Io(format!(
                    "unusable object size {}",
                    geometry.object_size
                )),
            });
        }
        Ok(geometry)
    }

    /// Drop one reference. Detaches from the backend on the last one.
    ///
    /// Releasing the same handle twice is a no-op.
    pub async fn release(&self, handle: &AttachmentHandle) -> BlockResult<()> {
        if handle.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let slot = self.slot(&handle.volume);
        let mut state = slot.lock().await;
        if state.attached.is_none() {
            drop(state);
            self.prune(&handle.volume, &slot);
            warn!("release of unknown attachment '{}'", handle.volume);
            return Err(BlockError::Released(handle.volume.clone()));
        }

        state.refs -= 1;
        if state.refs > 0 {
            info!(
                "volume '{}' attachment released (refs={})",
                handle.volume, state.refs
            );
            return Ok(());
        }
        state.attached = None;

        let detached = self
            .backend
            .submit(
                Correlation::CONTROL,
                BackendRequest::Detach {
                    domain: self.domain.clone(),
                    volume: handle.volume.clone(),
                },
            )
            .await
            .into_detached();
        drop(state);
        self.prune(&handle.volume, &slot);
        detached?;
        info!("volume '{}' detached", handle.volume);
        Ok(())
    }

    /// Live references to `volume`
    pub async fn ref_count(&self, volume: &str) -> usize {
        let slot = self.slots.lock().get(volume).map(Arc::clone);
        match slot {
            Some(slot) => slot.lock().await.refs,
            None => 0,
        }
    }
}
