mod conflict;
mod error;
mod mutations;
mod queries;
mod status;
mod store;

pub use conflict::{find_conflict, BlockingPolicy, StatusSet};
pub use error::EngineError;
pub use status::Transition;
pub use store::InMemoryStore;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::observability::LOCK_TIMEOUTS_TOTAL;
use crate::wal::{self, Wal, WalCommand};

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

/// What deleting a resource does to the bookings that reference it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResourceDeletePolicy {
    /// Refuse while any booking (of any status) references the resource.
    #[default]
    Block,
    /// Drop the resource together with all of its bookings.
    Cascade,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub blocking_policy: BlockingPolicy,
    pub resource_delete: ResourceDeletePolicy,
    /// Let new bookings take a slot held only by cancelled bookings.
    pub release_cancelled: bool,
    /// Upper bound on waiting for a resource's write lock.
    pub lock_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            blocking_policy: BlockingPolicy::default(),
            resource_delete: ResourceDeletePolicy::default(),
            release_cancelled: false,
            lock_timeout: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Statuses that block a new booking.
    pub fn blocking_on_create(&self) -> StatusSet {
        if self.release_cancelled {
            StatusSet::ACTIVE
        } else {
            self.blocking_policy.on_create()
        }
    }
}

/// The booking service: every mutation of the store goes through here.
pub struct Engine {
    store: InMemoryStore,
    wal_tx: mpsc::Sender<WalCommand>,
    config: EngineConfig,
    /// Serializes resource creation/deletion and WAL compaction.
    registry: Mutex<()>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn new(wal_path: PathBuf, config: EngineConfig) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;

        let engine = Self {
            store: InMemoryStore::new(),
            wal_tx: wal::spawn_writer(wal),
            config,
            registry: Mutex::new(()),
        };

        // We're the sole owner of every lock here, so try_write always succeeds.
        // Never block: this may run inside an async context.
        for event in &events {
            let resource_id = store::event_resource_id(event);
            match event {
                Event::ResourceCreated { .. } => engine.store.apply_registry_event(event, None),
                _ => {
                    let Some(rs) = engine.store.get_resource(&resource_id) else {
                        continue;
                    };
                    let Ok(mut guard) = rs.try_write() else {
                        continue;
                    };
                    if let Event::ResourceDeleted { .. } = event {
                        engine.store.apply_registry_event(event, Some(&*guard));
                    } else {
                        engine.store.apply_event(&mut guard, event);
                    }
                }
            }
        }

        info!(
            "replayed {} events from {}: {} resources",
            events.len(),
            wal_path.display(),
            engine.store.resource_count()
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::TransientStore("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::TransientStore("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::TransientStore(format!("WAL write failed: {e}")))
    }

    /// WAL first, memory second: a failed append leaves the state untouched.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_event(rs, event);
        Ok(())
    }

    /// Acquire the write lock that serializes every admission decision for one resource.
    pub(super) async fn lock_resource(
        &self,
        resource_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let rs = self
            .store
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = tokio::time::timeout(self.config.lock_timeout, rs.clone().write_owned())
            .await
            .map_err(|_| {
                metrics::counter!(LOCK_TIMEOUTS_TOTAL).increment(1);
                EngineError::TransientStore(format!(
                    "timed out waiting for lock on resource {resource_id}"
                ))
            })?;
        // Deleted while we queued for the lock.
        if !self.store.is_current(&resource_id, &rs) {
            return Err(EngineError::NotFound(resource_id));
        }
        Ok(guard)
    }

    /// Lookup booking → resource, then lock that resource.
    pub(super) async fn lock_booking(
        &self,
        booking_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let resource_id = self
            .store
            .resource_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let guard = self.lock_resource(resource_id).await?;
        // Removed while we queued for the lock.
        if guard.booking(booking_id).is_none() {
            return Err(EngineError::NotFound(booking_id));
        }
        Ok(guard)
    }
}
