use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::SharedResourceState;

/// Resources keyed by id, each behind its own lock, plus a booking → resource index.
pub struct InMemoryStore {
    resources: DashMap<Ulid, SharedResourceState>,
    booking_to_resource: DashMap<Ulid, Ulid>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            booking_to_resource: DashMap::new(),
        }
    }

    // ── Resource registry ────────────────────────────────────

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn contains_resource(&self, id: &Ulid) -> bool {
        self.resources.contains_key(id)
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    /// True while `state` is still the live entry for `id` (not deleted or replaced).
    pub fn is_current(&self, id: &Ulid, state: &SharedResourceState) -> bool {
        self.resources
            .get(id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), state))
    }

    pub fn resource_ids(&self) -> Vec<Ulid> {
        self.resources.iter().map(|e| *e.key()).collect()
    }

    pub fn resource_states(&self) -> Vec<SharedResourceState> {
        self.resources.iter().map(|e| e.value().clone()).collect()
    }

    // ── Booking index ────────────────────────────────────────

    pub fn resource_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_resource.get(booking_id).map(|e| *e.value())
    }

    pub fn contains_booking(&self, booking_id: &Ulid) -> bool {
        self.booking_to_resource.contains_key(booking_id)
    }

    // ── Event application ────────────────────────────────────

    /// Registry-level events (create/delete resource). Caller holds the resource's
    /// write lock for deletes.
    pub fn apply_registry_event(&self, event: &Event, deleted: Option<&ResourceState>) {
        match event {
            Event::ResourceCreated {
                id,
                title,
                description,
                available,
            } => {
                let rs = ResourceState::new(*id, title.clone(), description.clone(), *available);
                self.resources.insert(*id, Arc::new(RwLock::new(rs)));
            }
            Event::ResourceDeleted { id } => {
                if let Some(rs) = deleted {
                    for b in &rs.bookings {
                        self.booking_to_resource.remove(&b.id);
                    }
                }
                self.resources.remove(id);
            }
            _ => {}
        }
    }

    /// Apply an event to one resource's state (no locking; caller holds the lock).
    pub fn apply_event(&self, rs: &mut ResourceState, event: &Event) {
        match event {
            Event::ResourceUpdated {
                title,
                description,
                available,
                ..
            } => {
                rs.title = title.clone();
                rs.description = description.clone();
                rs.available = *available;
            }
            Event::BookingCreated { booking } => {
                self.booking_to_resource.insert(booking.id, booking.resource_id);
                rs.insert_booking(booking.clone());
            }
            Event::BookingUpdated { booking } => {
                // Re-insert so the start-order invariant holds for the new span.
                rs.remove_booking(booking.id);
                rs.insert_booking(booking.clone());
            }
            Event::BookingRemoved { id, .. } => {
                rs.remove_booking(*id);
                self.booking_to_resource.remove(id);
            }
            Event::ResourceCreated { .. } | Event::ResourceDeleted { .. } => {}
        }
    }
}

/// The resource an event belongs to.
pub(super) fn event_resource_id(event: &Event) -> Ulid {
    match event {
        Event::ResourceCreated { id, .. }
        | Event::ResourceUpdated { id, .. }
        | Event::ResourceDeleted { id } => *id,
        Event::BookingCreated { booking } | Event::BookingUpdated { booking } => {
            booking.resource_id
        }
        Event::BookingRemoved { resource_id, .. } => *resource_id,
    }
}
