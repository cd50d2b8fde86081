use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub fn resource_exists(&self, id: Ulid) -> bool {
        self.store.contains_resource(&id)
    }

    pub async fn get_resource_info(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        let rs = self.store.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        Ok(guard.info())
    }

    /// All resources, ordered by id.
    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let mut out = Vec::with_capacity(self.store.resource_count());
        for rs in self.store.resource_states() {
            out.push(rs.read().await.info());
        }
        out.sort_by_key(|r| r.id);
        out
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let resource_id = self
            .store
            .resource_for_booking(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .store
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        guard.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Bookings on one resource (or all resources), optionally filtered by
    /// status, ordered by `(start, id)`.
    pub async fn list_bookings(
        &self,
        resource_id: Option<Ulid>,
        status: Option<BookingStatus>,
    ) -> Result<Vec<Booking>, EngineError> {
        let states = match resource_id {
            Some(rid) => vec![self.store.get_resource(&rid).ok_or(EngineError::NotFound(rid))?],
            None => self.store.resource_states(),
        };

        let mut out = Vec::new();
        for rs in states {
            let guard = rs.read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| status.is_none_or(|s| b.status == s))
                    .cloned(),
            );
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        Ok(out)
    }
}
