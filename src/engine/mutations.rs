use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{outcome_label, ADMISSIONS_TOTAL, STATUS_CHANGES_TOTAL};
use crate::wal::WalCommand;

use super::conflict::{check_no_conflict, now_ms, validate_span};
use super::status::Transition;
use super::{Engine, EngineError, ResourceDeletePolicy};

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn check_contact(name: &str, email: &str, notes: Option<&str>) -> Result<(), EngineError> {
    check_len(name, MAX_CONTACT_LEN, "contact name too long")?;
    check_len(email, MAX_CONTACT_LEN, "contact email too long")?;
    if let Some(n) = notes {
        check_len(n, MAX_NOTES_LEN, "notes too long")?;
    }
    Ok(())
}

fn record_admission<T>(operation: &'static str, result: &Result<T, EngineError>) {
    metrics::counter!(ADMISSIONS_TOTAL, "operation" => operation, "outcome" => outcome_label(result))
        .increment(1);
    if let Err(e) = result {
        debug!("{operation} rejected: {e}");
    }
}

impl Engine {
    // ── Resource registry ────────────────────────────────────

    pub async fn create_resource(
        &self,
        id: Ulid,
        title: String,
        description: String,
        available: bool,
    ) -> Result<ResourceInfo, EngineError> {
        check_len(&title, MAX_TITLE_LEN, "title too long")?;
        check_len(&description, MAX_DESCRIPTION_LEN, "description too long")?;

        let _registry = self.registry.lock().await;
        if self.store.resource_count() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if self.store.contains_resource(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ResourceCreated { id, title, description, available };
        self.wal_append(&event).await?;
        self.store.apply_registry_event(&event, None);
        info!("resource {id} created");
        self.get_resource_info(id).await
    }

    /// Edit a resource's fields. `None` keeps the current value.
    pub async fn update_resource(
        &self,
        id: Ulid,
        title: Option<String>,
        description: Option<String>,
        available: Option<bool>,
    ) -> Result<ResourceInfo, EngineError> {
        if let Some(t) = &title {
            check_len(t, MAX_TITLE_LEN, "title too long")?;
        }
        if let Some(d) = &description {
            check_len(d, MAX_DESCRIPTION_LEN, "description too long")?;
        }

        let mut guard = self.lock_resource(id).await?;
        let event = Event::ResourceUpdated {
            id,
            title: title.unwrap_or_else(|| guard.title.clone()),
            description: description.unwrap_or_else(|| guard.description.clone()),
            available: available.unwrap_or(guard.available),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(guard.info())
    }

    pub async fn delete_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let _registry = self.registry.lock().await;
        let guard = self.lock_resource(id).await?;
        if self.config.resource_delete == ResourceDeletePolicy::Block && !guard.bookings.is_empty() {
            return Err(EngineError::HasBookings(id));
        }

        let event = Event::ResourceDeleted { id };
        self.wal_append(&event).await?;
        self.store.apply_registry_event(&event, Some(&*guard));
        info!("resource {id} deleted with {} bookings", guard.bookings.len());
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Admit a new pending booking if nothing blocking overlaps it.
    ///
    /// Detection and insertion happen under the resource's write lock, so two
    /// racing requests for overlapping slots cannot both be admitted.
    pub async fn create_booking(&self, req: NewBooking) -> Result<Booking, EngineError> {
        let result = self.admit_new(req).await;
        record_admission("create", &result);
        result
    }

    async fn admit_new(&self, req: NewBooking) -> Result<Booking, EngineError> {
        let span = validate_span(req.start, req.end)?;
        check_len(&req.requester_id, MAX_REQUESTER_LEN, "requester id too long")?;
        check_contact(&req.contact_name, &req.contact_email, req.notes.as_deref())?;

        let mut guard = self.lock_resource(req.resource_id).await?;
        if !guard.available {
            return Err(EngineError::ResourceUnavailable(req.resource_id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many bookings on resource"));
        }
        let id = req.id.unwrap_or_else(Ulid::new);
        if self.store.contains_booking(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        check_no_conflict(&guard, &span, self.config.blocking_on_create(), None)?;

        let now = now_ms();
        let booking = Booking {
            id,
            resource_id: req.resource_id,
            requester_id: req.requester_id,
            span,
            contact_name: req.contact_name,
            contact_email: req.contact_email,
            notes: req.notes,
            status: BookingStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        let event = Event::BookingCreated { booking: booking.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(
            "booking {id} admitted on {} for [{}, {})",
            booking.resource_id, span.start, span.end
        );
        Ok(booking)
    }

    /// Move a booking and/or edit its contact fields.
    pub async fn reschedule_booking(
        &self,
        id: Ulid,
        patch: BookingPatch,
    ) -> Result<Booking, EngineError> {
        self.update_booking(id, patch, None).await
    }

    /// Change status through the transition table. Never re-checks the interval.
    pub async fn set_status(&self, id: Ulid, status: BookingStatus) -> Result<Booking, EngineError> {
        self.update_booking(id, BookingPatch::default(), Some(status)).await
    }

    pub async fn confirm(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.set_status(id, BookingStatus::Confirmed).await
    }

    pub async fn cancel(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.set_status(id, BookingStatus::Cancelled).await
    }

    /// Apply an interval/contact patch and an optional status change as one unit.
    ///
    /// The transition is checked against the current status before anything is
    /// written. The conflict scan runs only when the patch moves an endpoint and
    /// the booking is not cancelled; it excludes the booking itself.
    pub async fn update_booking(
        &self,
        id: Ulid,
        patch: BookingPatch,
        status: Option<BookingStatus>,
    ) -> Result<Booking, EngineError> {
        let moves = patch.touches_interval();
        let result = self.apply_update(id, patch, status).await;
        if moves {
            record_admission("reschedule", &result);
        }
        result
    }

    async fn apply_update(
        &self,
        id: Ulid,
        patch: BookingPatch,
        status: Option<BookingStatus>,
    ) -> Result<Booking, EngineError> {
        let mut guard = self.lock_booking(id).await?;
        let current = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;

        let transition = match status {
            Some(next) => current.status.transition_to(next)?,
            None => Transition::Unchanged,
        };
        if patch.is_empty() && transition == Transition::Unchanged {
            return Ok(current);
        }

        let mut updated = current.clone();
        if !patch.is_empty() {
            let start = patch.start.unwrap_or(current.span.start);
            let end = patch.end.unwrap_or(current.span.end);
            updated.span = validate_span(start, end)?;
            if let Some(name) = patch.contact_name {
                updated.contact_name = name;
            }
            if let Some(email) = patch.contact_email {
                updated.contact_email = email;
            }
            if let Some(notes) = patch.notes {
                // An empty string clears the notes.
                updated.notes = (!notes.is_empty()).then_some(notes);
            }
            check_contact(
                &updated.contact_name,
                &updated.contact_email,
                updated.notes.as_deref(),
            )?;

            if (patch.start.is_some() || patch.end.is_some()) && !current.status.is_terminal() {
                check_no_conflict(
                    &guard,
                    &updated.span,
                    self.config.blocking_policy.on_reschedule(),
                    Some(id),
                )?;
            }
        }
        if let Transition::Changed(to) = transition {
            updated.status = to;
        }
        updated.updated_at = now_ms().max(current.updated_at);

        let event = Event::BookingUpdated { booking: updated.clone() };
        self.persist_and_apply(&mut guard, &event).await?;

        if let Transition::Changed(to) = transition {
            metrics::counter!(STATUS_CHANGES_TOTAL, "to" => to.as_str()).increment(1);
            info!("booking {id}: {} -> {to}", current.status);
        }
        if updated.span != current.span {
            info!(
                "booking {id} moved to [{}, {})",
                updated.span.start, updated.span.end
            );
        }
        Ok(updated)
    }

    /// Irrevocable hard delete for administrative cleanup. No conflict or status checks.
    pub async fn remove_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let mut guard = self.lock_booking(id).await?;
        let removed = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        let event = Event::BookingRemoved { id, resource_id: removed.resource_id };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("booking {id} removed");
        Ok(removed)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event sequence that rebuilds current state.
    ///
    /// Holds the registry lock and a read lock on every resource, so no append
    /// can land between the snapshot and the file swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _registry = self.registry.lock().await;
        let mut guards = Vec::new();
        for rs in self.store.resource_states() {
            guards.push(rs.read_owned().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::ResourceCreated {
                id: guard.id,
                title: guard.title.clone(),
                description: guard.description.clone(),
                available: guard.available,
            });
            for booking in &guard.bookings {
                events.push(Event::BookingCreated { booking: booking.clone() });
            }
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::TransientStore("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::TransientStore("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::TransientStore(format!("WAL compaction failed: {e}")))?;
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
