use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Interval ordering first, then the storage bounds.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if start >= end {
        return Err(EngineError::Validation(format!(
            "start ({start}) must be before end ({end})"
        )));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    Ok(span)
}

/// Set of booking statuses that take part in a conflict scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSet(u8);

impl StatusSet {
    pub const NONE: StatusSet = StatusSet(0);
    pub const CONFIRMED: StatusSet = StatusSet::of(&[BookingStatus::Confirmed]);
    pub const ACTIVE: StatusSet =
        StatusSet::of(&[BookingStatus::Pending, BookingStatus::Confirmed]);
    pub const ALL: StatusSet = StatusSet::of(&BookingStatus::ALL);

    pub const fn of(statuses: &[BookingStatus]) -> StatusSet {
        let mut bits = 0u8;
        let mut i = 0;
        while i < statuses.len() {
            bits |= Self::bit(statuses[i]);
            i += 1;
        }
        StatusSet(bits)
    }

    const fn bit(status: BookingStatus) -> u8 {
        match status {
            BookingStatus::Pending => 1,
            BookingStatus::Confirmed => 2,
            BookingStatus::Cancelled => 4,
        }
    }

    pub const fn contains(self, status: BookingStatus) -> bool {
        self.0 & Self::bit(status) != 0
    }
}

/// Which statuses block which operation.
///
/// A new request is blocked by an overlapping booking of any status. Under
/// `Asymmetric` a reschedule is blocked only by confirmed bookings, so an owner
/// may still move a pending booking across another pending one. `Uniform` also
/// blocks reschedules on pending bookings. Cancelled bookings never block a
/// reschedule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlockingPolicy {
    #[default]
    Asymmetric,
    Uniform,
}

impl BlockingPolicy {
    pub fn on_create(self) -> StatusSet {
        StatusSet::ALL
    }

    pub fn on_reschedule(self) -> StatusSet {
        match self {
            BlockingPolicy::Asymmetric => StatusSet::CONFIRMED,
            BlockingPolicy::Uniform => StatusSet::ACTIVE,
        }
    }
}

/// Earliest-starting booking on `rs` that overlaps `span`, has a status in
/// `blocking`, and is not `exclude`. Pure read.
pub fn find_conflict<'a>(
    rs: &'a ResourceState,
    span: &Span,
    blocking: StatusSet,
    exclude: Option<Ulid>,
) -> Option<&'a Booking> {
    // `overlapping` walks in start order, so the first hit is the earliest.
    rs.overlapping(span)
        .filter(|b| Some(b.id) != exclude)
        .find(|b| blocking.contains(b.status))
}

pub(crate) fn check_no_conflict(
    rs: &ResourceState,
    span: &Span,
    blocking: StatusSet,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(rs, span, blocking, exclude) {
        Some(existing) => Err(EngineError::Conflict {
            booking_id: existing.id,
            start: existing.span.start,
            end: existing.span.end,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;

    fn rs_with(bookings: &[(Ms, Ms, BookingStatus)]) -> ResourceState {
        let mut rs = ResourceState::new(Ulid::new(), "Room".into(), String::new(), true);
        for &(start, end, status) in bookings {
            rs.insert_booking(Booking {
                id: Ulid::new(),
                resource_id: rs.id,
                requester_id: "u".into(),
                span: Span::new(start, end),
                contact_name: "n".into(),
                contact_email: "e@x.io".into(),
                notes: None,
                status,
                created_at: 0,
                updated_at: 0,
            });
        }
        rs
    }

    #[test]
    fn status_set_membership() {
        assert!(StatusSet::ACTIVE.contains(BookingStatus::Pending));
        assert!(StatusSet::ACTIVE.contains(BookingStatus::Confirmed));
        assert!(!StatusSet::ACTIVE.contains(BookingStatus::Cancelled));
        assert!(!StatusSet::CONFIRMED.contains(BookingStatus::Pending));
        assert!(!StatusSet::NONE.contains(BookingStatus::Confirmed));
        assert!(BookingStatus::ALL.iter().all(|s| StatusSet::ALL.contains(*s)));
    }

    #[test]
    fn policies() {
        assert_eq!(BlockingPolicy::Asymmetric.on_create(), StatusSet::ALL);
        assert_eq!(BlockingPolicy::Uniform.on_create(), StatusSet::ALL);
        assert_eq!(BlockingPolicy::Asymmetric.on_reschedule(), StatusSet::CONFIRMED);
        assert_eq!(BlockingPolicy::Uniform.on_reschedule(), StatusSet::ACTIVE);
    }

    #[test]
    fn half_open_boundary() {
        let rs = rs_with(&[(10 * H, 11 * H, BookingStatus::Confirmed)]);
        let adjacent = Span::new(11 * H, 12 * H);
        assert!(find_conflict(&rs, &adjacent, StatusSet::ACTIVE, None).is_none());
        let one_minute_in = Span::new(11 * H - 60_000, 12 * H);
        assert!(find_conflict(&rs, &one_minute_in, StatusSet::ACTIVE, None).is_some());
    }

    #[test]
    fn earliest_conflict_wins() {
        let rs = rs_with(&[
            (12 * H, 13 * H, BookingStatus::Confirmed),
            (10 * H, 11 * H, BookingStatus::Pending),
            (11 * H, 12 * H, BookingStatus::Confirmed),
        ]);
        let hit = find_conflict(&rs, &Span::new(9 * H, 14 * H), StatusSet::ACTIVE, None).unwrap();
        assert_eq!(hit.span.start, 10 * H);

        let hit = find_conflict(&rs, &Span::new(9 * H, 14 * H), StatusSet::CONFIRMED, None).unwrap();
        assert_eq!(hit.span.start, 11 * H);
    }

    #[test]
    fn status_filter_applies() {
        let rs = rs_with(&[
            (10 * H, 11 * H, BookingStatus::Pending),
            (10 * H, 11 * H, BookingStatus::Cancelled),
        ]);
        let span = Span::new(10 * H, 11 * H);
        assert!(find_conflict(&rs, &span, StatusSet::CONFIRMED, None).is_none());
        assert_eq!(
            find_conflict(&rs, &span, StatusSet::ACTIVE, None).unwrap().status,
            BookingStatus::Pending
        );
        let cancelled_only = StatusSet::of(&[BookingStatus::Cancelled]);
        assert_eq!(
            find_conflict(&rs, &span, cancelled_only, None).unwrap().status,
            BookingStatus::Cancelled
        );
    }

    #[test]
    fn excluded_id_is_skipped() {
        let rs = rs_with(&[(10 * H, 11 * H, BookingStatus::Confirmed)]);
        let own = rs.bookings[0].id;
        let span = Span::new(10 * H + 30 * 60_000, 11 * H + 30 * 60_000);
        assert!(find_conflict(&rs, &span, StatusSet::ACTIVE, Some(own)).is_none());
        assert!(find_conflict(&rs, &span, StatusSet::ACTIVE, Some(Ulid::new())).is_some());
    }

    #[test]
    fn check_reports_conflicting_interval() {
        let rs = rs_with(&[(10 * H, 11 * H, BookingStatus::Confirmed)]);
        let err = check_no_conflict(&rs, &Span::new(10 * H + 1, 12 * H), StatusSet::ACTIVE, None)
            .unwrap_err();
        match err {
            EngineError::Conflict { start, end, booking_id } => {
                assert_eq!((start, end), (10 * H, 11 * H));
                assert_eq!(booking_id, rs.bookings[0].id);
            }
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[test]
    fn validate_span_ordering() {
        let t = 1_735_689_600_000;
        assert!(matches!(validate_span(t, t), Err(EngineError::Validation(_))));
        assert!(matches!(validate_span(t + 1, t), Err(EngineError::Validation(_))));
        assert_eq!(validate_span(t, t + H).unwrap(), Span::new(t, t + H));
    }

    #[test]
    fn validate_span_bounds() {
        use crate::limits::*;
        assert!(matches!(
            validate_span(MIN_VALID_TIMESTAMP_MS - 1, MIN_VALID_TIMESTAMP_MS + H),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(validate_span(MIN_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS + H).is_ok());
        assert!(validate_span(MAX_VALID_TIMESTAMP_MS - H, MAX_VALID_TIMESTAMP_MS).is_ok());
        let t = 1_735_689_600_000;
        assert!(validate_span(t, t + MAX_SPAN_DURATION_MS).is_ok());
        assert!(matches!(
            validate_span(t, t + MAX_SPAN_DURATION_MS + 1),
            Err(EngineError::LimitExceeded("booking too long"))
        ));
    }
}
