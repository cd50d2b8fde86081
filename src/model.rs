use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every timestamp in the engine uses this.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// A booking ending exactly when another starts does not overlap it.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 3] = [
        BookingStatus::Pending,
        BookingStatus::Confirmed,
        BookingStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown booking status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for BookingStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A reservation of one resource for one interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub resource_id: Ulid,
    /// Authenticated subject that made the booking.
    pub requester_id: String,
    pub span: Span,
    pub contact_name: String,
    pub contact_email: String,
    pub notes: Option<String>,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// Input to `Engine::create_booking`. Field shape is validated upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    /// Caller-chosen id; the engine assigns one when absent.
    pub id: Option<Ulid>,
    pub resource_id: Ulid,
    pub requester_id: String,
    pub start: Ms,
    pub end: Ms,
    pub contact_name: String,
    pub contact_email: String,
    pub notes: Option<String>,
}

/// Partial edit of an existing booking. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub contact_name: Option<String>,
    pub contact_email: Option<String>,
    pub notes: Option<String>,
}

impl BookingPatch {
    pub fn interval(start: Option<Ms>, end: Option<Ms>) -> Self {
        Self {
            start,
            end,
            ..Default::default()
        }
    }

    pub fn touches_interval(&self) -> bool {
        self.start.is_some() || self.end.is_some()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub title: String,
    pub description: String,
    /// Whether the resource accepts new bookings at all.
    pub available: bool,
    /// All bookings on this resource, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl ResourceState {
    pub fn new(id: Ulid, title: String, description: String, available: bool) -> Self {
        Self {
            id,
            title,
            description,
            available,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    /// Remove booking by id.
    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// Return only bookings whose span overlaps the query window, earliest start first.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            title: self.title.clone(),
            description: self.description.clone(),
            available: self.available,
            booking_count: self.bookings.len(),
        }
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        title: String,
        description: String,
        available: bool,
    },
    ResourceUpdated {
        id: Ulid,
        title: String,
        description: String,
        available: bool,
    },
    ResourceDeleted {
        id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    /// Full replacement of a booking's record (reschedule, contact edit, status change).
    BookingUpdated {
        booking: Booking,
    },
    BookingRemoved {
        id: Ulid,
        resource_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub title: String,
    pub description: String,
    pub available: bool,
    pub booking_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(start: Ms, end: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            requester_id: "user-1".into(),
            span: Span::new(start, end),
            contact_name: "Ada".into(),
            contact_email: "ada@example.com".into(),
            notes: None,
            status: BookingStatus::Pending,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn resource() -> ResourceState {
        ResourceState::new(Ulid::new(), "Desk 1".into(), String::new(), true)
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_overlap_is_symmetric() {
        let spans = [
            Span::new(0, 10),
            Span::new(5, 15),
            Span::new(10, 20),
            Span::new(2, 3),
            Span::new(-5, 0),
            Span::new(0, 30),
        ];
        for a in &spans {
            for b in &spans {
                assert_eq!(a.overlaps(b), b.overlaps(a), "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn status_parse_and_display() {
        for status in BookingStatus::ALL {
            assert_eq!(status.to_string().parse::<BookingStatus>().unwrap(), status);
        }
        assert_eq!("CONFIRMED".parse::<BookingStatus>().unwrap(), BookingStatus::Confirmed);
        assert_eq!("canceled".parse::<BookingStatus>().unwrap(), BookingStatus::Cancelled);
        assert!("archived".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn booking_ordering() {
        let mut rs = resource();
        rs.insert_booking(booking(300, 400));
        rs.insert_booking(booking(100, 200));
        rs.insert_booking(booking(200, 300));
        let starts: Vec<Ms> = rs.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn equal_starts_keep_insertion_order() {
        let mut rs = resource();
        let first = booking(100, 200);
        let second = booking(100, 300);
        rs.insert_booking(first.clone());
        rs.insert_booking(second.clone());
        assert_eq!(rs.bookings[0].id, first.id);
        assert_eq!(rs.bookings[1].id, second.id);
    }

    #[test]
    fn remove_nonexistent_returns_none() {
        let mut rs = resource();
        rs.insert_booking(booking(100, 200));
        assert!(rs.remove_booking(Ulid::new()).is_none());
        assert_eq!(rs.bookings.len(), 1);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut rs = resource();
        rs.insert_booking(booking(100, 200));
        rs.insert_booking(booking(450, 600));
        rs.insert_booking(booking(1000, 1100));

        let hits: Vec<_> = rs.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut rs = resource();
        rs.insert_booking(booking(100, 200));
        rs.insert_booking(booking(300, 400));
        assert_eq!(rs.overlapping(&Span::new(200, 300)).count(), 0);
    }

    #[test]
    fn overlapping_long_booking_spanning_query() {
        let mut rs = resource();
        rs.insert_booking(booking(0, 10_000));
        assert_eq!(rs.overlapping(&Span::new(500, 600)).count(), 1);
    }

    #[test]
    fn patch_helpers() {
        assert!(BookingPatch::default().is_empty());
        assert!(!BookingPatch::default().touches_interval());
        let p = BookingPatch::interval(None, Some(10));
        assert!(p.touches_interval());
        assert!(!p.is_empty());
        let contact_only = BookingPatch {
            contact_name: Some("Bo".into()),
            ..Default::default()
        };
        assert!(!contact_only.touches_interval());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated { booking: booking(100, 200) };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn booking_serializes_lowercase_status() {
        let b = booking(100, 200);
        let json = serde_json::to_value(&b).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["span"]["start"], 100);
        assert_eq!(json["contact_email"], "ada@example.com");
    }
}
