use crate::model::BookingStatus;

use super::EngineError;

/// Outcome of a legal status change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Requested the current status; nothing to persist.
    Unchanged,
    Changed(BookingStatus),
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        self == BookingStatus::Cancelled
    }

    /// `pending → confirmed`, `pending → cancelled`, `confirmed → cancelled`.
    /// Nothing leaves `cancelled`.
    pub fn transition_to(self, next: BookingStatus) -> Result<Transition, EngineError> {
        use BookingStatus::*;
        match (self, next) {
            (from, to) if from == to => Ok(Transition::Unchanged),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Cancelled) => {
                Ok(Transition::Changed(next))
            }
            (from, to) => Err(EngineError::InvalidTransition { from, to }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BookingStatus::*;

    #[test]
    fn legal_edges() {
        assert_eq!(Pending.transition_to(Confirmed).unwrap(), Transition::Changed(Confirmed));
        assert_eq!(Pending.transition_to(Cancelled).unwrap(), Transition::Changed(Cancelled));
        assert_eq!(Confirmed.transition_to(Cancelled).unwrap(), Transition::Changed(Cancelled));
    }

    #[test]
    fn self_transition_is_noop() {
        for s in BookingStatus::ALL {
            assert_eq!(s.transition_to(s).unwrap(), Transition::Unchanged);
        }
    }

    #[test]
    fn illegal_edges() {
        for (from, to) in [(Cancelled, Confirmed), (Cancelled, Pending), (Confirmed, Pending)] {
            match from.transition_to(to) {
                Err(EngineError::InvalidTransition { from: f, to: t }) => {
                    assert_eq!((f, t), (from, to));
                }
                other => panic!("{from} -> {to}: expected InvalidTransition, got {other:?}"),
            }
        }
    }

    #[test]
    fn only_cancelled_is_terminal() {
        assert!(Cancelled.is_terminal());
        assert!(!Pending.is_terminal());
        assert!(!Confirmed.is_terminal());
    }
}
