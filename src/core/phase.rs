use serde::Serialize;
use std::fmt;

/// Generation lifecycle of a book. Resting phases are derived from the record
/// (`StoryBook::phase`); the `*Pending` phases only exist while a request is in
/// flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum BookPhase {
    NoIdentity,
    SheetPending,
    SheetReady,
    CoverPending,
    CoverReady,
    PagesPending { remaining: usize },
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    SheetRequested,
    SheetStored,
    CoverRequested,
    CoverStored,
    /// A page image was persisted; `remaining` pages still lack one.
    PageStored { remaining: usize },
    /// The in-flight request failed. The phase falls back to where it started.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: BookPhase,
    pub event: PhaseEvent,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot apply {:?} in phase {:?}", self.event, self.from)
    }
}

impl std::error::Error for InvalidTransition {}

impl BookPhase {
    pub fn apply(self, event: PhaseEvent) -> Result<BookPhase, InvalidTransition> {
        use BookPhase::*;
        use PhaseEvent::*;

        let next = match (self, event) {
            (NoIdentity, SheetRequested) => SheetPending,
            (SheetPending, SheetStored) => SheetReady,
            (SheetPending, Failed) => NoIdentity,

            // Regenerating a cover over an existing one is allowed.
            (SheetReady | CoverReady, CoverRequested) => CoverPending,
            (CoverPending, CoverStored) => CoverReady,
            (CoverPending, Failed) => SheetReady,

            (CoverReady | PagesPending { .. }, PageStored { remaining }) => {
                if remaining == 0 {
                    Complete
                } else {
                    PagesPending { remaining }
                }
            }

            (from, event) => return Err(InvalidTransition { from, event }),
        };
        Ok(next)
    }

    /// Whether page art may be requested in this phase.
    pub fn accepts_pages(&self) -> bool {
        matches!(self, BookPhase::CoverReady | BookPhase::PagesPending { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut phase = BookPhase::NoIdentity;
        for ev in [
            PhaseEvent::SheetRequested,
            PhaseEvent::SheetStored,
            PhaseEvent::CoverRequested,
            PhaseEvent::CoverStored,
            PhaseEvent::PageStored { remaining: 1 },
            PhaseEvent::PageStored { remaining: 0 },
        ] {
            phase = phase.apply(ev).unwrap();
        }
        assert_eq!(phase, BookPhase::Complete);
    }

    #[test]
    fn test_cover_before_sheet_is_rejected() {
        let err = BookPhase::NoIdentity.apply(PhaseEvent::CoverRequested).unwrap_err();
        assert_eq!(err.from, BookPhase::NoIdentity);
    }

    #[test]
    fn test_failure_rolls_back() {
        assert_eq!(
            BookPhase::SheetPending.apply(PhaseEvent::Failed).unwrap(),
            BookPhase::NoIdentity
        );
        assert_eq!(
            BookPhase::CoverPending.apply(PhaseEvent::Failed).unwrap(),
            BookPhase::SheetReady
        );
    }

    #[test]
    fn test_pages_need_cover() {
        assert!(BookPhase::SheetReady
            .apply(PhaseEvent::PageStored { remaining: 0 })
            .is_err());
        assert!(!BookPhase::SheetReady.accepts_pages());
        assert!(BookPhase::PagesPending { remaining: 2 }.accepts_pages());
    }
}
