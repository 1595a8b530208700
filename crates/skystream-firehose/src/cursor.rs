//! Sequence tracking for cursor persistence and gap detection.

/// Outcome of observing a sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// Whether the cursor moved forward.
    pub advanced: bool,
    /// Missing range `(after, before)` when `seq` skipped past `last + 1`.
    /// Advisory only: not every event kind is guaranteed a contiguous seq.
    pub gap: Option<(i64, i64)>,
}

impl Observation {
    pub fn is_gap(&self) -> bool {
        self.gap.is_some()
    }
}

/// Last fully processed sequence number.
///
/// Owned by the receive loop; only advanced after the event for `seq` has
/// been handed to the sink.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    last: Option<i64>,
}

impl SequenceTracker {
    pub fn new(last: Option<i64>) -> Self {
        Self { last }
    }

    /// Record `seq`. Lower values (replays) leave the cursor unchanged.
    pub fn observe(&mut self, seq: i64) -> Observation {
        match self.last {
            None => {
                self.last = Some(seq);
                Observation {
                    advanced: true,
                    gap: None,
                }
            }
            Some(last) if seq >= last => {
                self.last = Some(seq);
                let gap = (seq > last.saturating_add(1)).then_some((last, seq));
                Observation {
                    advanced: seq > last,
                    gap,
                }
            }
            Some(_) => Observation {
                advanced: false,
                gap: None,
            },
        }
    }

    /// Current cursor for persistence.
    pub fn snapshot(&self) -> Option<i64> {
        self.last
    }

    /// Reposition to a server-confirmed replay point.
    pub fn resume_from(&mut self, cursor: Option<i64>) {
        self.last = cursor;
    }
}
