use std::sync::Arc;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every instant is normalized to this before comparison.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Fallible constructor for untrusted input.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingState {
    Tentative,
    Committed,
    Cancelled,
}

impl BookingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingState::Tentative => "tentative",
            BookingState::Committed => "committed",
            BookingState::Cancelled => "cancelled",
        }
    }
}

/// A scheduled event occupying one or more instructors at a location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    /// Sorted ascending, no duplicates.
    pub instructor_ids: Vec<Ulid>,
    pub span: Span,
    pub location_id: Ulid,
    pub state: BookingState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlackoutKind {
    /// Blocks any overlapping candidate.
    Total,
    /// Blocks only candidates fully inside the window.
    Partial,
}

impl BlackoutKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlackoutKind::Total => "total",
            BlackoutKind::Partial => "partial",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blackout {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub span: Span,
    pub kind: BlackoutKind,
    pub reason: Option<String>,
}

// ── Conflicts ────────────────────────────────────────────────────

/// Declaration order is the output order of the checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConflictKind {
    Overlap,
    TotalBlackout,
    PartialBlackout,
    TravelBuffer,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::Overlap => "overlap",
            ConflictKind::TotalBlackout => "total_blackout",
            ConflictKind::PartialBlackout => "partial_blackout",
            ConflictKind::TravelBuffer => "travel_buffer",
        }
    }
}

/// Declaration order is the output order of the checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Blocking,
    Advisory,
}

/// What a conflict points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ConflictSource {
    Booking(Ulid),
    Blackout(Ulid),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub instructor_id: Ulid,
    pub severity: Severity,
    pub message: String,
    pub source: ConflictSource,
}

impl Conflict {
    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityResult {
    pub available: bool,
    pub conflicts: Vec<Conflict>,
}

impl AvailabilityResult {
    /// Orders the conflicts and derives the verdict from them.
    pub fn from_conflicts(mut conflicts: Vec<Conflict>) -> Self {
        // Stable: ties keep evaluation order, which is calendar order per instructor.
        conflicts.sort_by(|a, b| {
            a.severity
                .cmp(&b.severity)
                .then(a.kind.cmp(&b.kind))
                .then(a.instructor_id.cmp(&b.instructor_id))
        });
        let available = !conflicts.iter().any(Conflict::is_blocking);
        Self {
            available,
            conflicts,
        }
    }

    pub fn blocking(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|c| c.is_blocking())
    }
}

// ── Per-instructor calendar ──────────────────────────────────────

/// Committed bookings and blackouts of one instructor.
///
/// `bookings` is sorted by `span.start` and pairwise disjoint (the commit path
/// guarantees it), which makes it sorted by `span.end` too. `blackouts` is
/// sorted by `span.start` and may self-overlap.
#[derive(Debug, Clone)]
pub struct InstructorCalendar {
    pub id: Ulid,
    pub active: bool,
    bookings: Vec<Arc<Booking>>,
    blackouts: Vec<Blackout>,
    /// Upper bound on any blackout's duration, used to bound overlap scans.
    longest_blackout: Ms,
}

impl InstructorCalendar {
    pub fn new(id: Ulid, active: bool) -> Self {
        Self {
            id,
            active,
            bookings: Vec::new(),
            blackouts: Vec::new(),
            longest_blackout: 0,
        }
    }

    pub fn bookings(&self) -> &[Arc<Booking>] {
        &self.bookings
    }

    pub fn blackouts(&self) -> &[Blackout] {
        &self.blackouts
    }

    pub fn interval_count(&self) -> usize {
        self.bookings.len() + self.blackouts.len()
    }

    pub fn insert_booking(&mut self, booking: Arc<Booking>) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start < booking.span.start);
        debug_assert!(
            pos == 0 || self.bookings[pos - 1].span.end <= booking.span.start,
            "committed bookings must not overlap"
        );
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Arc<Booking>> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn insert_blackout(&mut self, blackout: Blackout) {
        self.longest_blackout = self.longest_blackout.max(blackout.span.duration_ms());
        let pos = self
            .blackouts
            .partition_point(|b| b.span.start <= blackout.span.start);
        self.blackouts.insert(pos, blackout);
    }

    pub fn remove_blackout(&mut self, id: Ulid) -> Option<Blackout> {
        let pos = self.blackouts.iter().position(|b| b.id == id)?;
        let removed = self.blackouts.remove(pos);
        if removed.span.duration_ms() == self.longest_blackout {
            self.longest_blackout = self
                .blackouts
                .iter()
                .map(|b| b.span.duration_ms())
                .max()
                .unwrap_or(0);
        }
        Some(removed)
    }

    /// Committed bookings overlapping `query`, in start order.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Arc<Booking>> {
        let lo = self.bookings.partition_point(|b| b.span.end <= query.start);
        let hi = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[lo..hi.max(lo)].iter()
    }

    /// Blackouts overlapping `query`, in start order.
    pub fn overlapping_blackouts(&self, query: &Span) -> impl Iterator<Item = &Blackout> {
        // A blackout starting at or before `query.start - longest` ends at or before `query.start`.
        let floor = query.start.saturating_sub(self.longest_blackout);
        let lo = self.blackouts.partition_point(|b| b.span.start <= floor);
        let hi = self.blackouts.partition_point(|b| b.span.start < query.end);
        self.blackouts[lo..hi.max(lo)]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// Latest committed booking ending at or before `t`, skipping `exclude`.
    pub fn nearest_before(&self, t: Ms, exclude: Option<Ulid>) -> Option<&Arc<Booking>> {
        let idx = self.bookings.partition_point(|b| b.span.end <= t);
        self.bookings[..idx]
            .iter()
            .rev()
            .find(|b| Some(b.id) != exclude)
    }

    /// Earliest committed booking starting at or after `t`, skipping `exclude`.
    pub fn nearest_after(&self, t: Ms, exclude: Option<Ulid>) -> Option<&Arc<Booking>> {
        let idx = self.bookings.partition_point(|b| b.span.start < t);
        self.bookings[idx..].iter().find(|b| Some(b.id) != exclude)
    }
}

/// Flat event records. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    InstructorUpserted {
        id: Ulid,
        active: bool,
    },
    BlackoutAdded {
        blackout: Blackout,
    },
    BlackoutRemoved {
        id: Ulid,
        instructor_id: Ulid,
    },
    BookingProposed {
        booking: Booking,
    },
    BookingCommitted {
        booking: Booking,
    },
    BookingCancelled {
        id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructorInfo {
    pub id: Ulid,
    pub active: bool,
}

/// Outcome of a successful commit; advisories never block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub booking: Booking,
    pub advisories: Vec<Conflict>,
}
