use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

pub type SharedCalendar = Arc<RwLock<InstructorCalendar>>;

/// One instructor's calendar plus the mutex that serializes mutations on it.
///
/// Checks only ever take `calendar` for reading. Mutations hold `commit_lock`
/// for their whole duration and take `calendar` for writing only to apply an
/// event that is already durable.
pub struct InstructorSlot {
    pub commit_lock: Arc<Mutex<()>>,
    pub calendar: SharedCalendar,
}

impl InstructorSlot {
    pub fn new(calendar: InstructorCalendar) -> Self {
        Self {
            commit_lock: Arc::new(Mutex::new(())),
            calendar: Arc::new(RwLock::new(calendar)),
        }
    }
}

/// Something `apply_event` can fetch calendars from by instructor id.
pub(super) trait CalendarSet {
    fn calendar_mut(&mut self, id: &Ulid) -> Option<&mut InstructorCalendar>;
}

impl CalendarSet for HashMap<Ulid, InstructorCalendar> {
    fn calendar_mut(&mut self, id: &Ulid) -> Option<&mut InstructorCalendar> {
        self.get_mut(id)
    }
}

/// Write guards on a locked instructor set, ascending by id.
pub(super) struct WriteSet(pub(super) Vec<(Ulid, OwnedRwLockWriteGuard<InstructorCalendar>)>);

impl CalendarSet for WriteSet {
    fn calendar_mut(&mut self, id: &Ulid) -> Option<&mut InstructorCalendar> {
        self.0
            .iter_mut()
            .find(|(held, _)| held == id)
            .map(|(_, guard)| &mut **guard)
    }
}

/// An in-flight claim on a booking id, released on drop.
pub(super) struct BookingIdClaim<'a> {
    pending: &'a DashMap<Ulid, ()>,
    id: Ulid,
}

impl Drop for BookingIdClaim<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// The organization's interval store: per-instructor calendars, the booking
/// registry (every lifecycle state) and the blackout → instructor index.
pub struct IntervalStore {
    instructors: DashMap<Ulid, Arc<InstructorSlot>>,
    bookings: DashMap<Ulid, Booking>,
    /// Booking ids a mutation is currently writing. Instructor locks alone
    /// cannot order two writers of one id on disjoint instructor sets.
    pending_bookings: DashMap<Ulid, ()>,
    blackout_owner: DashMap<Ulid, Ulid>,
}

impl Default for IntervalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IntervalStore {
    pub fn new() -> Self {
        Self {
            instructors: DashMap::new(),
            bookings: DashMap::new(),
            pending_bookings: DashMap::new(),
            blackout_owner: DashMap::new(),
        }
    }

    /// Rebuild state from a replayed log. Nothing is shared yet, so calendars
    /// are built unlocked and wrapped at the end.
    pub fn from_events(events: &[Event]) -> Self {
        let store = Self::new();
        let mut calendars: HashMap<Ulid, InstructorCalendar> = HashMap::new();
        for event in events {
            if let Event::InstructorUpserted { id, active } = event {
                calendars
                    .entry(*id)
                    .or_insert_with(|| InstructorCalendar::new(*id, *active));
            }
            store.apply_event(event, &mut calendars);
        }
        for (id, calendar) in calendars {
            store.instructors.insert(id, Arc::new(InstructorSlot::new(calendar)));
        }
        store
    }

    // ── Instructors ──────────────────────────────────────────

    pub fn instructor_count(&self) -> usize {
        self.instructors.len()
    }

    pub fn contains_instructor(&self, id: &Ulid) -> bool {
        self.instructors.contains_key(id)
    }

    pub fn slot(&self, id: &Ulid) -> Option<Arc<InstructorSlot>> {
        self.instructors.get(id).map(|e| e.value().clone())
    }

    pub fn insert_slot(&self, id: Ulid, slot: Arc<InstructorSlot>) {
        self.instructors.insert(id, slot);
    }

    /// Ascending, which is also the global lock order.
    pub fn instructor_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.instructors.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    // ── Booking registry ─────────────────────────────────────

    pub fn booking(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub fn bookings_where(&self, mut pred: impl FnMut(&Booking) -> bool) -> Vec<Booking> {
        let mut found: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|e| pred(e.value()))
            .map(|e| e.value().clone())
            .collect();
        found.sort_by_key(|b| (b.span.start, b.id));
        found
    }

    /// Claim `id` for one writer. `None` while another mutation holds it.
    /// The registry is updated before the claim drops, so a later claimant
    /// always sees the previous writer's outcome.
    pub(super) fn claim_booking_id(&self, id: Ulid) -> Option<BookingIdClaim<'_>> {
        match self.pending_bookings.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(BookingIdClaim {
                    pending: &self.pending_bookings,
                    id,
                })
            }
        }
    }

    // ── Blackout index ───────────────────────────────────────

    pub fn blackout_owner(&self, id: &Ulid) -> Option<Ulid> {
        self.blackout_owner.get(id).map(|e| *e.value())
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event to the registry and to the calendars the caller holds.
    /// Calendars missing from `calendars` are skipped; callers hold every
    /// instructor the event touches.
    pub(super) fn apply_event(&self, event: &Event, calendars: &mut impl CalendarSet) {
        match event {
            Event::InstructorUpserted { id, active } => {
                if let Some(cal) = calendars.calendar_mut(id) {
                    cal.active = *active;
                }
            }
            Event::BlackoutAdded { blackout } => {
                if let Some(cal) = calendars.calendar_mut(&blackout.instructor_id) {
                    cal.insert_blackout(blackout.clone());
                    self.blackout_owner.insert(blackout.id, blackout.instructor_id);
                }
            }
            Event::BlackoutRemoved { id, instructor_id } => {
                if let Some(cal) = calendars.calendar_mut(instructor_id) {
                    cal.remove_blackout(*id);
                }
                self.blackout_owner.remove(id);
            }
            Event::BookingProposed { booking } => {
                let mut booking = booking.clone();
                booking.state = BookingState::Tentative;
                self.bookings.insert(booking.id, booking);
            }
            Event::BookingCommitted { booking } => {
                let mut booking = booking.clone();
                booking.state = BookingState::Committed;
                let shared = Arc::new(booking.clone());
                for instructor_id in &booking.instructor_ids {
                    if let Some(cal) = calendars.calendar_mut(instructor_id) {
                        cal.insert_booking(shared.clone());
                    }
                }
                self.bookings.insert(booking.id, booking);
            }
            Event::BookingCancelled { id } => {
                if let Some(mut entry) = self.bookings.get_mut(id) {
                    if entry.state == BookingState::Committed {
                        for instructor_id in &entry.instructor_ids {
                            if let Some(cal) = calendars.calendar_mut(instructor_id) {
                                cal.remove_booking(*id);
                            }
                        }
                    }
                    entry.state = BookingState::Cancelled;
                }
            }
        }
    }

    /// Events that rebuild the current state. Callers must hold every commit
    /// lock so the snapshot cannot race a mutation.
    pub(super) async fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for id in self.instructor_ids() {
            let Some(slot) = self.slot(&id) else { continue };
            let cal = slot.calendar.read().await;
            events.push(Event::InstructorUpserted {
                id,
                active: cal.active,
            });
            for blackout in cal.blackouts() {
                events.push(Event::BlackoutAdded {
                    blackout: blackout.clone(),
                });
            }
        }

        let mut bookings: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        bookings.sort_by_key(|b| b.id);
        for booking in bookings {
            match booking.state {
                BookingState::Tentative => events.push(Event::BookingProposed { booking }),
                BookingState::Committed => events.push(Event::BookingCommitted { booking }),
                BookingState::Cancelled => {
                    // Tombstone keeps cancellation idempotent across compaction.
                    let id = booking.id;
                    events.push(Event::BookingProposed { booking });
                    events.push(Event::BookingCancelled { id });
                }
            }
        }
        events
    }
}
