use ulid::Ulid;

use crate::model::*;

use super::Engine;

impl Engine {
    /// All instructors, ascending by id.
    pub async fn list_instructors(&self) -> Vec<InstructorInfo> {
        let mut out = Vec::with_capacity(self.store.instructor_count());
        for id in self.store.instructor_ids() {
            if let Some(slot) = self.store.slot(&id) {
                let active = slot.calendar.read().await.active;
                out.push(InstructorInfo { id, active });
            }
        }
        out
    }

    pub fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        self.store.booking(id)
    }

    /// Bookings in any state that involve `instructor_id`, by start time.
    pub fn bookings_for_instructor(&self, instructor_id: &Ulid) -> Vec<Booking> {
        self.store
            .bookings_where(|b| b.instructor_ids.contains(instructor_id))
    }

    /// Unknown instructors have no blackouts.
    pub async fn blackouts_for_instructor(&self, instructor_id: &Ulid) -> Vec<Blackout> {
        match self.store.slot(instructor_id) {
            Some(slot) => slot.calendar.read().await.blackouts().to_vec(),
            None => Vec::new(),
        }
    }
}
