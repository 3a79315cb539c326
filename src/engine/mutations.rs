use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::validate_request;
use super::rules::Candidate;
use super::store::{BookingIdClaim, InstructorSlot};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Check and commit under the commit locks of every listed instructor.
    ///
    /// `id` names a Tentative booking to promote, or a new booking id; `None`
    /// generates one. On success the booking is durable and indexed before the
    /// locks are released, and any advisory conflicts come back with it.
    pub async fn propose_and_commit(
        &self,
        id: Option<Ulid>,
        instructor_ids: &[Ulid],
        start: Ms,
        end: Ms,
        location_id: Ulid,
    ) -> Result<CommitOutcome, EngineError> {
        let result = self
            .commit_inner(id, instructor_ids, start, end, location_id)
            .await;
        let outcome = match &result {
            Ok(_) => "committed",
            Err(EngineError::Conflict(_)) => "conflict",
            Err(EngineError::Busy) => "busy",
            Err(_) => "error",
        };
        metrics::counter!(crate::observability::COMMITS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn commit_inner(
        &self,
        id: Option<Ulid>,
        instructor_ids: &[Ulid],
        start: Ms,
        end: Ms,
        location_id: Ulid,
    ) -> Result<CommitOutcome, EngineError> {
        let (ids, span) = validate_request(instructor_ids, start, end)?;
        let id = id.unwrap_or_else(Ulid::new);
        let _claim = self.claim_booking_id(id)?;
        self.ensure_committable(id, &ids)?;

        let locks = self.lock_instructors(&ids).await?;
        // A cancel of the tentative booking may have landed while we waited.
        self.ensure_committable(id, &ids)?;
        locks.ensure_capacity().await?;

        let candidate = Candidate {
            span,
            location_id,
            exclude_booking_id: None,
        };
        let result = self.assess(&ids, &candidate).await?;
        if !result.available {
            return Err(EngineError::Conflict(result.conflicts));
        }

        let booking = Booking {
            id,
            instructor_ids: ids,
            span,
            location_id,
            state: BookingState::Committed,
        };
        let event = Event::BookingCommitted {
            booking: booking.clone(),
        };
        self.wal_append(&event).await?;
        self.store.apply_event(&event, &mut locks.write().await);
        info!(
            "committed booking {id} for {} instructor(s) [{}, {})",
            booking.instructor_ids.len(),
            span.start,
            span.end
        );

        Ok(CommitOutcome {
            booking,
            advisories: result.conflicts,
        })
    }

    /// Another mutation writing the same booking id makes this one `Busy`.
    fn claim_booking_id(&self, id: Ulid) -> Result<BookingIdClaim<'_>, EngineError> {
        self.store.claim_booking_id(id).ok_or_else(|| {
            warn!("booking {id} is being written by another request");
            EngineError::Busy
        })
    }

    /// A new id is always committable. A Tentative one is, if the instructor
    /// set is unchanged.
    fn ensure_committable(&self, id: Ulid, ids: &[Ulid]) -> Result<(), EngineError> {
        match self.store.booking(&id) {
            None => Ok(()),
            Some(existing) if existing.state == BookingState::Tentative => {
                if existing.instructor_ids == ids {
                    Ok(())
                } else {
                    Err(EngineError::invalid(format!(
                        "tentative booking {id} was proposed for a different set of instructors"
                    )))
                }
            }
            Some(_) => Err(EngineError::AlreadyExists(id)),
        }
    }

    /// Record a Tentative booking. It is not indexed and never blocks anything;
    /// the returned result says how a commit would fare right now.
    pub async fn record_tentative(
        &self,
        id: Option<Ulid>,
        instructor_ids: &[Ulid],
        start: Ms,
        end: Ms,
        location_id: Ulid,
    ) -> Result<(Booking, AvailabilityResult), EngineError> {
        let (ids, span) = validate_request(instructor_ids, start, end)?;
        let id = id.unwrap_or_else(Ulid::new);
        let _claim = self.claim_booking_id(id)?;
        if self.store.booking(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }

        let locks = self.lock_instructors(&ids).await?;
        let candidate = Candidate {
            span,
            location_id,
            exclude_booking_id: None,
        };
        let result = self.assess(&ids, &candidate).await?;

        let booking = Booking {
            id,
            instructor_ids: ids,
            span,
            location_id,
            state: BookingState::Tentative,
        };
        let event = Event::BookingProposed {
            booking: booking.clone(),
        };
        self.wal_append(&event).await?;
        self.store.apply_event(&event, &mut locks.write().await);
        info!("recorded tentative booking {id}");
        Ok((booking, result))
    }

    /// Cancel a booking and free its interval. Cancelling twice is a no-op.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.store.booking(&id).ok_or(EngineError::NotFound(id))?;
        if booking.state == BookingState::Cancelled {
            return Ok(booking);
        }

        let locks = self.lock_instructors(&booking.instructor_ids).await?;
        let mut booking = self.store.booking(&id).ok_or(EngineError::NotFound(id))?;
        if booking.state == BookingState::Cancelled {
            return Ok(booking);
        }

        let event = Event::BookingCancelled { id };
        self.wal_append(&event).await?;
        self.store.apply_event(&event, &mut locks.write().await);
        info!("cancelled {} booking {id}", booking.state.as_str());
        booking.state = BookingState::Cancelled;
        Ok(booking)
    }

    /// Create or update an instructor as mirrored from the identity subsystem.
    pub async fn upsert_instructor(&self, id: Ulid, active: bool) -> Result<(), EngineError> {
        let event = Event::InstructorUpserted { id, active };
        loop {
            if self.store.contains_instructor(&id) {
                let locks = self.lock_instructors(&[id]).await?;
                self.wal_append(&event).await?;
                self.store.apply_event(&event, &mut locks.write().await);
                return Ok(());
            }

            let _create = self.instructor_create.lock().await;
            if self.store.contains_instructor(&id) {
                continue;
            }
            if self.store.instructor_count() >= MAX_INSTRUCTORS_PER_ORG {
                return Err(EngineError::LimitExceeded("too many instructors"));
            }
            self.wal_append(&event).await?;
            self.store
                .insert_slot(id, Arc::new(InstructorSlot::new(InstructorCalendar::new(id, active))));
            info!("registered instructor {id}");
            return Ok(());
        }
    }

    pub async fn add_blackout(
        &self,
        id: Ulid,
        instructor_id: Ulid,
        start: Ms,
        end: Ms,
        kind: BlackoutKind,
        reason: Option<String>,
    ) -> Result<Blackout, EngineError> {
        let span = Span::try_new(start, end)
            .ok_or_else(|| EngineError::invalid("blackout start must be before end"))?;
        if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        if span.duration_ms() > MAX_SPAN_DURATION_MS {
            return Err(EngineError::LimitExceeded("window too long"));
        }
        if reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        if self.store.blackout_owner(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }

        let locks = self.lock_instructors(&[instructor_id]).await?;
        if self.store.blackout_owner(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        locks.ensure_capacity().await?;

        let blackout = Blackout {
            id,
            instructor_id,
            span,
            kind,
            reason,
        };
        let event = Event::BlackoutAdded {
            blackout: blackout.clone(),
        };
        self.wal_append(&event).await?;
        let mut calendars = locks.write().await;
        self.store.apply_event(&event, &mut calendars);

        if let Some((_, calendar)) = calendars.0.first() {
            let covered = calendar.overlapping(&span).count();
            if covered > 0 {
                warn!(
                    "{} blackout {id} for instructor {instructor_id} overlaps {covered} committed booking(s)",
                    kind.as_str()
                );
            }
        }
        Ok(blackout)
    }

    /// Remove a blackout; returns the instructor it belonged to.
    pub async fn remove_blackout(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let instructor_id = self
            .store
            .blackout_owner(&id)
            .ok_or(EngineError::NotFound(id))?;
        let locks = self.lock_instructors(&[instructor_id]).await?;
        if self.store.blackout_owner(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }

        let event = Event::BlackoutRemoved { id, instructor_id };
        self.wal_append(&event).await?;
        self.store.apply_event(&event, &mut locks.write().await);
        Ok(instructor_id)
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _create = self.instructor_create.lock().await;
        let _locks = self.lock_all().await;
        let events = self.store.snapshot_events().await;
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
        info!("compacted WAL to {count} event(s)");
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
