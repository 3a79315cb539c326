use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::rules::{Candidate, evaluate};
use super::store::InstructorSlot;
use super::{Engine, EngineError};

/// Validate the shape of a request: a sane window and a non-empty list of
/// distinct instructors. Returns the ids sorted ascending.
pub(super) fn validate_request(
    instructor_ids: &[Ulid],
    start: Ms,
    end: Ms,
) -> Result<(Vec<Ulid>, Span), EngineError> {
    let span = Span::try_new(start, end)
        .ok_or_else(|| EngineError::invalid("window start must be before end"))?;
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("window too long"));
    }

    if instructor_ids.is_empty() {
        return Err(EngineError::invalid("at least one instructor is required"));
    }
    if instructor_ids.len() > MAX_INSTRUCTORS_PER_REQUEST {
        return Err(EngineError::LimitExceeded("too many instructors in one request"));
    }
    let mut ids = instructor_ids.to_vec();
    ids.sort();
    if let Some(dup) = ids.windows(2).find(|w| w[0] == w[1]) {
        return Err(EngineError::invalid(format!("instructor {} listed twice", dup[0])));
    }
    Ok((ids, span))
}

impl Engine {
    /// Read-only availability check. Takes no commit locks, so the answer may
    /// be stale by the time a commit is attempted.
    pub async fn check(
        &self,
        instructor_ids: &[Ulid],
        start: Ms,
        end: Ms,
        location_id: Ulid,
        exclude_booking_id: Option<Ulid>,
    ) -> Result<AvailabilityResult, EngineError> {
        let started = Instant::now();
        let (ids, span) = validate_request(instructor_ids, start, end)?;
        let candidate = Candidate {
            span,
            location_id,
            exclude_booking_id,
        };
        let result = self.assess(&ids, &candidate).await?;

        metrics::histogram!(crate::observability::CHECK_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        metrics::counter!(
            crate::observability::CHECKS_TOTAL,
            "verdict" => if result.available { "available" } else { "unavailable" }
        )
        .increment(1);
        for c in &result.conflicts {
            metrics::counter!(
                crate::observability::CONFLICTS_TOTAL,
                "kind" => c.kind.as_str(),
                "severity" => if c.is_blocking() { "blocking" } else { "advisory" }
            )
            .increment(1);
        }
        debug!(
            "check {} instructor(s) [{}, {}): available={} conflicts={}",
            ids.len(),
            span.start,
            span.end,
            result.available,
            result.conflicts.len()
        );
        Ok(result)
    }

    /// Run every rule for every instructor, concurrently across instructors.
    /// `ids` must be sorted. Also used inside the commit path, where the caller
    /// already holds the commit locks; calendar read locks are taken one at a time.
    pub(super) async fn assess(
        &self,
        ids: &[Ulid],
        candidate: &Candidate,
    ) -> Result<AvailabilityResult, EngineError> {
        let slots = self.resolve_slots(ids)?;
        let settings = self.rule_settings();

        let per_instructor = join_all(slots.iter().map(|slot| async move {
            let calendar = slot.calendar.read().await;
            if !calendar.active {
                return Err(EngineError::invalid(format!(
                    "instructor {} is inactive",
                    calendar.id
                )));
            }
            Ok(evaluate(candidate, &calendar, &settings))
        }))
        .await;

        let mut conflicts = Vec::new();
        for found in per_instructor {
            conflicts.extend(found?);
        }
        Ok(AvailabilityResult::from_conflicts(conflicts))
    }

    pub(super) fn resolve_slots(&self, ids: &[Ulid]) -> Result<Vec<Arc<InstructorSlot>>, EngineError> {
        ids.iter()
            .map(|id| {
                self.store
                    .slot(id)
                    .ok_or_else(|| EngineError::invalid(format!("unknown instructor {id}")))
            })
            .collect()
    }
}
