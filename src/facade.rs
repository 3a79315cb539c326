//! The two operations external collaborators call, with ISO-8601 instants on
//! the way in, organization-timezone instants on the way out and JSON-shaped
//! errors.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::time::{TimeError, format_instant, parse_window};

#[derive(Debug, Clone, Deserialize)]
pub struct CheckAvailabilityRequest {
    pub instructor_ids: Vec<Ulid>,
    pub start: String,
    pub end: String,
    pub location_id: Ulid,
    #[serde(default)]
    pub exclude_booking_id: Option<Ulid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitRequest {
    /// Promote this Tentative booking, or use it as the new booking's id.
    #[serde(default)]
    pub id: Option<Ulid>,
    pub instructor_ids: Vec<Ulid>,
    pub start: String,
    pub end: String,
    pub location_id: Ulid,
}

/// A booking as collaborators see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingView {
    pub id: Ulid,
    pub instructor_ids: Vec<Ulid>,
    pub start: String,
    pub end: String,
    pub location_id: Ulid,
    pub state: BookingState,
    pub advisories: Vec<Conflict>,
}

impl BookingView {
    pub fn render(booking: &Booking, advisories: Vec<Conflict>, tz: chrono_tz::Tz) -> Self {
        Self {
            id: booking.id,
            instructor_ids: booking.instructor_ids.clone(),
            start: format_instant(booking.span.start, tz),
            end: format_instant(booking.span.end, tz),
            location_id: booking.location_id,
            state: booking.state,
            advisories,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "error")]
pub enum FacadeError {
    InvalidInput { message: String },
    Conflict { conflicts: Vec<Conflict> },
    Busy,
    StoreUnavailable { message: String },
    NotFound { id: Ulid },
    AlreadyExists { id: Ulid },
}

impl FacadeError {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }
}

impl From<EngineError> for FacadeError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::InvalidInput(message) => FacadeError::InvalidInput { message },
            EngineError::LimitExceeded(what) => FacadeError::InvalidInput {
                message: format!("limit exceeded: {what}"),
            },
            EngineError::Conflict(conflicts) => FacadeError::Conflict { conflicts },
            EngineError::Busy => FacadeError::Busy,
            EngineError::StoreUnavailable(message) => FacadeError::StoreUnavailable { message },
            EngineError::NotFound(id) => FacadeError::NotFound { id },
            EngineError::AlreadyExists(id) => FacadeError::AlreadyExists { id },
        }
    }
}

impl From<TimeError> for FacadeError {
    fn from(e: TimeError) -> Self {
        FacadeError::InvalidInput {
            message: e.to_string(),
        }
    }
}

impl std::fmt::Display for FacadeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_json())
    }
}

impl std::error::Error for FacadeError {}

#[derive(Clone)]
pub struct QueryFacade {
    engine: Arc<Engine>,
}

impl QueryFacade {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub async fn check_availability(
        &self,
        req: &CheckAvailabilityRequest,
    ) -> Result<AvailabilityResult, FacadeError> {
        let span = parse_window(&req.start, &req.end, self.engine.config.timezone)?;
        Ok(self
            .engine
            .check(
                &req.instructor_ids,
                span.start,
                span.end,
                req.location_id,
                req.exclude_booking_id,
            )
            .await?)
    }

    pub async fn commit(&self, req: &CommitRequest) -> Result<BookingView, FacadeError> {
        let span = parse_window(&req.start, &req.end, self.engine.config.timezone)?;
        let outcome = self
            .engine
            .propose_and_commit(req.id, &req.instructor_ids, span.start, span.end, req.location_id)
            .await?;
        Ok(BookingView::render(
            &outcome.booking,
            outcome.advisories,
            self.engine.config.timezone,
        ))
    }
}
