//! Conflict rules. Each rule looks at one candidate window against one
//! instructor's calendar and reports what it finds; none of them can fail.

use chrono_tz::Tz;
use ulid::Ulid;

use crate::model::*;
use crate::time::format_instant;

/// The window being checked, independent of which instructor it is checked against.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub span: Span,
    pub location_id: Ulid,
    /// A booking being edited: ignored by every rule.
    pub exclude_booking_id: Option<Ulid>,
}

#[derive(Debug, Clone, Copy)]
pub struct RuleSettings {
    pub travel_buffer_ms: Ms,
    pub travel_buffer_severity: Severity,
    pub timezone: Tz,
}

pub type Rule = fn(&Candidate, &InstructorCalendar, &RuleSettings) -> Vec<Conflict>;

/// Every rule the checker runs, in evaluation order.
pub const RULES: [Rule; 3] = [overlap_rule, blackout_rule, travel_buffer_rule];

pub fn evaluate(
    candidate: &Candidate,
    calendar: &InstructorCalendar,
    settings: &RuleSettings,
) -> Vec<Conflict> {
    RULES
        .iter()
        .flat_map(|rule| rule(candidate, calendar, settings))
        .collect()
}

/// One blocking conflict per committed booking sharing any instant with the candidate.
pub fn overlap_rule(
    candidate: &Candidate,
    calendar: &InstructorCalendar,
    settings: &RuleSettings,
) -> Vec<Conflict> {
    calendar
        .overlapping(&candidate.span)
        .filter(|b| Some(b.id) != candidate.exclude_booking_id)
        .map(|b| Conflict {
            kind: ConflictKind::Overlap,
            instructor_id: calendar.id,
            severity: Severity::Blocking,
            message: format!(
                "instructor {} already booked {}",
                calendar.id,
                window(&b.span, settings.timezone)
            ),
            source: ConflictSource::Booking(b.id),
        })
        .collect()
}

/// Total blackouts block on any overlap, partial ones only when they fully
/// contain the candidate.
pub fn blackout_rule(
    candidate: &Candidate,
    calendar: &InstructorCalendar,
    settings: &RuleSettings,
) -> Vec<Conflict> {
    calendar
        .overlapping_blackouts(&candidate.span)
        .filter_map(|blackout| {
            let kind = match blackout.kind {
                BlackoutKind::Total => ConflictKind::TotalBlackout,
                BlackoutKind::Partial if blackout.span.contains_span(&candidate.span) => {
                    ConflictKind::PartialBlackout
                }
                BlackoutKind::Partial => return None,
            };
            let mut message = format!(
                "instructor {} has a {} blackout {}",
                calendar.id,
                blackout.kind.as_str(),
                window(&blackout.span, settings.timezone)
            );
            if let Some(reason) = &blackout.reason {
                message.push_str(": ");
                message.push_str(reason);
            }
            Some(Conflict {
                kind,
                instructor_id: calendar.id,
                severity: Severity::Blocking,
                message,
                source: ConflictSource::Blackout(blackout.id),
            })
        })
        .collect()
}

/// Neighbouring bookings at another location closer than the travel buffer.
pub fn travel_buffer_rule(
    candidate: &Candidate,
    calendar: &InstructorCalendar,
    settings: &RuleSettings,
) -> Vec<Conflict> {
    if settings.travel_buffer_ms <= 0 {
        return Vec::new();
    }
    let exclude = candidate.exclude_booking_id;
    let before = calendar
        .nearest_before(candidate.span.start, exclude)
        .map(|b| (b, candidate.span.start - b.span.end));
    let after = calendar
        .nearest_after(candidate.span.end, exclude)
        .map(|b| (b, b.span.start - candidate.span.end));

    [before, after]
        .into_iter()
        .flatten()
        .filter(|(b, gap)| b.location_id != candidate.location_id && *gap < settings.travel_buffer_ms)
        .map(|(b, gap)| Conflict {
            kind: ConflictKind::TravelBuffer,
            instructor_id: calendar.id,
            severity: settings.travel_buffer_severity,
            message: format!(
                "instructor {} has {} min between this event and booking {} at location {}; {} min needed",
                calendar.id,
                gap / MINUTE_MS,
                window(&b.span, settings.timezone),
                b.location_id,
                settings.travel_buffer_ms / MINUTE_MS
            ),
            source: ConflictSource::Booking(b.id),
        })
        .collect()
}

fn window(span: &Span, tz: Tz) -> String {
    format!("{}..{}", format_instant(span.start, tz), format_instant(span.end, tz))
}
