use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::limits::MAX_BOOKING_DAYS_AHEAD;
use crate::model::*;

use super::{BookingError, Engine};

/// First non-cancelled reservation whose span intersects `span`.
///
/// Half-open semantics: touching endpoints never conflict. `exclude` skips
/// the reservation being re-validated.
pub fn find_conflict<'a>(
    existing: impl IntoIterator<Item = &'a Reservation>,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<&'a Reservation> {
    existing
        .into_iter()
        .filter(|r| Some(r.id) != exclude)
        .find(|r| r.holds_slot() && r.span.overlaps(span))
}

pub fn check_no_conflict(
    existing: &[Reservation],
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), BookingError> {
    match find_conflict(existing, span, exclude) {
        Some(r) => Err(BookingError::Conflict {
            reservation: r.id,
            holder: r.requester_name.clone(),
        }),
        None => Ok(()),
    }
}

/// Reject empty or inverted intervals, past dates, and dates too far ahead.
pub(crate) fn validate_interval(
    date: NaiveDate,
    start: NaiveTime,
    end: NaiveTime,
    today: NaiveDate,
) -> Result<Span, BookingError> {
    let span = Span::try_new(start, end).ok_or_else(|| {
        BookingError::InvalidInterval(format!("end {end} must be after start {start}"))
    })?;
    if date < today {
        return Err(BookingError::InvalidInterval(format!(
            "date {date} is in the past"
        )));
    }
    if (date - today).num_days() > MAX_BOOKING_DAYS_AHEAD as i64 {
        return Err(BookingError::LimitExceeded("booking date too far ahead"));
    }
    Ok(span)
}

impl Engine {
    /// Read-only overlap check against committed state.
    ///
    /// Advisory outside the court/day lock; `create_booking` repeats it inside
    /// its transaction.
    pub fn has_conflict(&self, court_id: Ulid, date: NaiveDate, start: NaiveTime, end: NaiveTime) -> bool {
        let Some(span) = Span::try_new(start, end) else {
            return false;
        };
        self.db.read(|t| {
            find_conflict(t.reservations_on(court_id, date), &span, None).is_some()
        })
    }
}
