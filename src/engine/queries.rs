use chrono::{Days, NaiveDate};
use ulid::Ulid;

use crate::limits::SCHEDULE_DAYS;
use crate::model::*;
use crate::roles::{Actor, Capability, authorize};

use super::{BookingError, Engine, today};

impl Engine {
    /// Every booking for staff, the caller's own for visitors. Newest first.
    pub fn list_bookings(&self, actor: &Actor) -> Result<Vec<Reservation>, BookingError> {
        authorize(actor, Capability::ViewOwn)?;
        let all = actor.role.allows(Capability::ViewAllBookings);
        if !all && actor.user_id.is_none() {
            return Ok(Vec::new());
        }
        let mut bookings: Vec<Reservation> = self.db.read(|t| {
            t.reservations
                .values()
                .filter(|r| all || (r.user_id.is_some() && r.user_id == actor.user_id))
                .cloned()
                .collect()
        });
        bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(bookings)
    }

    pub fn get_booking(&self, actor: &Actor, id: Ulid) -> Result<Reservation, BookingError> {
        authorize(actor, Capability::ViewOwn)?;
        let booking = self
            .db
            .read(|t| t.reservations.get(&id).cloned())
            .ok_or(BookingError::not_found("booking", id))?;
        if actor.role.allows(Capability::ViewAllBookings)
            || (booking.user_id.is_some() && booking.user_id == actor.user_id)
        {
            Ok(booking)
        } else {
            Err(BookingError::Forbidden(format!("booking {id} belongs to another user")))
        }
    }

    /// Non-cancelled reservations of one court for the coming week, in time order.
    pub fn court_schedule(&self, actor: &Actor, court_id: Ulid) -> Result<Vec<Reservation>, BookingError> {
        authorize(actor, Capability::ViewSchedule)?;
        let from = today();
        let until = from
            .checked_add_days(Days::new(SCHEDULE_DAYS))
            .unwrap_or(NaiveDate::MAX);
        self.db.read(|t| {
            if !t.courts.contains_key(&court_id) {
                return Err(BookingError::not_found("court", court_id));
            }
            let mut schedule = Vec::new();
            for date in from.iter_days().take_while(|d| *d <= until) {
                let mut day: Vec<Reservation> = t
                    .reservations_on(court_id, date)
                    .into_iter()
                    .filter(|r| r.holds_slot())
                    .cloned()
                    .collect();
                day.sort_by_key(|r| r.span.start);
                schedule.extend(day);
            }
            Ok(schedule)
        })
    }

    /// Most recent audit rows first, at most `limit`.
    pub fn audit_log(&self, actor: &Actor, limit: usize) -> Result<Vec<AuditEntry>, BookingError> {
        authorize(actor, Capability::RunIntegrity)?;
        Ok(self.db.read(|t| t.audit_log.iter().rev().take(limit).cloned().collect()))
    }

    pub fn critical_events(&self, actor: &Actor, limit: usize) -> Result<Vec<CriticalEvent>, BookingError> {
        authorize(actor, Capability::RunIntegrity)?;
        Ok(self
            .db
            .read(|t| t.critical_events.iter().rev().take(limit).cloned().collect()))
    }
}
