use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{BookingError, Engine};

// ── Availability Algorithm ────────────────────────────────────────

/// Free sub-intervals of `hours` left after removing every reservation that
/// still holds its slot. Reservations may extend past opening hours; they
/// are clamped.
pub fn free_spans(hours: Span, reservations: &[Reservation]) -> Vec<Span> {
    let mut taken: Vec<Span> = reservations
        .iter()
        .filter(|r| r.holds_slot() && r.span.overlaps(&hours))
        .map(|r| Span::new(r.span.start.max(hours.start), r.span.end.min(hours.end)))
        .collect();
    taken.sort_by_key(|s| s.start);
    let taken = merge_overlapping(&taken);
    subtract_intervals(&[hours], &taken)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Remove sorted, disjoint `to_remove` spans from sorted, disjoint `base`.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

impl Engine {
    /// Bookable intervals of a court on `date` within opening hours.
    pub fn availability(&self, court_id: Ulid, date: NaiveDate) -> Result<Vec<Span>, BookingError> {
        let hours = Span::try_new(self.settings.opening, self.settings.closing)
            .ok_or_else(|| BookingError::InvalidInterval("opening hours are empty".into()))?;
        self.db.read(|t| {
            let court = t
                .courts
                .get(&court_id)
                .filter(|c| c.active)
                .ok_or(BookingError::not_found("court", court_id))?;
            let day: Vec<Reservation> = t
                .reservations_on(court.id, date)
                .into_iter()
                .cloned()
                .collect();
            Ok(free_spans(hours, &day))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, Utc};

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn span(a: (u32, u32), b: (u32, u32)) -> Span {
        Span::new(t(a.0, a.1), t(b.0, b.1))
    }

    fn booked(s: Span, status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            court_id: Ulid::new(),
            user_id: None,
            requester_name: "Ana".into(),
            requester_email: String::new(),
            date: NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
            span: s,
            status,
            payment_status: SettlementStatus::Pending,
            total_amount: 0.0,
            deposit_amount: 0.0,
            created_at: Utc::now(),
        }
    }

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_middle_punch() {
        let base = vec![span((8, 0), (12, 0))];
        let remove = vec![span((9, 0), (10, 0))];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![span((8, 0), (9, 0)), span((10, 0), (12, 0))]
        );
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![span((9, 0), (10, 0))];
        let remove = vec![span((8, 0), (11, 0))];
        assert!(subtract_intervals(&base, &remove).is_empty());
    }

    #[test]
    fn subtract_touching_is_untouched() {
        let base = vec![span((9, 0), (10, 0))];
        let remove = vec![span((10, 0), (11, 0))];
        assert_eq!(subtract_intervals(&base, &remove), base);
    }

    // ── merge_overlapping ────────────────────────────────

    #[test]
    fn merge_overlapping_and_adjacent() {
        let spans = vec![
            span((8, 0), (9, 0)),
            span((9, 0), (10, 0)),
            span((9, 30), (11, 0)),
            span((13, 0), (14, 0)),
        ];
        assert_eq!(
            merge_overlapping(&spans),
            vec![span((8, 0), (11, 0)), span((13, 0), (14, 0))]
        );
    }

    // ── free_spans ────────────────────────────────────────

    #[test]
    fn free_spans_skip_cancelled() {
        let hours = span((8, 0), (23, 0));
        let day = vec![
            booked(span((10, 0), (12, 0)), ReservationStatus::Pending),
            booked(span((12, 0), (13, 0)), ReservationStatus::Cancelled),
            booked(span((18, 30), (20, 0)), ReservationStatus::Confirmed),
        ];
        assert_eq!(
            free_spans(hours, &day),
            vec![
                span((8, 0), (10, 0)),
                span((12, 0), (18, 30)),
                span((20, 0), (23, 0)),
            ]
        );
    }

    #[test]
    fn free_spans_clamp_to_opening_hours() {
        let hours = span((8, 0), (12, 0));
        let day = vec![
            booked(span((7, 0), (9, 0)), ReservationStatus::Pending),
            booked(span((11, 0), (13, 0)), ReservationStatus::Pending),
            booked(span((5, 0), (6, 0)), ReservationStatus::Pending),
        ];
        assert_eq!(free_spans(hours, &day), vec![span((9, 0), (11, 0))]);
    }

    #[test]
    fn fully_booked_day_has_no_gaps() {
        let hours = span((8, 0), (10, 0));
        let day = vec![
            booked(span((8, 0), (9, 0)), ReservationStatus::Pending),
            booked(span((9, 0), (10, 0)), ReservationStatus::Confirmed),
        ];
        assert!(free_spans(hours, &day).is_empty());
    }
}
