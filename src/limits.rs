//! Input bounds enforced before any lock or transaction is taken.

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_EMAIL_LEN: usize = 120;
pub const MAX_LOCATION_LEN: usize = 200;
pub const MAX_COURT_TYPE_LEN: usize = 50;

/// Upper bound on `price_per_hour`.
pub const MAX_PRICE_PER_HOUR: f64 = 1_000_000.0;

/// Ratings live in `[0, MAX_RATING]`.
pub const MAX_RATING: f64 = 5.0;

/// How far ahead a booking may be made.
pub const MAX_BOOKING_DAYS_AHEAD: u64 = 365;

/// Days after today covered by a court schedule.
pub const SCHEDULE_DAYS: u64 = 7;
