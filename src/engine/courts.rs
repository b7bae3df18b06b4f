use chrono::Utc;
use ulid::Ulid;

use crate::limits::{
    MAX_COURT_TYPE_LEN, MAX_LOCATION_LEN, MAX_NAME_LEN, MAX_PRICE_PER_HOUR, MAX_RATING,
};
use crate::model::*;
use crate::roles::{Actor, Capability, authorize};

use super::booking::persistence;
use super::{BookingError, Engine, audit, today};

#[derive(Debug, Clone)]
pub struct NewCourt {
    pub name: String,
    pub location: String,
    pub court_type: String,
    pub price_per_hour: Money,
    pub rating: f64,
}

/// Fields an operator may change. Identity stays fixed.
#[derive(Debug, Clone, Default)]
pub struct CourtPatch {
    pub name: Option<String>,
    pub location: Option<String>,
    pub price_per_hour: Option<Money>,
    pub rating: Option<f64>,
    pub active: Option<bool>,
}

fn validate_text(value: &str, field: &str, max: usize) -> Result<(), BookingError> {
    if value.trim().is_empty() {
        return Err(BookingError::InvalidInput(format!("{field} is required")));
    }
    if value.len() > max {
        return Err(BookingError::InvalidInput(format!(
            "{field} longer than {max} characters"
        )));
    }
    Ok(())
}

fn validate_price(price: Money) -> Result<(), BookingError> {
    if !price.is_finite() || price < 0.0 {
        return Err(BookingError::InvalidInput("price must be zero or positive".into()));
    }
    if price > MAX_PRICE_PER_HOUR {
        return Err(BookingError::LimitExceeded("price per hour too high"));
    }
    Ok(())
}

fn validate_rating(rating: f64) -> Result<(), BookingError> {
    if !(0.0..=MAX_RATING).contains(&rating) {
        return Err(BookingError::InvalidInput(format!(
            "rating must be within [0, {MAX_RATING}]"
        )));
    }
    Ok(())
}

impl Engine {
    pub async fn create_court(&self, actor: &Actor, new: NewCourt) -> Result<Court, BookingError> {
        authorize(actor, Capability::ManageCourts)?;
        validate_text(&new.name, "name", MAX_NAME_LEN)?;
        validate_text(&new.location, "location", MAX_LOCATION_LEN)?;
        validate_text(&new.court_type, "court type", MAX_COURT_TYPE_LEN)?;
        validate_price(new.price_per_hour)?;
        validate_rating(new.rating)?;

        let court = Court {
            id: Ulid::new(),
            name: new.name.trim().to_string(),
            location: new.location.trim().to_string(),
            court_type: new.court_type.trim().to_string(),
            price_per_hour: new.price_per_hour,
            rating: new.rating,
            active: true,
            created_at: Utc::now(),
        };
        let mut tx = self.db.begin();
        tx.put(court.clone());
        tx.audit(audit(
            actor,
            "create_court",
            Some(("court", court.id)),
            format!("{} at {}", court.name, court.location),
        ));
        tx.commit().await.map_err(|e| persistence(e, "create_court"))?;
        tracing::info!(court_id = %court.id, name = %court.name, "court created");
        Ok(court)
    }

    pub async fn update_court(
        &self,
        actor: &Actor,
        id: Ulid,
        patch: CourtPatch,
    ) -> Result<Court, BookingError> {
        authorize(actor, Capability::ManageCourts)?;
        let mut tx = self.db.begin();
        let mut court = tx
            .get::<Court>(id)
            .ok_or(BookingError::not_found("court", id))?;

        if let Some(name) = patch.name {
            validate_text(&name, "name", MAX_NAME_LEN)?;
            court.name = name.trim().to_string();
        }
        if let Some(location) = patch.location {
            validate_text(&location, "location", MAX_LOCATION_LEN)?;
            court.location = location.trim().to_string();
        }
        if let Some(price) = patch.price_per_hour {
            validate_price(price)?;
            court.price_per_hour = price;
        }
        if let Some(rating) = patch.rating {
            validate_rating(rating)?;
            court.rating = rating;
        }
        if let Some(active) = patch.active {
            court.active = active;
        }

        tx.put(court.clone());
        tx.audit(audit(
            actor,
            "update_court",
            Some(("court", id)),
            format!(
                "price {:.2}, rating {:.1}, active {}",
                court.price_per_hour, court.rating, court.active
            ),
        ));
        tx.commit().await.map_err(|e| persistence(e, "update_court"))?;
        Ok(court)
    }

    /// Deactivate (`hard = false`) or delete a court with no upcoming bookings.
    pub async fn retire_court(&self, actor: &Actor, id: Ulid, hard: bool) -> Result<(), BookingError> {
        authorize(
            actor,
            if hard {
                Capability::DeleteCourts
            } else {
                Capability::ManageCourts
            },
        )?;
        let mut tx = self.db.begin();
        let mut court = tx
            .get::<Court>(id)
            .ok_or(BookingError::not_found("court", id))?;

        let today = today();
        if let Some(upcoming) = tx
            .find::<Reservation>(|r| r.court_id == id && r.holds_slot() && r.date >= today)
            .into_iter()
            .next()
        {
            return Err(BookingError::Conflict {
                reservation: upcoming.id,
                holder: upcoming.requester_name,
            });
        }

        if hard {
            tx.delete::<Court>(id);
        } else {
            court.active = false;
            tx.put(court.clone());
        }
        tx.audit(audit(
            actor,
            if hard { "delete_court" } else { "deactivate_court" },
            Some(("court", id)),
            court.name.clone(),
        ));
        tx.commit().await.map_err(|e| persistence(e, "retire_court"))?;
        tracing::info!(court_id = %id, hard, "court retired");
        Ok(())
    }

    /// Active courts, by name.
    pub fn list_courts(&self) -> Vec<Court> {
        let mut courts: Vec<Court> = self
            .db
            .read(|t| t.courts.values().filter(|c| c.active).cloned().collect());
        courts.sort_by(|a, b| a.name.cmp(&b.name));
        courts
    }

    pub fn get_court(&self, id: Ulid) -> Result<Court, BookingError> {
        self.db
            .read(|t| t.courts.get(&id).cloned())
            .ok_or(BookingError::not_found("court", id))
    }
}
