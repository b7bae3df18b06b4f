use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::engine::Engine;
use crate::roles::Actor;

/// Background task that releases reservations whose deposit never arrived.
/// Also drops finished task records and notification channels nobody listens on.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        reap_once(&engine).await;
        let cleared = engine.tasks.cleanup();
        if cleared > 0 {
            tracing::debug!(cleared, "dropped finished task records");
        }
        engine.notify.prune();
    }
}

/// One reaper pass. Returns how many reservations were released.
pub async fn reap_once(engine: &Engine) -> usize {
    let now = Utc::now();
    let mut reaped = 0;
    for id in engine.collect_expired(now) {
        match engine.expire_reservation(id, now).await {
            Ok(true) => reaped += 1,
            Ok(false) => {}
            Err(e) => {
                // A settlement may hold the deposit lock; next pass retries.
                tracing::debug!("reaper skip {id}: {e}");
            }
        }
    }
    if reaped > 0 {
        info!(reaped, "released expired reservations");
    }
    reaped
}

/// Rewrite the WAL once `threshold` commits have accumulated.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if engine.db.appends_since_compact().await < threshold {
            continue;
        }
        if let Err(e) = engine.db.compact().await {
            tracing::error!(error = %e, "WAL compaction failed");
        }
    }
}

/// Periodic integrity scan run as the system actor.
pub async fn run_auditor(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    // The first tick fires immediately; skip it so startup stays quiet.
    interval.tick().await;
    loop {
        interval.tick().await;
        match engine.run_check(&Actor::system()).await {
            Ok(summary) if summary.issues_found > 0 => {
                tracing::warn!(issues = summary.issues_found, "periodic integrity check found issues");
            }
            Ok(_) => tracing::debug!("periodic integrity check clean"),
            Err(e) => tracing::error!(error = %e, "periodic integrity check failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BookingRequest, EngineSettings};
    use crate::gateway::ScriptedGateway;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::store::Database;
    use chrono::{Days, Local, NaiveTime};
    use ulid::Ulid;

    async fn engine(deadline: Duration) -> (Arc<Engine>, Court) {
        let settings = EngineSettings {
            payment_deadline: deadline,
            ..EngineSettings::default()
        };
        let engine = Engine::new(
            Arc::new(Database::in_memory()),
            Arc::new(NotifyHub::new()),
            Arc::new(ScriptedGateway::approve()),
            settings,
        );
        let court = Court {
            id: Ulid::new(),
            name: "Central".into(),
            location: "North".into(),
            court_type: "padel".into(),
            price_per_hour: 3000.0,
            rating: 4.0,
            active: true,
            created_at: Utc::now(),
        };
        let mut tx = engine.db.begin();
        tx.put(court.clone());
        tx.commit().await.unwrap();
        (Arc::new(engine), court)
    }

    fn request(court_id: Ulid) -> BookingRequest {
        BookingRequest {
            court_id,
            date: Local::now().date_naive() + Days::new(30),
            start: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
            requester_name: Some("Ana".into()),
            requester_email: Some("ana@example.com".into()),
        }
    }

    #[tokio::test]
    async fn reaper_releases_expired_unpaid_bookings() {
        let (engine, court) = engine(Duration::ZERO).await;
        let receipt = engine
            .create_booking(&Actor::anonymous(), request(court.id))
            .await
            .unwrap();

        assert_eq!(reap_once(&engine).await, 1);
        let r = engine
            .db
            .read(|t| t.reservations.get(&receipt.reservation_id).cloned())
            .unwrap();
        assert_eq!(r.status, ReservationStatus::Cancelled);

        // The slot is free again.
        engine
            .create_booking(&Actor::anonymous(), request(court.id))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reaper_leaves_fresh_bookings_alone() {
        let (engine, court) = engine(Duration::from_secs(900)).await;
        engine
            .create_booking(&Actor::anonymous(), request(court.id))
            .await
            .unwrap();
        assert_eq!(reap_once(&engine).await, 0);
        assert!(engine.collect_expired(Utc::now()).is_empty());
    }

    #[tokio::test]
    async fn reaper_skips_bookings_with_payment_in_flight() {
        let (engine, court) = engine(Duration::ZERO).await;
        let receipt = engine
            .create_booking(&Actor::anonymous(), request(court.id))
            .await
            .unwrap();
        let mut tx = engine.db.begin();
        tx.put(Payment {
            id: Ulid::new(),
            reservation_id: receipt.reservation_id,
            user_id: Ulid::new(),
            amount: receipt.deposit_amount,
            kind: PaymentKind::Deposit,
            method: PaymentMethod::CreditCard,
            transaction_id: None,
            status: PaymentStatus::Processing,
            created_at: Utc::now(),
            processed_at: None,
            error_message: None,
        });
        tx.commit().await.unwrap();

        assert_eq!(reap_once(&engine).await, 0);
    }
}
