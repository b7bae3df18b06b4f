use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, Local, NaiveTime};
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use ulid::Ulid;

use courtbook::api::auth::{Identity, StaticSessions};
use courtbook::api::{AppState, create_router};
use courtbook::engine::{BookingRequest, DepositRequest, Engine, EngineSettings, NewCourt};
use courtbook::gateway::ScriptedGateway;
use courtbook::model::PaymentMethod;
use courtbook::notify::NotifyHub;
use courtbook::roles::Role;
use courtbook::store::Database;

// ── Test infrastructure ──────────────────────────────────────

struct Server {
    addr: SocketAddr,
    engine: Arc<Engine>,
    visitor: Identity,
    admin: Identity,
}

fn identity(username: &str, role: Role) -> Identity {
    Identity {
        user_id: Ulid::new(),
        username: username.into(),
        email: format!("{username}@example.com"),
        role,
    }
}

async fn start_test_server() -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let visitor = identity("ana", Role::Visitor);
    let admin = identity("root", Role::Admin);
    let mut sessions = HashMap::new();
    sessions.insert("tok-ana".to_string(), visitor.clone());
    sessions.insert("tok-root".to_string(), admin.clone());

    let engine = Arc::new(Engine::new(
        Arc::new(Database::in_memory()),
        Arc::new(NotifyHub::new()),
        Arc::new(ScriptedGateway::approve()),
        EngineSettings::default(),
    ));
    engine.register_user(visitor.user()).await.unwrap();
    engine.register_user(admin.user()).await.unwrap();

    let app = create_router(AppState {
        engine: engine.clone(),
        sessions: Arc::new(StaticSessions::new(sessions)),
    });
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Server {
        addr,
        engine,
        visitor,
        admin,
    }
}

type Feed = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(addr: SocketAddr, token: &str) -> Feed {
    let (feed, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token={token}"))
        .await
        .unwrap();
    feed
}

/// Read until an event named `event` arrives, skipping others.
async fn next_event(feed: &mut Feed, event: &str) -> serde_json::Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let msg = feed.next().await.unwrap().unwrap();
            let Message::Text(text) = msg else { continue };
            let value: serde_json::Value = serde_json::from_str(text.as_ref()).unwrap();
            if value["event"] == event {
                return value;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {event}"))
}

async fn book(server: &Server) -> Ulid {
    let court = server
        .engine
        .create_court(
            &server.admin.actor(),
            NewCourt {
                name: "Central".into(),
                location: "North".into(),
                court_type: "padel".into(),
                price_per_hour: 2000.0,
                rating: 4.0,
            },
        )
        .await
        .unwrap();
    server
        .engine
        .create_booking(
            &server.visitor.actor(),
            BookingRequest {
                court_id: court.id,
                date: Local::now().date_naive() + Days::new(3),
                start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                requester_name: None,
                requester_email: None,
            },
        )
        .await
        .unwrap()
        .reservation_id
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn staff_feed_sees_new_bookings() {
    let server = start_test_server().await;
    let mut feed = connect(server.addr, "tok-root").await;

    let booking_id = book(&server).await;

    let event = next_event(&mut feed, "new_booking").await;
    assert_eq!(event["data"]["booking_id"], booking_id.to_string());
}

#[tokio::test]
async fn owner_feed_sees_payment_outcome() {
    let server = start_test_server().await;
    let mut feed = connect(server.addr, "tok-ana").await;

    let booking_id = book(&server).await;
    server
        .engine
        .process_deposit(
            &server.visitor.actor(),
            DepositRequest {
                reservation_id: booking_id,
                method: PaymentMethod::CreditCard,
            },
        )
        .await
        .unwrap();

    let event = next_event(&mut feed, "payment_successful").await;
    assert_eq!(event["data"]["booking_id"], booking_id.to_string());
}

#[tokio::test]
async fn visitors_do_not_receive_staff_events() {
    let server = start_test_server().await;
    let mut visitor_feed = connect(server.addr, "tok-ana").await;
    let mut admin_feed = connect(server.addr, "tok-root").await;

    book(&server).await;
    next_event(&mut admin_feed, "new_booking").await;

    let nothing = tokio::time::timeout(Duration::from_millis(200), visitor_feed.next()).await;
    assert!(nothing.is_err(), "visitor feed received {nothing:?}");
}

#[tokio::test]
async fn feed_requires_a_known_token() {
    let server = start_test_server().await;
    assert!(
        tokio_tungstenite::connect_async(format!("ws://{}/ws", server.addr))
            .await
            .is_err()
    );
    assert!(
        tokio_tungstenite::connect_async(format!("ws://{}/ws?token=forged", server.addr))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn closing_the_socket_unsubscribes() {
    let server = start_test_server().await;
    let mut feed = connect(server.addr, "tok-root").await;
    feed.close(None).await.unwrap();
    drop(feed);

    // Publishing with no live subscriber never fails.
    book(&server).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.engine.notify.prune();
    assert_eq!(server.engine.notify.channel_count(), 0);
}
