use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Local, TimeZone, Utc};
use mockable::Clock;
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use innkeep::engine::Engine;
use innkeep::photo::RecordingPhotoHost;
use innkeep::wire::{self, InnkeepFactory};

// ── Test infrastructure ──────────────────────────────────────

/// "Today" is 2024-04-01 for every server started here.
struct FixtureClock;

impl Clock for FixtureClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap()
    }
}

async fn start_test_server() -> (SocketAddr, Arc<RecordingPhotoHost>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("innkeep_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let photos = Arc::new(RecordingPhotoHost::new());
    let engine = Engine::new(dir.join("innkeep.wal"), Arc::new(FixtureClock), photos.clone()).unwrap();
    let factory = Arc::new(InnkeepFactory::new(Arc::new(engine), "innkeep".to_string()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory, None).await;
            });
        }
    });

    (addr, photos)
}

async fn connect(addr: SocketAddr, password: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("hotel")
        .user("innkeep")
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// SQLSTATE and message of a failed statement.
async fn failure(client: &Client, sql: &str) -> (String, String) {
    let err = client.simple_query(sql).await.unwrap_err();
    let db = err.as_db_error().expect("expected a server error");
    (db.code().code().to_string(), db.message().to_string())
}

async fn add_room(client: &Client, room_type: &str, price: &str) -> String {
    let sql = format!(
        "INSERT INTO rooms (room_type, price, description, photo_url) \
         VALUES ('{room_type}', {price}, NULL, 'https://photos.example/{}.jpg')",
        Ulid::new()
    );
    let created = rows(client, &sql).await;
    assert_eq!(created.len(), 1);
    created[0].get("id").unwrap().to_string()
}

fn book_sql(room_id: &str, check_in: &str, check_out: &str, guest: &str) -> String {
    let guest = guest.replace('\'', "''");
    format!(
        "INSERT INTO bookings (room_id, check_in, check_out, guest) \
         VALUES ('{room_id}', '{check_in}', '{check_out}', '{guest}')"
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn wrong_password_is_refused() {
    let (addr, _) = start_test_server().await;
    assert!(connect(addr, "not-the-password").await.is_err());
}

#[tokio::test]
async fn room_lifecycle_over_the_wire() {
    let (addr, photos) = start_test_server().await;
    let client = connect(addr, "innkeep").await.unwrap();

    let room_id = add_room(&client, "Deluxe", "149.99").await;
    let listed = rows(&client, "SELECT * FROM rooms").await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("price"), Some("149.99"));
    assert_eq!(listed[0].get("description"), None);

    let updated = rows(
        &client,
        &format!(
            "INSERT INTO room_updates (id, room_type, price, description, photo_url) \
             VALUES ('{room_id}', NULL, NULL, 'Sea view', NULL)"
        ),
    )
    .await;
    assert_eq!(updated[0].get("room_type"), Some("Deluxe"));
    assert_eq!(updated[0].get("description"), Some("Sea view"));

    let types = rows(&client, "SELECT * FROM room_types").await;
    assert_eq!(types.len(), 1);
    assert_eq!(types[0].get("room_type"), Some("Deluxe"));

    client
        .simple_query(&format!("DELETE FROM rooms WHERE id = '{room_id}'"))
        .await
        .unwrap();
    assert!(rows(&client, "SELECT * FROM rooms").await.is_empty());
    assert_eq!(photos.released().len(), 1);

    let (code, _) = failure(&client, &format!("SELECT * FROM rooms WHERE id = '{room_id}'")).await;
    assert_eq!(code, "02000");
}

#[tokio::test]
async fn booking_and_conflict_over_the_wire() {
    let (addr, _) = start_test_server().await;
    let client = connect(addr, "innkeep").await.unwrap();
    let room_id = add_room(&client, "Deluxe", "150").await;

    let booked = rows(&client, &book_sql(&room_id, "2024-05-01", "2024-05-03", "alice")).await;
    assert_eq!(booked.len(), 1);
    let code = booked[0].get("confirmation_code").unwrap().to_string();
    assert_eq!(code.len(), 10);
    assert_eq!(booked[0].get("status"), Some("future"));

    // turnover day is fine
    rows(&client, &book_sql(&room_id, "2024-05-03", "2024-05-05", "bob")).await;

    let (sqlstate, message) =
        failure(&client, &book_sql(&room_id, "2024-05-02", "2024-05-04", "carol")).await;
    assert_eq!(sqlstate, "23P01");
    assert!(message.starts_with("CONFLICT:"), "{message}");

    let (sqlstate, message) =
        failure(&client, &book_sql(&room_id, "2024-05-10", "2024-05-10", "carol")).await;
    assert_eq!(sqlstate, "22023");
    assert!(message.starts_with("INVALID_RANGE:"), "{message}");

    let (sqlstate, message) =
        failure(&client, &book_sql(&room_id, "2024-03-30", "2024-04-02", "carol")).await;
    assert_eq!(sqlstate, "22023");
    assert!(message.starts_with("PAST_DATE:"), "{message}");

    let found = rows(
        &client,
        &format!("SELECT * FROM bookings WHERE confirmation_code = '{code}'"),
    )
    .await;
    assert_eq!(found[0].get("guest"), Some("alice"));

    let detail = rows(&client, &format!("SELECT * FROM rooms WHERE id = '{room_id}'")).await;
    let bookings: serde_json::Value =
        serde_json::from_str(detail[0].get("bookings").unwrap()).unwrap();
    assert_eq!(bookings.as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn availability_search_over_the_wire() {
    let (addr, _) = start_test_server().await;
    let client = connect(addr, "innkeep").await.unwrap();

    let a = add_room(&client, "Deluxe", "150").await;
    let b = add_room(&client, "Deluxe", "150").await;
    let c = add_room(&client, "Deluxe", "150").await;
    add_room(&client, "Single", "60").await;

    rows(&client, &book_sql(&a, "2024-06-01", "2024-06-05", "g1")).await;
    rows(&client, &book_sql(&b, "2024-06-04", "2024-06-06", "g2")).await;

    let free = rows(
        &client,
        "SELECT * FROM available_rooms \
         WHERE check_in = '2024-06-03' AND check_out = '2024-06-05' AND room_type = 'Deluxe'",
    )
    .await;
    let ids: Vec<&str> = free.iter().filter_map(|r| r.get("id")).collect();
    assert_eq!(ids, vec![c.as_str()]);

    let all_free = rows(&client, "SELECT * FROM available_rooms").await;
    assert_eq!(all_free.len(), 2);

    let (sqlstate, _) = failure(
        &client,
        "SELECT * FROM available_rooms WHERE check_in = '2024-06-05' AND check_out = '2024-06-03'",
    )
    .await;
    assert_eq!(sqlstate, "22023");
}

#[tokio::test]
async fn cancel_then_rebook() {
    let (addr, _) = start_test_server().await;
    let client = connect(addr, "innkeep").await.unwrap();
    let room_id = add_room(&client, "Single", "60").await;

    let booked = rows(&client, &book_sql(&room_id, "2024-07-01", "2024-07-03", "dana")).await;
    let booking_id = booked[0].get("id").unwrap().to_string();

    client
        .simple_query(&format!("DELETE FROM bookings WHERE id = '{booking_id}'"))
        .await
        .unwrap();
    rows(&client, &book_sql(&room_id, "2024-07-01", "2024-07-03", "erin")).await;

    let (sqlstate, _) =
        failure(&client, &format!("DELETE FROM bookings WHERE id = '{booking_id}'")).await;
    assert_eq!(sqlstate, "02000");
}

#[tokio::test]
async fn parse_errors_are_syntax_errors() {
    let (addr, _) = start_test_server().await;
    let client = connect(addr, "innkeep").await.unwrap();

    let (sqlstate, _) = failure(&client, "SELEKT * FROM rooms").await;
    assert_eq!(sqlstate, "42601");
    let (sqlstate, _) = failure(&client, "SELECT * FROM guests").await;
    assert_eq!(sqlstate, "42601");
}

#[tokio::test]
async fn extended_protocol_binds_text_parameters() {
    let (addr, _) = start_test_server().await;
    let client = connect(addr, "innkeep").await.unwrap();
    let room_id = add_room(&client, "Suite", "300").await;
    rows(&client, &book_sql(&room_id, "2024-08-01", "2024-08-04", "O'Brien")).await;

    let found = client
        .query("SELECT * FROM bookings WHERE guest = $1", &[&"O'Brien"])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let check_in: String = found[0].get("check_in");
    assert_eq!(check_in, "2024-08-01");
}
