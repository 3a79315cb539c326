use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use formacal::config::EngineConfig;
use formacal::organization::OrganizationRegistry;
use formacal::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<OrganizationRegistry>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("formacal_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let registry = Arc::new(OrganizationRegistry::new(dir, EngineConfig::default(), 1000));

    let registry2 = registry.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let registry = registry2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, registry).await;
            });
        }
    });

    (addr, registry)
}

async fn connect(addr: SocketAddr, dbname: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("formacal");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
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

/// SQLSTATE of a failed statement.
async fn error_code(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().expect("server error carries a SQLSTATE").code().to_string()
}

fn is_true(cell: Option<&str>) -> bool {
    matches!(cell, Some("t") | Some("true"))
}

fn availability_sql(instructor: Ulid, start: &str, end: &str, location: Ulid) -> String {
    format!(
        r#"SELECT * FROM availability WHERE instructor_ids = '{instructor}' AND start = '{start}' AND "end" = '{end}' AND location_id = '{location}'"#
    )
}

fn booking_sql(instructor: Ulid, start: &str, end: &str, location: Ulid) -> String {
    format!(
        r#"INSERT INTO bookings (id, instructor_ids, start, "end", location_id) VALUES (NULL, '{instructor}', '{start}', '{end}', '{location}')"#
    )
}

async fn register(client: &Client) -> Ulid {
    let instructor = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO instructors (id, active) VALUES ('{instructor}', true)"))
        .await
        .unwrap();
    instructor
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn commit_then_check_worked_example() {
    let (addr, _registry) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let instructor = register(&client).await;
    let (site_a, site_b) = (Ulid::new(), Ulid::new());

    let booked = rows(
        &client,
        &booking_sql(instructor, "2026-03-10T09:00:00Z", "2026-03-10T11:00:00Z", site_a),
    )
    .await;
    assert_eq!(booked.len(), 1);
    assert_eq!(booked[0].get("instructor_ids"), Some(instructor.to_string().as_str()));
    assert_eq!(booked[0].get("start"), Some("2026-03-10T09:00:00+00:00"));
    assert_eq!(booked[0].get("state"), Some("committed"));
    assert_eq!(booked[0].get("advisories"), Some("[]"));

    // Back to back at the same site.
    let same_site = rows(
        &client,
        &availability_sql(instructor, "2026-03-10T11:00:00Z", "2026-03-10T12:00:00Z", site_a),
    )
    .await;
    assert!(is_true(same_site[0].get("available")));
    assert_eq!(same_site[0].get("conflicts"), Some("[]"));

    // Back to back at another site: advisory travel buffer only.
    let other_site = rows(
        &client,
        &availability_sql(instructor, "2026-03-10T11:00:00Z", "2026-03-10T12:00:00Z", site_b),
    )
    .await;
    assert!(is_true(other_site[0].get("available")));
    let conflicts: serde_json::Value =
        serde_json::from_str(other_site[0].get("conflicts").unwrap()).unwrap();
    assert_eq!(conflicts[0]["kind"], "TravelBuffer");
    assert_eq!(conflicts[0]["severity"], "Advisory");

    let inside = rows(
        &client,
        &availability_sql(instructor, "2026-03-10T09:30:00Z", "2026-03-10T10:30:00Z", site_a),
    )
    .await;
    assert!(!is_true(inside[0].get("available")));
    let conflicts: serde_json::Value =
        serde_json::from_str(inside[0].get("conflicts").unwrap()).unwrap();
    assert_eq!(conflicts.as_array().unwrap().len(), 1);
    assert_eq!(conflicts[0]["kind"], "Overlap");
}

#[tokio::test]
async fn conflicting_commit_reports_exclusion_violation() {
    let (addr, _registry) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let instructor = register(&client).await;
    let site = Ulid::new();

    client
        .batch_execute(&booking_sql(instructor, "2026-03-10T09:00:00Z", "2026-03-10T11:00:00Z", site))
        .await
        .unwrap();

    let err = client
        .simple_query(&booking_sql(instructor, "2026-03-10T10:00:00Z", "2026-03-10T12:00:00Z", site))
        .await
        .unwrap_err();
    let db_err = err.as_db_error().unwrap();
    assert_eq!(db_err.code().code(), "23P01");
    let body: serde_json::Value = serde_json::from_str(db_err.message()).unwrap();
    assert_eq!(body["error"], "Conflict");
    assert_eq!(body["conflicts"][0]["kind"], "Overlap");
}

#[tokio::test]
async fn cancel_is_idempotent_over_the_wire() {
    let (addr, _registry) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let instructor = register(&client).await;
    let site = Ulid::new();

    let booked = rows(
        &client,
        &booking_sql(instructor, "2026-03-10T09:00:00Z", "2026-03-10T11:00:00Z", site),
    )
    .await;
    let id = booked[0].get("id").unwrap().to_string();

    for _ in 0..2 {
        client
            .batch_execute(&format!("DELETE FROM bookings WHERE id = '{id}'"))
            .await
            .unwrap();
    }

    let listed = rows(&client, &format!("SELECT * FROM bookings WHERE instructor_id = '{instructor}'")).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("state"), Some("cancelled"));

    // The freed window can be booked again.
    client
        .batch_execute(&booking_sql(instructor, "2026-03-10T09:00:00Z", "2026-03-10T11:00:00Z", site))
        .await
        .unwrap();
}

#[tokio::test]
async fn blackouts_over_the_wire() {
    let (addr, _registry) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let instructor = register(&client).await;
    let site = Ulid::new();

    let added = rows(
        &client,
        &format!(
            r#"INSERT INTO blackouts (id, instructor_id, start, "end", kind, reason) VALUES (NULL, '{instructor}', '2026-03-10T00:00:00Z', '2026-03-11T00:00:00Z', 'total', 'sick leave')"#
        ),
    )
    .await;
    assert_eq!(added[0].get("kind"), Some("total"));
    assert_eq!(added[0].get("reason"), Some("sick leave"));
    let blackout_id = added[0].get("id").unwrap().to_string();

    let check = availability_sql(instructor, "2026-03-10T09:00:00Z", "2026-03-10T10:00:00Z", site);
    let blocked = rows(&client, &check).await;
    assert!(!is_true(blocked[0].get("available")));
    assert!(blocked[0].get("conflicts").unwrap().contains("TotalBlackout"));

    let listed = rows(&client, &format!("SELECT * FROM blackouts WHERE instructor_id = '{instructor}'")).await;
    assert_eq!(listed.len(), 1);

    client
        .batch_execute(&format!("DELETE FROM blackouts WHERE id = '{blackout_id}'"))
        .await
        .unwrap();
    let open = rows(&client, &check).await;
    assert!(is_true(open[0].get("available")));
}

#[tokio::test]
async fn errors_carry_sqlstate() {
    let (addr, _registry) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let site = Ulid::new();

    // Unknown instructor.
    let stranger = Ulid::new();
    assert_eq!(
        error_code(&client, &availability_sql(stranger, "2026-03-10T09:00:00Z", "2026-03-10T10:00:00Z", site)).await,
        "22023"
    );

    // Inverted window.
    let instructor = register(&client).await;
    assert_eq!(
        error_code(&client, &availability_sql(instructor, "2026-03-10T10:00:00Z", "2026-03-10T09:00:00Z", site)).await,
        "22023"
    );

    assert_eq!(
        error_code(&client, &format!("DELETE FROM bookings WHERE id = '{}'", Ulid::new())).await,
        "P0002"
    );
    assert_eq!(error_code(&client, "SELEC nonsense").await, "42601");
}

#[tokio::test]
async fn organizations_are_isolated_by_database() {
    let (addr, registry) = start_test_server().await;
    let acme = connect(addr, "acme").await;
    let globex = connect(addr, "globex").await;

    let instructor = register(&acme).await;
    let listed = rows(&acme, "SELECT * FROM instructors").await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("id"), Some(instructor.to_string().as_str()));

    assert!(rows(&globex, "SELECT * FROM instructors").await.is_empty());
    assert_eq!(registry.len(), 2);
}
