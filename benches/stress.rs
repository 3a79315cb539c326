use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

async fn connect(host: &str, port: u16, dbname: &str) -> Client {
    let mut config = Config::new();
    config.host(host).port(port).dbname(dbname).user("formacal");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

/// ISO-8601 instant `hours` after 2026-01-05T00:00:00Z.
fn iso(hours: i64) -> String {
    let base: DateTime<Utc> = "2026-01-05T00:00:00Z".parse().unwrap();
    (base + TimeDelta::hours(hours)).to_rfc3339()
}

async fn register(client: &Client) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO instructors (id) VALUES ('{id}')"))
        .await
        .unwrap();
    id
}

fn commit_sql(instructors: &[Ulid], start_hour: i64, location: Ulid) -> String {
    let ids = instructors
        .iter()
        .map(Ulid::to_string)
        .collect::<Vec<_>>()
        .join(",");
    format!(
        r#"INSERT INTO bookings (id, instructor_ids, start, "end", location_id) VALUES (NULL, '{ids}', '{}', '{}', '{location}')"#,
        iso(start_hour),
        iso(start_hour + 1)
    )
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &format!("bench_{}", Ulid::new())).await;
    let instructor = register(&client).await;
    let location = Ulid::new();

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    // Two-hour stride keeps every commit free of conflicts.
    for i in 0..n {
        let t = Instant::now();
        client
            .batch_execute(&commit_sql(&[instructor], (i as i64) * 2, location))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} commits in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("commit latency", &mut latencies);
}

/// Many clients race for the same windows of a few shared instructors.
async fn phase2_contended(host: &str, port: u16) {
    let dbname = format!("bench_{}", Ulid::new());
    let setup = connect(host, port, &dbname).await;
    let mut instructors = Vec::new();
    for _ in 0..4 {
        instructors.push(register(&setup).await);
    }
    drop(setup);

    let n_tasks = 20;
    let windows = 100;
    let committed = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let busy = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for t in 0..n_tasks {
        let host = host.to_string();
        let dbname = dbname.clone();
        // Pairs of neighbouring instructors, so lock sets overlap across tasks.
        let pair = [instructors[t % 4], instructors[(t + 1) % 4]];
        let (committed, conflicts, busy) = (committed.clone(), conflicts.clone(), busy.clone());
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &dbname).await;
            let location = Ulid::new();
            for w in 0..windows {
                match client.batch_execute(&commit_sql(&pair, w, location)).await {
                    Ok(()) => committed.fetch_add(1, Ordering::Relaxed),
                    Err(e) => match e.code().map(|c| c.code()) {
                        Some("23P01") => conflicts.fetch_add(1, Ordering::Relaxed),
                        Some("55P03") => busy.fetch_add(1, Ordering::Relaxed),
                        _ => panic!("unexpected commit error: {e}"),
                    },
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * windows as usize;
    println!(
        "  {total} attempts in {:.2}s: {} committed, {} conflict, {} busy",
        elapsed.as_secs_f64(),
        committed.load(Ordering::Relaxed),
        conflicts.load(Ordering::Relaxed),
        busy.load(Ordering::Relaxed),
    );
    // Adjacent pairs share instructors, so at most two pairs fit each window.
    assert!(committed.load(Ordering::Relaxed) <= 2 * windows as usize);
}

async fn phase3_check_under_load(host: &str, port: u16) {
    let dbname = format!("bench_{}", Ulid::new());
    let setup = connect(host, port, &dbname).await;
    let location = Ulid::new();
    let mut readers_pool = Vec::new();
    for _ in 0..10 {
        let instructor = register(&setup).await;
        for i in 0..50 {
            setup
                .batch_execute(&commit_sql(&[instructor], i * 3, location))
                .await
                .unwrap();
        }
        readers_pool.push(instructor);
    }
    drop(setup);

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let dbname = dbname.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &dbname).await;
            let instructor = register(&client).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let _ = client
                    .batch_execute(&commit_sql(&[instructor], i * 2, location))
                    .await;
                i += 1;
            }
        }));
    }

    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for instructor in readers_pool {
        let host = host.to_string();
        let dbname = dbname.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &dbname).await;
            let other_site = Ulid::new();
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for r in 0..reads_per_reader {
                let hour = (r as i64 % 150) + 1;
                let sql = format!(
                    r#"SELECT * FROM availability WHERE instructor_ids = '{instructor}' AND start = '{}' AND "end" = '{}' AND location_id = '{other_site}'"#,
                    iso(hour),
                    iso(hour + 1)
                );
                let t = Instant::now();
                client.simple_query(&sql).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("availability check", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &format!("bench_{}", Ulid::new())).await;
            let instructor = register(&client).await;
            let location = Ulid::new();
            for i in 0..ops_per_conn {
                client
                    .batch_execute(&commit_sql(&[instructor], i * 2, location))
                    .await
                    .unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("FORMACAL_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("FORMACAL_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid FORMACAL_PORT");

    println!("=== formacal stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential commit throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended commits on shared instructors");
    phase2_contended(&host, port).await;

    println!("\n[phase 3] check latency under commit load");
    phase3_check_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
