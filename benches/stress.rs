use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};

async fn connect(host: &str, port: u16) -> Client {
    let password = std::env::var("ALLOTMENT_PASSWORD").unwrap_or_else(|_| "allotment".into());
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("allotment")
        .user("bench")
        .password(password);

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
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
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
        latencies.last().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
    );
}

fn day(offset: u64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 1).unwrap() + Days::new(offset)
}

/// First column of the first row, which is the new id for id-returning inserts.
async fn insert_id(client: &Client, sql: &str) -> String {
    let msgs = client.simple_query(sql).await.unwrap();
    msgs.into_iter()
        .find_map(|m| match m {
            SimpleQueryMessage::Row(row) => row.get(0).map(str::to_string),
            _ => None,
        })
        .expect("insert returned no id")
}

/// A resource with a year-long capacity window.
async fn resource(client: &Client, code: &str, capacity: u64) -> String {
    let rid = insert_id(
        client,
        &format!("INSERT INTO resources (kind, name, code) VALUES ('equipment', 'Bench {code}', '{code}')"),
    )
    .await;
    insert_id(
        client,
        &format!(
            r#"INSERT INTO capacities (resource_id, start, "end", quantity) VALUES ('{rid}', '{}', '{}', {capacity})"#,
            day(0),
            day(364)
        ),
    )
    .await;
    rid
}

fn allocation_sql(rid: &str, project: &str, offset: u64, len: u64) -> String {
    format!(
        r#"INSERT INTO allocations (resource_id, project_id, start, "end", quantity) VALUES ('{rid}', '{project}', '{}', '{}', 1)"#,
        day(offset % 360),
        day(offset % 360 + len)
    )
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    let rid = resource(&client, "SEQ", 10).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        client
            .batch_execute(&allocation_sql(&rid, "seq", i as u64, 3))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} allocations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for t in 0..n_tasks {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            // Separate resources keep the writers off each other's locks.
            let rid = resource(&client, &format!("CONC-{t}"), 5).await;
            for j in 0..n_per_task {
                client
                    .batch_execute(&allocation_sql(&rid, "conc", j as u64, 2))
                    .await
                    .unwrap();
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} allocations = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_analysis_under_load(host: &str, port: u16) {
    let setup = connect(host, port).await;
    let rid = resource(&setup, "READ", 3).await;
    for i in 0..300 {
        setup
            .batch_execute(&allocation_sql(&rid, "read", i, 5))
            .await
            .unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let rid = rid.clone();
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let _ = client
                    .batch_execute(&allocation_sql(&rid, &format!("writer-{w}"), i * 7 + w, 1))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 300;
    let mut readers = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        let rid = rid.clone();
        readers.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let table = if r % 2 == 0 { "conflicts" } else { "utilization" };
            let sql = format!(
                r#"SELECT * FROM {table} WHERE resource_id = '{rid}' AND start >= '{}' AND "end" <= '{}'"#,
                day(0),
                day(364)
            );
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client.simple_query(&sql).await.unwrap();
                latencies.push(t.elapsed());
            }
            (table, latencies)
        }));
    }

    let mut conflicts = Vec::new();
    let mut utilization = Vec::new();
    for h in readers {
        let (table, latencies) = h.await.unwrap();
        if table == "conflicts" {
            conflicts.extend(latencies);
        } else {
            utilization.extend(latencies);
        }
    }

    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }

    print_latency("conflict query", &mut conflicts);
    print_latency("utilization query", &mut utilization);
}

async fn phase4_optimizer(host: &str, port: u16) {
    let client = connect(host, port).await;
    let mut rids = Vec::new();
    for i in 0..5 {
        rids.push(resource(&client, &format!("OPT-{i}"), 4).await);
    }

    let runs = 100;
    let batch = 50;
    let accepted = Arc::new(AtomicUsize::new(0));
    let mut latencies = Vec::with_capacity(runs);
    let priorities = ["low", "medium", "high"];

    for run in 0..runs {
        let values: Vec<String> = (0..batch)
            .map(|i| {
                let rid = &rids[(run + i) % rids.len()];
                let offset = ((run * 31 + i * 17) % 330) as u64;
                format!(
                    "('opt-{run}', '{rid}', '{}', '{}', {}, '{}')",
                    day(offset),
                    day(offset + 10),
                    1 + i % 3,
                    priorities[i % priorities.len()]
                )
            })
            .collect();
        let sql = format!(
            r#"INSERT INTO optimize (project_id, resource_id, start, "end", quantity, priority) VALUES {}"#,
            values.join(", ")
        );

        let t = Instant::now();
        let msgs = client.simple_query(&sql).await.unwrap();
        latencies.push(t.elapsed());
        let ok = msgs
            .iter()
            .filter(|m| matches!(m, SimpleQueryMessage::Row(row) if row.get("outcome") == Some("accepted")))
            .count();
        accepted.fetch_add(ok, Ordering::Relaxed);
    }

    println!(
        "  {runs} runs x {batch} requests: {} accepted",
        accepted.load(Ordering::Relaxed)
    );
    print_latency("optimizer run", &mut latencies);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("ALLOTMENT_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("ALLOTMENT_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid ALLOTMENT_PORT");

    println!("=== allotment stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential allocate throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] concurrent allocate throughput");
    phase2_concurrent(&host, port).await;

    println!("\n[phase 3] conflict and utilization latency under write load");
    phase3_analysis_under_load(&host, port).await;

    println!("\n[phase 4] optimizer batches");
    phase4_optimizer(&host, port).await;

    println!("\n=== done ===");
}
