use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

const DAY: i64 = 86_400_000;

async fn connect(host: &str, port: u16, dbname: &str) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(dbname)
        .user("allocd")
        .password("allocd");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_tenant() -> String {
    format!("bench_{}", Ulid::new())
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
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

#[derive(Clone, Copy)]
struct Staff {
    employee: Ulid,
    project: Ulid,
}

async fn register(client: &Client) -> Staff {
    let staff = Staff {
        employee: Ulid::new(),
        project: Ulid::new(),
    };
    client
        .batch_execute(&format!(
            "INSERT INTO employees (id, name) VALUES ('{}', 'bench')",
            staff.employee
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO projects (id, name) VALUES ('{}', 'bench')",
            staff.project
        ))
        .await
        .unwrap();
    staff
}

fn insert_sql(staff: Staff, start: i64, end: i64, force: bool) -> String {
    format!(
        "INSERT INTO allocations VALUES ('{}', '{}', NULL, {start}, {end}, {force})",
        staff.employee, staff.project
    )
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &fresh_tenant()).await;
    let staff = register(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let s = (i as i64) * DAY;
        let t = Instant::now();
        client
            .batch_execute(&insert_sql(staff, s, s + DAY, false))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} allocations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Many connections overriding the same employee's calendar at once.
async fn phase2_override_contention(host: &str, port: u16) {
    let tenant = fresh_tenant();
    let setup = connect(host, port, &tenant).await;
    let staff = register(&setup).await;
    for i in 0..100 {
        let s = i * 10 * DAY;
        setup
            .batch_execute(&insert_sql(staff, s, s + 5 * DAY, false))
            .await
            .unwrap();
    }

    let n_tasks = 10;
    let n_per_task = 100;
    let rejected = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for t in 0..n_tasks {
        let host = host.to_string();
        let tenant = tenant.clone();
        let rejected = rejected.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let mut latencies = Vec::with_capacity(n_per_task);
            for j in 0..n_per_task {
                // Windows straddle existing allocations so most writes truncate
                let s = ((t * n_per_task + j) % 1000) as i64 * DAY + DAY / 2;
                let started = Instant::now();
                if client
                    .batch_execute(&insert_sql(staff, s, s + DAY, true))
                    .await
                    .is_err()
                {
                    rejected.fetch_add(1, Ordering::Relaxed);
                }
                latencies.push(started.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.await.unwrap());
    }
    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    println!(
        "  {n_tasks} tasks x {n_per_task} overrides = {total} in {:.2}s = {:.0} ops/sec, {} rejected",
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64(),
        rejected.load(Ordering::Relaxed)
    );
    print_latency("override latency", &mut all);
}

async fn phase3_plan_under_load(host: &str, port: u16) {
    let tenant = fresh_tenant();
    let setup = connect(host, port, &tenant).await;
    let readers_staff = register(&setup).await;
    for i in 0..200 {
        let s = i * 2 * DAY;
        setup
            .batch_execute(&insert_sql(readers_staff, s, s + DAY, false))
            .await
            .unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let tenant = tenant.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let staff = register(&client).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let s = (i % 5000) * DAY;
                let _ = client
                    .batch_execute(&insert_sql(staff, s, s + DAY, true))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        let tenant = tenant.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let table = if r % 2 == 0 { "override_plan" } else { "availability" };
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let s = (i as i64 % 350) * DAY;
                let e = s + 30 * DAY;
                let t = Instant::now();
                client
                    .batch_execute(&format!(
                        r#"SELECT * FROM {table} WHERE employee_id = '{}' AND start >= {s} AND "end" <= {e}"#,
                        readers_staff.employee
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in reader_handles {
        all.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }
    print_latency("plan/availability query", &mut all);
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
            let client = connect(&host, port, &fresh_tenant()).await;
            let staff = register(&client).await;
            for i in 0..ops_per_conn {
                let s = (i as i64) * DAY;
                client
                    .batch_execute(&insert_sql(staff, s, s + DAY, false))
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
    let host = std::env::var("ALLOCD_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("ALLOCD_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid ALLOCD_PORT");

    println!("=== allocd stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential allocation throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] override contention on one employee");
    phase2_override_contention(&host, port).await;

    println!("\n[phase 3] plan and availability latency under write load");
    phase3_plan_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
