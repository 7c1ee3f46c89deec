use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls, SimpleQueryMessage};

/// 2030-01-01T09:00:00Z. Each phase books its own range of days after it.
const BASE: i64 = 1_893_488_400_000;
const DAY: i64 = 86_400_000;

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("orsched")
        .user("orsched")
        .password("orsched");

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
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn insert_case_sql(patient: &str, requested: i64) -> String {
    format!(
        "INSERT INTO cases (patient_name, procedure_name, priority, requested_datetime) \
         VALUES ('{patient}', 'Appendectomy', 'elective', {requested})"
    )
}

/// Insert a case and return its id.
async fn create_case(client: &tokio_postgres::Client, patient: &str, requested: i64) -> String {
    let messages = client
        .simple_query(&insert_case_sql(patient, requested))
        .await
        .expect("insert case failed");
    messages
        .into_iter()
        .find_map(|m| match m {
            SimpleQueryMessage::Row(row) => row.get("id").map(str::to_string),
            _ => None,
        })
        .expect("insert returned no row")
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    let n = 1000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        create_case(&client, &format!("seq-{i}"), BASE + i as i64 * DAY).await;
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} cases in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("insert latency", &mut latencies);
}

/// Every task books the same days, so only five schedules per day can win.
async fn phase2_concurrent_schedule(host: &str, port: u16) {
    let n_tasks = 10;
    let n_days = 50;
    let offset = 2000 * DAY;

    let scheduled = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for task in 0..n_tasks {
        let host = host.to_string();
        let scheduled = scheduled.clone();
        let rejected = rejected.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            for day in 0..n_days {
                let requested = BASE + offset + day as i64 * DAY;
                let id = create_case(&client, &format!("conc-{task}-{day}"), requested).await;
                match client
                    .simple_query(&format!("INSERT INTO schedules (case_id) VALUES ('{id}')"))
                    .await
                {
                    Ok(_) => scheduled.fetch_add(1, Ordering::Relaxed),
                    Err(_) => rejected.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_days;
    let ok = scheduled.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {n_days} cases = {total} in {:.2}s: {ok} scheduled, {} unschedulable",
        elapsed.as_secs_f64(),
        rejected.load(Ordering::Relaxed)
    );
    assert!(ok <= n_days * 5, "more schedules than rooms: {ok}");
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let requested = BASE + (3000 + w as i64 * 2000 + i % 2000) * DAY;
                let _ = client
                    .simple_query(&insert_case_sql(&format!("load-{w}-{i}"), requested))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 200;
    let mut reader_handles = Vec::new();

    for r in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let sql = match (r + i) % 3 {
                    0 => "SELECT * FROM snapshot".to_string(),
                    1 => "SELECT * FROM notifications LIMIT 50".to_string(),
                    _ => {
                        let s = BASE + i as i64 * DAY;
                        format!(
                            r#"SELECT * FROM availability WHERE start >= {s} AND "end" <= {}"#,
                            s + 4 * 3_600_000
                        )
                    }
                };
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

    print_latency("read queries", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for c in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            for i in 0..ops_per_conn {
                let requested = BASE + (14_000 + c as i64 * ops_per_conn as i64 + i as i64) * DAY;
                create_case(&client, &format!("storm-{c}-{i}"), requested).await;
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
    let host = std::env::var("ORSCHED_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("ORSCHED_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid ORSCHED_PORT");

    println!("=== orsched stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential case registration");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] concurrent scheduling on contended days");
    phase2_concurrent_schedule(&host, port).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
