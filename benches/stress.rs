use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use ulid::Ulid;

struct Conn {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Conn {
    async fn call(&mut self, req: Value) -> Value {
        self.writer
            .write_all(format!("{req}\n").as_bytes())
            .await
            .expect("write failed");
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .expect("read failed")
                .expect("server closed connection");
            let v: Value = serde_json::from_str(&line).expect("bad json from server");
            if v.get("notify").is_none() {
                return v;
            }
        }
    }

    async fn ok(&mut self, req: Value) -> Value {
        let v = self.call(req).await;
        assert_eq!(v["ok"], true, "request failed: {v}");
        v["data"].clone()
    }
}

async fn connect(host: &str, port: u16, tenant: &str) -> Conn {
    let password = std::env::var("STOCKHOLD_PASSWORD").unwrap_or_else(|_| "stockhold".into());
    let stream = TcpStream::connect((host, port)).await.expect("connect failed");
    let (r, w) = stream.into_split();
    let mut conn = Conn {
        lines: BufReader::new(r).lines(),
        writer: w,
    };
    conn.ok(json!({ "op": "hello", "tenant": tenant, "password": password }))
        .await;
    conn
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

async fn create_product(conn: &mut Conn, stock: u32) -> Ulid {
    let id = Ulid::new();
    conn.ok(json!({ "op": "create_product", "id": id, "unit_price": 999, "stock_total": stock }))
        .await;
    id
}

fn reservation_ids(receipt: &Value) -> Vec<Value> {
    receipt["reservations"]
        .as_array()
        .map(|rs| rs.iter().map(|r| r["id"].clone()).collect())
        .unwrap_or_default()
}

/// One user at a time: add, checkout, confirm.
async fn phase1_sequential(host: &str, port: u16) {
    let tenant = format!("bench_{}", Ulid::new());
    let mut conn = connect(host, port, &tenant).await;
    let n = 1000;
    let pid = create_product(&mut conn, n).await;

    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();
    for _ in 0..n {
        let user = Ulid::new();
        conn.ok(json!({ "op": "add_to_cart", "user_id": user, "product_id": pid, "quantity": 1 }))
            .await;
        let t = Instant::now();
        let receipt = conn.ok(json!({ "op": "checkout", "user_id": user })).await;
        latencies.push(t.elapsed());
        conn.ok(json!({ "op": "confirm", "user_id": user, "reservation_ids": reservation_ids(&receipt) }))
            .await;
    }

    let elapsed = start.elapsed();
    let ops = f64::from(n) / elapsed.as_secs_f64();
    println!("  {n} purchases in {:.2}s = {ops:.0} purchases/sec", elapsed.as_secs_f64());
    print_latency("checkout latency", &mut latencies);
}

/// Many buyers race for a product with little stock.
async fn phase2_flash_sale(host: &str, port: u16) {
    let tenant = format!("bench_{}", Ulid::new());
    let mut admin = connect(host, port, &tenant).await;
    let stock = 100;
    let buyers = 200;
    let pid = create_product(&mut admin, stock).await;

    let reserved = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..buyers {
        let host = host.to_string();
        let tenant = tenant.clone();
        let reserved = reserved.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            let mut conn = connect(&host, port, &tenant).await;
            let user = Ulid::new();
            let v = conn
                .call(json!({ "op": "add_to_cart", "user_id": user, "product_id": pid, "quantity": 1 }))
                .await;
            if v["ok"] != true {
                conflicts.fetch_add(1, Ordering::Relaxed);
                return Duration::ZERO;
            }
            let t = Instant::now();
            let v = conn.call(json!({ "op": "checkout", "user_id": user })).await;
            let took = t.elapsed();
            if v["ok"] == true {
                reserved.fetch_add(1, Ordering::Relaxed);
            } else {
                conflicts.fetch_add(1, Ordering::Relaxed);
            }
            took
        }));
    }

    let mut latencies = Vec::with_capacity(buyers);
    for h in handles {
        if let Ok(took) = h.await {
            if !took.is_zero() {
                latencies.push(took);
            }
        }
    }
    let elapsed = start.elapsed();
    let product = admin.ok(json!({ "op": "get_product", "id": pid })).await;
    println!(
        "  {buyers} buyers for {stock} units: {} reserved, {} turned away in {:.2}s",
        reserved.load(Ordering::Relaxed),
        conflicts.load(Ordering::Relaxed),
        elapsed.as_secs_f64()
    );
    println!(
        "  final counters: available={} reserved={} (oversold: {})",
        product["available"],
        product["stock_reserved"],
        if reserved.load(Ordering::Relaxed) > stock as usize { "YES" } else { "no" }
    );
    print_latency("checkout latency", &mut latencies);
}

/// Reads of a hot product while buyers keep reserving and cancelling it.
async fn phase3_read_under_load(host: &str, port: u16) {
    let tenant = format!("bench_{}", Ulid::new());
    let mut admin = connect(host, port, &tenant).await;
    let pid = create_product(&mut admin, 50).await;

    let mut writers = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let tenant = tenant.clone();
        writers.push(tokio::spawn(async move {
            let mut conn = connect(&host, port, &tenant).await;
            for _ in 0..200 {
                let user = Ulid::new();
                let v = conn
                    .call(json!({ "op": "add_to_cart", "user_id": user, "product_id": pid, "quantity": 2 }))
                    .await;
                if v["ok"] != true {
                    continue;
                }
                let v = conn.call(json!({ "op": "checkout", "user_id": user })).await;
                if v["ok"] == true {
                    conn.call(json!({ "op": "cancel", "user_id": user, "reservation_ids": reservation_ids(&v["data"]) }))
                        .await;
                }
            }
        }));
    }

    let mut latencies = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline && writers.iter().any(|w| !w.is_finished()) {
        let t = Instant::now();
        admin.ok(json!({ "op": "get_product", "id": pid })).await;
        latencies.push(t.elapsed());
    }
    for w in writers {
        let _ = w.await;
    }
    print_latency("read latency", &mut latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 200;
    let ops_per_conn = 10;
    let start = Instant::now();
    let success = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let tenant = format!("bench_{}", Ulid::new());
            let mut conn = connect(&host, port, &tenant).await;
            let pid = create_product(&mut conn, 1000).await;
            for _ in 0..ops_per_conn {
                let user = Ulid::new();
                conn.ok(json!({ "op": "add_to_cart", "user_id": user, "product_id": pid, "quantity": 1 }))
                    .await;
                conn.ok(json!({ "op": "checkout", "user_id": user })).await;
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
        "  {n_conns} connections, {ops_per_conn} checkouts each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("STOCKHOLD_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("STOCKHOLD_PORT")
        .unwrap_or_else(|_| "5480".into())
        .parse()
        .expect("invalid STOCKHOLD_PORT");

    println!("=== stockhold stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase uses its own tenant to avoid interference

    println!("[phase 1] sequential purchases");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] flash sale");
    phase2_flash_sale(&host, port).await;

    println!("\n[phase 3] read latency under checkout load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
