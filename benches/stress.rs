use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Datelike, Days, NaiveDate, Utc};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use slotbook::calendar::UnitCalendar;
use slotbook::engine::{BookingPolicy, Engine};
use slotbook::identity::{CapabilitySet, StaticDirectory, UserProfile};
use slotbook::notify::NotifyHub;
use slotbook::wire;

const TOKEN: &str = "bench";
const TEACHER: u64 = 1;
const FIRST_STUDENT: u64 = 1_000;
const STUDENTS: u64 = 2_000;
const COURSE: u64 = 7;

async fn start_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");

    let dir = std::env::temp_dir().join(format!("slotbook_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).expect("create data dir");
    let directory = StaticDirectory::new();
    directory.insert(UserProfile {
        id: TEACHER,
        capabilities: CapabilitySet::from_bits(4),
        courses: Default::default(),
        cohort: None,
    });
    for id in FIRST_STUDENT..FIRST_STUDENT + STUDENTS {
        directory.insert(UserProfile {
            id,
            capabilities: CapabilitySet::from_bits(8),
            courses: [COURSE].into_iter().collect(),
            cohort: None,
        });
    }
    let policy = BookingPolicy {
        student_lookahead_days: 366,
        supervisor_lookahead_days: 366,
        my_slots_window_days: 7,
    };
    let engine = Arc::new(
        Engine::new(
            dir.join("slotbook.wal"),
            Arc::new(NotifyHub::new()),
            Arc::new(directory),
            UnitCalendar::default(),
            policy,
        )
        .expect("engine start failed"),
    );

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, Arc::from(TOKEN)).await;
            });
        }
    });
    addr
}

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
    caller: u64,
    next_id: u64,
}

impl Client {
    async fn connect(addr: SocketAddr, caller: u64) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect failed");
        Self {
            framed: Framed::new(stream, LinesCodec::new()),
            caller,
            next_id: 0,
        }
    }

    async fn call(&mut self, function: &str, args: Value) -> Value {
        self.next_id += 1;
        let req = json!({
            "id": self.next_id,
            "caller": self.caller,
            "token": TOKEN,
            "function": function,
            "args": args,
        });
        self.framed.send(req.to_string()).await.expect("send failed");
        let line = self
            .framed
            .next()
            .await
            .expect("connection closed")
            .expect("read failed");
        serde_json::from_str(&line).expect("invalid response")
    }
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

/// The next `n` dates falling on `weekday` (1 = Monday), starting tomorrow.
fn dates_on(weekday: u32, n: usize) -> Vec<NaiveDate> {
    let mut d = Utc::now().date_naive() + Days::new(1);
    while d.weekday().number_from_monday() != weekday {
        d = d + Days::new(1);
    }
    (0..n as u64).map(|w| d + Days::new(7 * w)).collect()
}

struct BenchSlot {
    id: String,
    weekday: u32,
    capacity: u32,
}

async fn setup(addr: SocketAddr) -> Vec<BenchSlot> {
    let mut teacher = Client::connect(addr, TEACHER).await;
    let capacities = [1, 1, 5, 5, 10, 10, 50, 50, 500, 500];
    let mut slots = Vec::new();
    for (i, &cap) in capacities.iter().enumerate() {
        let weekday = (i % 5) as u32 + 1;
        let resp = teacher
            .call(
                "create_slot",
                json!({"startunit": 1 + i as u32, "duration": 1, "weekday": weekday, "room": "B1", "size": cap}),
            )
            .await;
        let id = resp["ok"]["id"].as_str().expect("create_slot failed").to_string();
        teacher
            .call("add_slot_filter", json!({"slotid": id, "courseid": COURSE}))
            .await;
        slots.push(BenchSlot {
            id,
            weekday,
            capacity: cap,
        });
    }
    println!("  created {} slots", slots.len());
    slots
}

async fn phase1_sequential(addr: SocketAddr, slot: &BenchSlot) {
    let dates = dates_on(slot.weekday, 40);
    let mut latencies = Vec::new();
    let start = Instant::now();
    let mut student = FIRST_STUDENT;
    for date in &dates {
        for _ in 0..slot.capacity.min(25) {
            let mut client = Client::connect(addr, student).await;
            let t = Instant::now();
            let resp = client
                .call(
                    "book_reservation",
                    json!({"slotid": slot.id, "date": date.to_string()}),
                )
                .await;
            latencies.push(t.elapsed());
            assert!(resp.get("ok").is_some(), "booking failed: {resp}");
            student += 1;
        }
    }
    let elapsed = start.elapsed();
    let n = latencies.len();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("book_reservation", &mut latencies);
}

async fn phase2_last_seat_race(addr: SocketAddr, slot: &BenchSlot) {
    let date = dates_on(slot.weekday, 1)[0];
    let n_tasks = 200u64;

    let start = Instant::now();
    let mut handles = Vec::new();
    for i in 0..n_tasks {
        let slot_id = slot.id.clone();
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(addr, FIRST_STUDENT + 1_000 + i).await;
            let t = Instant::now();
            let resp = client
                .call(
                    "book_reservation",
                    json!({"slotid": slot_id, "date": date.to_string()}),
                )
                .await;
            (resp, t.elapsed())
        }));
    }

    let mut ok = 0;
    let mut full = 0;
    let mut latencies = Vec::new();
    for h in handles {
        let (resp, latency) = h.await.expect("task panicked");
        latencies.push(latency);
        if resp.get("ok").is_some() {
            ok += 1;
        } else if resp["error"]["code"] == "slot_full" {
            full += 1;
        } else {
            panic!("unexpected response: {resp}");
        }
    }
    assert_eq!(ok, slot.capacity, "capacity violated");
    println!(
        "  {n_tasks} racers for {} seats: {ok} booked, {full} slot_full in {:.2}s",
        slot.capacity,
        start.elapsed().as_secs_f64()
    );
    print_latency("contended book_reservation", &mut latencies);
}

async fn phase3_read_under_load(addr: SocketAddr, slot: &BenchSlot) {
    let dates = dates_on(slot.weekday, 20);
    let n_writers = 5u64;
    let per_writer = 40u64;

    let mut writer_handles = Vec::new();
    for w in 0..n_writers {
        let slot_id = slot.id.clone();
        let dates = dates.clone();
        writer_handles.push(tokio::spawn(async move {
            for j in 0..per_writer {
                let student = FIRST_STUDENT + 1_500 + w * per_writer + j;
                let mut client = Client::connect(addr, student).await;
                let date = dates[(j as usize) % dates.len()];
                client
                    .call(
                        "book_reservation",
                        json!({"slotid": slot_id, "date": date.to_string()}),
                    )
                    .await;
            }
        }));
    }

    let mut reader_handles = Vec::new();
    for r in 0..5u64 {
        reader_handles.push(tokio::spawn(async move {
            let mut client = Client::connect(addr, FIRST_STUDENT + r).await;
            let mut latencies = Vec::new();
            for _ in 0..100 {
                let t = Instant::now();
                let resp = client.call("get_my_reservations", json!({})).await;
                latencies.push(t.elapsed());
                assert!(resp.get("ok").is_some(), "read failed: {resp}");
            }
            latencies
        }));
    }

    for h in writer_handles {
        h.await.expect("writer panicked");
    }
    let mut latencies = Vec::new();
    for h in reader_handles {
        latencies.extend(h.await.expect("reader panicked"));
    }
    print_latency("get_my_reservations under write load", &mut latencies);
}

async fn phase4_connection_storm(addr: SocketAddr) {
    let n_conns = 200u64;
    let start = Instant::now();
    let mut handles = Vec::new();
    for i in 0..n_conns {
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(addr, FIRST_STUDENT + i).await;
            let resp = client.call("get_my_slots", json!({})).await;
            resp.get("ok").is_some()
        }));
    }
    let mut ok = 0;
    for h in handles {
        if h.await.unwrap_or(false) {
            ok += 1;
        }
    }
    println!(
        "  {n_conns} connections: {ok}/{n_conns} succeeded in {:.2}s",
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    println!("=== slotbook stress benchmark ===");
    let addr = start_server().await;
    println!("target: {addr}\n");

    println!("[setup]");
    let slots = setup(addr).await;

    println!("\n[phase 1] sequential booking throughput");
    phase1_sequential(addr, &slots[8]).await; // cap=500 slot

    println!("\n[phase 2] last-seat race");
    phase2_last_seat_race(addr, &slots[4]).await; // cap=10 slot

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(addr, &slots[9]).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(addr).await;

    println!("\n=== benchmark complete ===");
}
