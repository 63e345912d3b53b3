use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveTime, TimeDelta};
use ulid::Ulid;

use reservo::clock::FixedClock;
use reservo::config::Policy;
use reservo::engine::{Engine, NewReservation, NewSpace};
use reservo::model::SpaceKind;

const SLOTS_PER_DAY: u32 = 10; // 08:00–18:00, one hour each

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

fn start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 6).unwrap()
}

/// Slot `i` counted from the first bookable day, one hour each.
fn slot(i: u32) -> (NaiveDate, NaiveTime, NaiveTime) {
    let date = start_date() + TimeDelta::days(1 + (i / SLOTS_PER_DAY) as i64);
    let hour = 8 + i % SLOTS_PER_DAY;
    (
        date,
        NaiveTime::from_hms_opt(hour, 0, 0).unwrap(),
        NaiveTime::from_hms_opt(hour + 1, 0, 0).unwrap(),
    )
}

fn request(space_id: Ulid, i: u32) -> NewReservation {
    let (date, start, end) = slot(i);
    NewReservation {
        space_id,
        requester_id: Ulid::new(),
        date,
        start,
        end,
        purpose: "bench".into(),
        attendee_count: 1,
    }
}

fn open_engine(name: &str) -> Arc<Engine> {
    let dir = std::env::temp_dir().join(format!("reservo_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let policy = Policy {
        max_notice: TimeDelta::days(3650),
        ..Policy::default()
    };
    let clock = Arc::new(FixedClock::new(start_date().and_hms_opt(0, 0, 0).unwrap()));
    Arc::new(Engine::open(&dir.join(name), policy, clock).unwrap())
}

async fn space(engine: &Engine, name: String) -> Ulid {
    engine
        .create_space(NewSpace {
            name,
            kind: SpaceKind::MeetingRoom,
            building: None,
            floor: None,
            capacity: 10,
        })
        .await
        .unwrap()
        .id
}

async fn phase1_sequential() {
    let engine = open_engine("phase1.wal");
    let space_id = space(&engine, "Room 1".into()).await;

    let n = 2000;
    let mut create = Vec::with_capacity(n as usize);
    let mut approve = Vec::with_capacity(n as usize);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        let r = engine.create_reservation(request(space_id, i)).await.unwrap();
        create.push(t.elapsed());
        let t = Instant::now();
        engine.approve_reservation(r.id, Ulid::new(), None).await.unwrap();
        approve.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = (2 * n) as f64 / elapsed.as_secs_f64();
    println!("  {n} create+approve in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("create latency", &mut create);
    print_latency("approve latency", &mut approve);
}

async fn phase2_concurrent() {
    let engine = open_engine("phase2.wal");
    let n_tasks = 10;
    let n_per_task = 200;
    let mut spaces = Vec::new();
    for i in 0..n_tasks {
        spaces.push(space(&engine, format!("Room {i}")).await);
    }

    let start = Instant::now();
    let mut handles = Vec::new();
    for space_id in spaces {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            for j in 0..n_per_task {
                engine.create_reservation(request(space_id, j)).await.unwrap();
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
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load() {
    let engine = open_engine("phase3.wal");
    let space_id = space(&engine, "Room 1".into()).await;
    for i in 0..500 {
        engine.create_reservation(request(space_id, i)).await.unwrap();
    }

    let writer = {
        let engine = engine.clone();
        tokio::spawn(async move {
            for i in 500..1500 {
                engine.create_reservation(request(space_id, i)).await.unwrap();
            }
        })
    };

    let mut latencies = Vec::new();
    let mut i = 0;
    while !writer.is_finished() {
        let (date, _, _) = slot(i % 1500);
        let t = Instant::now();
        engine.free_slots(space_id, date, None).await.unwrap();
        latencies.push(t.elapsed());
        i += 1;
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();
    print_latency("free_slots latency", &mut latencies);
}

async fn phase4_contention_storm() {
    let engine = open_engine("phase4.wal");
    let space_id = space(&engine, "Room 1".into()).await;
    let slots = 50;
    let racers_per_slot = 20;

    let start = Instant::now();
    let handles: Vec<_> = (0..slots * racers_per_slot)
        .map(|k| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.create_reservation(request(space_id, k % slots)).await.is_ok() })
        })
        .collect();
    let mut admitted = 0;
    for h in handles {
        if h.await.unwrap() {
            admitted += 1;
        }
    }
    let elapsed = start.elapsed();
    println!(
        "  {} requests for {slots} slots: {admitted} admitted in {:.2}s",
        slots * racers_per_slot,
        elapsed.as_secs_f64()
    );
    assert_eq!(admitted, slots, "double booking under contention");
    assert!(engine.audit().await.is_clean());
}

#[tokio::main]
async fn main() {
    println!("=== reservo stress benchmark ===\n");

    println!("[phase 1] sequential create + approve");
    phase1_sequential().await;

    println!("\n[phase 2] concurrent writers on separate spaces");
    phase2_concurrent().await;

    println!("\n[phase 3] free-slot reads under write load");
    phase3_read_under_load().await;

    println!("\n[phase 4] contention storm on shared slots");
    phase4_contention_storm().await;

    println!("\n=== benchmark complete ===");
}
