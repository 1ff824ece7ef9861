//! Stress tests for Linepulse
//!
//! Run with: cargo test --release stress -- --ignored

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use linepulse::*;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

fn midnight() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 14, 0, 0, 0).unwrap()
}

#[test]
#[ignore] // Run manually with --ignored
fn stress_test_apply_pulses() {
    let mut agg = TelemetryAggregator::new(
        Arc::new(MemoryPulseStore::new()),
        DayCalendar::utc(),
        Duration::minutes(5),
    );
    agg.initialize(NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(), midnight())
        .unwrap();

    let iterations = 1_000_000u64;
    let start = Instant::now();

    for i in 0..iterations {
        let ts = midnight() + Duration::milliseconds((i * 80) as i64);
        let pulse = RawPulse::new(format!("m{}", i % 50), ts)
            .id(i)
            .validate()
            .unwrap();
        agg.apply_pulse(pulse);
    }

    let elapsed = start.elapsed();
    let rate = iterations as f64 / elapsed.as_secs_f64();

    println!("Applied {} pulses in {:?}", iterations, elapsed);
    println!("Rate: {:.0} pulses/second", rate);

    let total: u64 = agg.live().snapshot().values().map(|s| s.total_count).sum();
    assert_eq!(total, iterations);
    assert!(
        rate > 100_000.0,
        "Should apply at least 100k pulses/s, got {:.0}",
        rate
    );
}

#[test]
#[ignore]
fn stress_test_concurrent_ingest() {
    let clock = Arc::new(ManualClock::new(midnight() + Duration::hours(23)));
    let telemetry = Arc::new(Telemetry::in_memory(LinepulseConfig::default(), clock).unwrap());
    telemetry.start().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let consumer = {
        let telemetry = telemetry.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            telemetry
                .run_feed(&stop, std::time::Duration::from_millis(50))
                .unwrap()
        })
    };

    let threads = 8u64;
    let per_thread = 25_000u64;
    let start = Instant::now();

    let producers: Vec<_> = (0..threads)
        .map(|t| {
            let telemetry = telemetry.clone();
            std::thread::spawn(move || {
                for i in 0..per_thread {
                    let id = t * per_thread + i;
                    let ts = midnight() + Duration::milliseconds((id * 300) as i64);
                    let raw = RawPulse::new(format!("line{}-m{}", t, i % 5), ts).id(id);
                    telemetry.ingest(raw).unwrap();
                    // redeliver every tenth pulse
                    if i % 10 == 0 {
                        let again = RawPulse::new(format!("line{}-m{}", t, i % 5), ts).id(id);
                        telemetry.ingest(again).unwrap();
                    }
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    // let the consumer drain, then stop it
    let deadline = Instant::now() + std::time::Duration::from_secs(30);
    while Instant::now() < deadline
        && telemetry.live_state().values().map(|s| s.total_count).sum::<u64>()
            < threads * per_thread
    {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    consumer.join().unwrap();

    println!(
        "Ingested {} pulses from {} threads in {:?}",
        threads * per_thread,
        threads,
        start.elapsed()
    );

    let total: u64 = telemetry.live_state().values().map(|s| s.total_count).sum();
    assert_eq!(total, threads * per_thread);
    assert!(telemetry.reconcile().unwrap().is_clean());
}

#[test]
#[ignore]
fn stress_test_journal_append() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stress.journal");
    let iterations = 100_000u64;

    let start = Instant::now();
    {
        let journal = JournalPulseStore::open(&path).unwrap();
        for i in 0..iterations {
            let ts = midnight() + Duration::seconds(i as i64 % 86_400);
            let pulse = RawPulse::new("press-1", ts).id(i).validate().unwrap();
            journal.append(pulse).unwrap();
        }
    }
    let write_elapsed = start.elapsed();

    let start = Instant::now();
    let journal = JournalPulseStore::open(&path).unwrap();
    let replay_elapsed = start.elapsed();

    println!("Appended {} pulses in {:?}", iterations, write_elapsed);
    println!("Replayed journal in {:?}", replay_elapsed);

    assert_eq!(journal.len() as u64, iterations);
    assert_eq!(journal.recovery().corrupt, 0);
}

#[test]
#[ignore]
fn stress_test_fleet_summary() {
    let day = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();
    let pulses: Vec<Pulse> = (0..500_000u64)
        .map(|i| {
            // 100 machines, one pulse every ~17s each, a stop every 4000 pulses
            let pause = (i / 4_000) as i64 * 1_200_000;
            let ts = midnight() + Duration::milliseconds((i * 170) as i64 + pause);
            RawPulse::new(format!("m{}", i % 100), ts)
                .id(i)
                .validate()
                .unwrap()
        })
        .filter(|p| DayCalendar::utc().day_of(p.timestamp) == day)
        .collect();
    let store = MemoryPulseStore::with_pulses(pulses.clone());

    let start = Instant::now();
    let fleet = daily_summary(&store, &DayCalendar::utc(), day, None, 15).unwrap();
    let elapsed = start.elapsed();

    println!(
        "Summarised {} pulses in {:?}: {} gaps",
        fleet.pulse_count,
        elapsed,
        fleet.gaps.len()
    );
    assert_eq!(fleet.pulse_count, pulses.len());
    assert!(fleet.has_data);
}
