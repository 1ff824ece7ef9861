//! End-to-end scenarios through the telemetry facade

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use linepulse::*;

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 14, h, m, 0).unwrap()
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
}

fn start(now: DateTime<Utc>, config: LinepulseConfig) -> (Arc<ManualClock>, Telemetry) {
    let clock = Arc::new(ManualClock::new(now));
    let telemetry = Telemetry::in_memory(config, clock.clone()).unwrap();
    telemetry.start().unwrap();
    (clock, telemetry)
}

#[test]
fn scenario_single_gap_in_a_morning() {
    let (_, t) = start(at(9, 0), LinepulseConfig::default().with_gap_threshold_minutes(15));
    for (h, m) in [(8, 0), (8, 5), (8, 31), (8, 36)] {
        t.ingest(RawPulse::new("press-1", at(h, m)).quantity(1)).unwrap();
    }

    let summary = t.daily_summary(today(), Some("press-1")).unwrap();
    assert_eq!(
        summary.gaps,
        vec![DowntimeGap {
            start: at(8, 5),
            end: at(8, 31),
            duration_minutes: 26
        }]
    );
    assert_eq!(summary.runtime_minutes, 36);
    assert_eq!(summary.total_output, 4);
    assert!(summary.has_data);
}

#[test]
fn scenario_idle_machine_has_no_data() {
    let (_, t) = start(at(9, 0), LinepulseConfig::default());
    t.ingest(RawPulse::new("press-2", at(8, 0))).unwrap();

    let summary = t.daily_summary(today(), Some("press-1")).unwrap();
    assert_eq!(summary.total_output, 0);
    assert_eq!(summary.runtime_minutes, 0);
    assert!(summary.gaps.is_empty());
    assert!(!summary.has_data);
}

#[test]
fn scenario_offline_then_back_online() {
    let config = LinepulseConfig::default().with_staleness_timeout_secs(300);
    let (clock, t) = start(at(10, 0), config);
    let monitor = t.monitor();

    t.ingest(RawPulse::new("press-1", at(10, 0))).unwrap();
    t.pump_feed().unwrap();
    let before = t.machine_state("press-1").unwrap();
    assert_eq!(before.status, MachineStatus::Online);

    clock.set(at(10, 6));
    assert_eq!(monitor.sweep(), vec!["press-1"]);
    assert_eq!(t.machine_state("press-1").unwrap().status, MachineStatus::Offline);

    clock.set(at(10, 7));
    t.ingest(RawPulse::new("press-1", at(10, 7)).quantity(3)).unwrap();
    t.pump_feed().unwrap();

    let after = t.machine_state("press-1").unwrap();
    assert_eq!(after.status, MachineStatus::Online);
    assert_eq!(after.total_count, before.total_count + 3);
}

#[test]
fn scenario_two_lanes_two_products() {
    let (_, t) = start(at(9, 0), LinepulseConfig::default());
    let changes = t.subscribe_assignments("filler-1");

    t.assign(ActiveAssignment::new("filler-1", "A", "X")).unwrap();
    t.assign(ActiveAssignment::new("filler-1", "B", "Y")).unwrap();

    let lanes = t.active_assignments("filler-1");
    assert_eq!(lanes.len(), 2);
    assert!(lanes.contains(&LaneAssignment {
        lane_id: "A".into(),
        product_sku: "X".into()
    }));
    assert!(lanes.contains(&LaneAssignment {
        lane_id: "B".into(),
        product_sku: "Y".into()
    }));
    assert_eq!(changes.drain().len(), 2);
}

#[test]
fn live_subscribers_see_every_change() {
    let (clock, t) = start(at(10, 0), LinepulseConfig::default());
    let deltas = t.subscribe_machine_state("press-1");

    t.ingest(RawPulse::new("press-1", at(10, 0))).unwrap();
    t.pump_feed().unwrap();
    clock.set(at(10, 10));
    t.monitor().sweep();

    let causes: Vec<DeltaCause> = deltas.drain().into_iter().map(|d| d.cause).collect();
    assert_eq!(causes, vec![DeltaCause::Pulse, DeltaCause::WentOffline]);
}

#[test]
fn day_boundary_follows_local_offset() {
    // UTC+2: 22:30 UTC on the 14th is already the 15th locally
    let config = LinepulseConfig::default().with_utc_offset_minutes(120);
    let (clock, t) = start(at(21, 0), config);

    t.ingest(RawPulse::new("press-1", at(21, 30))).unwrap();
    t.pump_feed().unwrap();
    assert_eq!(t.machine_state("press-1").unwrap().day, today());

    clock.set(at(22, 30));
    t.ingest(RawPulse::new("press-1", at(22, 30))).unwrap();
    t.pump_feed().unwrap();

    let state = t.machine_state("press-1").unwrap();
    assert_eq!(state.day, today().succ_opt().unwrap());
    assert_eq!(state.total_count, 1);
}

#[test]
fn journal_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pulses.journal");
    let clock = Arc::new(ManualClock::new(at(9, 0)));

    {
        let journal = Arc::new(JournalPulseStore::open(&path).unwrap());
        let t = Telemetry::new(
            LinepulseConfig::default(),
            journal,
            Arc::new(MemoryAssignmentStore::new()),
            clock.clone(),
        )
        .unwrap();
        t.start().unwrap();
        t.ingest(RawPulse::new("press-1", at(8, 0)).quantity(5)).unwrap();
        t.ingest(RawPulse::new("press-1", at(8, 58))).unwrap();
    }

    let journal = Arc::new(JournalPulseStore::open(&path).unwrap());
    let t = Telemetry::new(
        LinepulseConfig::default(),
        journal,
        Arc::new(MemoryAssignmentStore::new()),
        clock,
    )
    .unwrap();
    t.start().unwrap();

    let state = t.machine_state("press-1").unwrap();
    assert_eq!(state.total_count, 6);
    assert_eq!(state.status, MachineStatus::Online);
}
