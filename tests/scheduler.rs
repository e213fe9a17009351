mod common;
use crate::common::{register_counter, register_hanging, register_recorder, setup_tracing, wait_until};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use turnqueue::scheduler::{delay_until_next_minute, due_entries, round_to_minute, TICK_PERIOD};
use turnqueue::{
  BuildError, CronError, JobRegistry, ScheduleClock, ScheduleEntry, Scheduler, ShutdownError,
};

// Long enough for at least three minute ticks, whatever the wall clock says.
const THREE_TICKS: StdDuration = StdDuration::from_secs(181);

fn time(h: u32, m: u32, s: u32, milli: u32) -> NaiveTime {
  NaiveTime::from_hms_milli_opt(h, m, s, milli).unwrap()
}

fn datetime(h: u32, m: u32, s: u32, milli: u32) -> NaiveDateTime {
  NaiveDate::from_ymd_opt(2024, 3, 5)
    .unwrap()
    .and_time(time(h, m, s, milli))
}

#[test]
fn test_delay_until_next_minute() {
  assert_eq!(delay_until_next_minute(&time(12, 0, 0, 0)), TICK_PERIOD);
  assert_eq!(
    delay_until_next_minute(&time(12, 0, 59, 500)),
    StdDuration::from_millis(500)
  );
  assert_eq!(
    delay_until_next_minute(&time(12, 0, 30, 250)),
    StdDuration::from_millis(29_750)
  );
  assert_eq!(
    delay_until_next_minute(&time(23, 59, 59, 999)),
    StdDuration::from_millis(1)
  );
}

#[test]
fn test_round_to_minute_absorbs_jitter() {
  assert_eq!(round_to_minute(datetime(10, 14, 59, 900)), datetime(10, 15, 0, 0));
  assert_eq!(round_to_minute(datetime(10, 15, 0, 40)), datetime(10, 15, 0, 0));
  assert_eq!(round_to_minute(datetime(10, 15, 29, 0)), datetime(10, 15, 0, 0));
}

#[test]
fn test_due_entries_keep_registration_order() {
  let entries = vec![
    ScheduleEntry::new("*/15 * * * *", "jobs/quarter").unwrap(),
    ScheduleEntry::new("30 * * * *", "jobs/half").unwrap(),
    ScheduleEntry::new("0 * * * *", "jobs/hourly").unwrap(),
  ];

  let on_the_hour: Vec<&str> = due_entries(&entries, &datetime(10, 0, 0, 0))
    .into_iter()
    .map(|entry| entry.locator.as_str())
    .collect();
  assert_eq!(on_the_hour, vec!["jobs/quarter", "jobs/hourly"]);

  let half_past: Vec<&str> = due_entries(&entries, &datetime(10, 30, 0, 0))
    .into_iter()
    .map(|entry| entry.locator.as_str())
    .collect();
  assert_eq!(half_past, vec!["jobs/quarter", "jobs/half"]);

  assert!(due_entries(&entries, &datetime(10, 7, 0, 0)).is_empty());
}

#[tokio::test]
async fn test_build_rejects_invalid_cron() {
  let result = Scheduler::builder()
    .entry("* * * * *", "jobs/ok")
    .entry("61 * * * *", "jobs/bad")
    .build();
  match result {
    Err(BuildError::InvalidCron { expression, source }) => {
      assert_eq!(expression, "61 * * * *");
      assert!(matches!(source, CronError::OutOfRange { field: "minute", value: 61, .. }));
    }
    other => panic!("expected InvalidCron, got {other:?}"),
  }
}

#[tokio::test(start_paused = true)]
async fn test_hanging_run_does_not_block_other_entries() {
  setup_tracing();
  let counter = Arc::new(AtomicUsize::new(0));
  let mut registry = JobRegistry::new();
  register_hanging(&mut registry, "jobs/hang");
  register_counter(&mut registry, "jobs/count", counter.clone(), StdDuration::ZERO);

  let scheduler = Scheduler::builder()
    .entry("* * * * *", "jobs/hang")
    .entry("* * * * *", "jobs/count")
    .registry(registry)
    .clock(ScheduleClock::Utc)
    .build()
    .unwrap();
  assert_eq!(scheduler.entries().len(), 2);
  assert_eq!(scheduler.clock(), ScheduleClock::Utc);

  tokio::time::sleep(THREE_TICKS).await;

  let runs = counter.load(Ordering::SeqCst);
  assert!(runs >= 3, "counter ran {runs} times");
  let metrics = scheduler.metrics_snapshot();
  assert!(metrics.ticks >= 3);
  assert_eq!(metrics.entries_fired, metrics.ticks * 2);
  assert_eq!(metrics.runs_succeeded, runs);
  assert_eq!(metrics.runs_failed, 0);

  scheduler
    .shutdown_force(Some(StdDuration::from_secs(5)))
    .await
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_entry_payload_is_delivered_on_every_fire() {
  setup_tracing();
  let log = Arc::new(Mutex::new(Vec::new()));
  let mut registry = JobRegistry::new();
  register_recorder(&mut registry, "jobs/record", log.clone());

  let scheduler = Scheduler::builder()
    .entry_with_payload("* * * * *", "jobs/record", json!({ "report": "daily" }))
    .registry(registry)
    .build()
    .unwrap();

  tokio::time::sleep(THREE_TICKS).await;

  let log = log.lock().clone();
  assert!(log.len() >= 3);
  assert!(log.iter().all(|payload| *payload == json!({ "report": "daily" })));
  scheduler.shutdown(Some(StdDuration::from_secs(5))).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_runs_are_counted_and_scheduling_continues() {
  setup_tracing();
  let scheduler = Scheduler::builder()
    .entry("* * * * *", "jobs/unregistered")
    .build()
    .unwrap();

  tokio::time::sleep(THREE_TICKS).await;

  let metrics = scheduler.metrics_snapshot();
  assert!(metrics.ticks >= 3);
  assert_eq!(metrics.runs_failed, metrics.ticks);
  assert_eq!(metrics.runs_succeeded, 0);
  scheduler.shutdown(Some(StdDuration::from_secs(5))).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_graceful_shutdown_waits_for_running_jobs() {
  setup_tracing();
  let counter = Arc::new(AtomicUsize::new(0));
  let mut registry = JobRegistry::new();
  register_counter(
    &mut registry,
    "jobs/slow",
    counter.clone(),
    StdDuration::from_secs(30),
  );

  let scheduler = Scheduler::builder()
    .entry("* * * * *", "jobs/slow")
    .registry(registry)
    .build()
    .unwrap();

  // The first tick lands within a minute; stop while that run is still sleeping.
  let fired = wait_until(StdDuration::from_secs(61), || {
    let scheduler = scheduler.clone();
    async move { scheduler.metrics_snapshot().entries_fired >= 1 }
  })
  .await;
  assert!(fired);
  assert_eq!(counter.load(Ordering::SeqCst), 0);

  scheduler.shutdown(None).await.unwrap();
  assert_eq!(counter.load(Ordering::SeqCst), 1);
  assert_eq!(scheduler.metrics_snapshot().runs_succeeded, 1);

  assert_eq!(
    scheduler.shutdown(None).await,
    Err(ShutdownError::SignalFailed)
  );
}
