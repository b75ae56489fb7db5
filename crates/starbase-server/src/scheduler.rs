//! Scheduler
//!
//! In-process triggering of the daily incremental sync and the weekly full
//! sync from wall-clock times. `start` is idempotent; `stop` waits for the
//! in-flight job. Manual API syncs bypass the schedule but share the
//! engine's single-writer lock.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, Weekday};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use starbase_core::{SyncEngine, SyncMode, WallClock};

/// Compute the next local occurrence of `at`, optionally pinned to a
/// weekday. DST gaps skip to the next day rather than firing twice.
fn next_occurrence(
    now: DateTime<Local>,
    at: WallClock,
    weekday: Option<Weekday>,
) -> DateTime<Local> {
    for day_offset in 0..8 {
        let date = (now + ChronoDuration::days(day_offset)).date_naive();
        if let Some(required) = weekday {
            if date.weekday() != required {
                continue;
            }
        }
        let Some(naive) = date.and_hms_opt(at.hour, at.minute, 0) else {
            continue;
        };
        let Some(candidate) = naive.and_local_timezone(Local).earliest() else {
            continue;
        };
        if candidate > now {
            return candidate;
        }
    }
    // Unreachable for any valid WallClock; fall back to a day from now
    now + ChronoDuration::days(1)
}

enum Trigger {
    Daily,
    Weekly,
}

/// Singleton schedule loop around the sync engine
pub struct Scheduler {
    engine: Arc<SyncEngine>,
    daily: WallClock,
    weekly: WallClock,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>, daily: WallClock, weekly: WallClock) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            engine,
            daily,
            weekly,
            handle: std::sync::Mutex::new(None),
            shutdown,
        }
    }

    /// Spawn the schedule loop; calling again while running is a no-op
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().expect("scheduler lock poisoned");
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::debug!("Scheduler already running");
            return;
        }

        let scheduler = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        *handle = Some(tokio::spawn(async move {
            tracing::info!(
                "Scheduler started: daily {:02}:{:02}, weekly Sun {:02}:{:02}",
                scheduler.daily.hour,
                scheduler.daily.minute,
                scheduler.weekly.hour,
                scheduler.weekly.minute
            );

            loop {
                let now = Local::now();
                let next_daily = next_occurrence(now, scheduler.daily, None);
                let next_weekly = next_occurrence(now, scheduler.weekly, Some(Weekday::Sun));
                let (next_at, trigger) = if next_weekly <= next_daily {
                    (next_weekly, Trigger::Weekly)
                } else {
                    (next_daily, Trigger::Daily)
                };

                let wait = (next_at - now)
                    .to_std()
                    .unwrap_or(std::time::Duration::from_secs(1));
                tracing::debug!("Next scheduled sync at {}", next_at);

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Scheduler stopping");
                        return;
                    }
                }

                let mode = match trigger {
                    Trigger::Daily => SyncMode::Incremental,
                    Trigger::Weekly => SyncMode::Full,
                };
                match scheduler.engine.sync(mode).await {
                    Ok(report) => tracing::info!(
                        "Scheduled {:?} sync done: +{} ~{} -{}",
                        mode,
                        report.counters.added,
                        report.counters.updated,
                        report.counters.deleted
                    ),
                    // Conflict just means a manual sync got there first
                    Err(e) => tracing::warn!("Scheduled sync skipped: {}", e),
                }
            }
        }));
    }

    /// Signal shutdown and wait for the in-flight job to finish
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = {
            let mut guard = self.handle.lock().expect("scheduler lock poisoned");
            guard.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_next_daily_later_today() {
        // 2026-08-01 is a Saturday
        let now = local(2026, 8, 1, 1, 0);
        let next = next_occurrence(now, WallClock { hour: 2, minute: 0 }, None);
        assert_eq!(next, local(2026, 8, 1, 2, 0));
    }

    #[test]
    fn test_next_daily_rolls_over_midnight() {
        let now = local(2026, 8, 1, 2, 30);
        let next = next_occurrence(now, WallClock { hour: 2, minute: 0 }, None);
        assert_eq!(next, local(2026, 8, 2, 2, 0));
    }

    #[test]
    fn test_next_weekly_lands_on_sunday() {
        let now = local(2026, 8, 1, 12, 0); // Saturday
        let next = next_occurrence(now, WallClock { hour: 3, minute: 0 }, Some(Weekday::Sun));
        assert_eq!(next, local(2026, 8, 2, 3, 0));
        assert_eq!(next.weekday(), Weekday::Sun);
    }

    #[test]
    fn test_next_weekly_skips_past_sunday_slot() {
        let now = local(2026, 8, 2, 4, 0); // Sunday, after the slot
        let next = next_occurrence(now, WallClock { hour: 3, minute: 0 }, Some(Weekday::Sun));
        assert_eq!(next, local(2026, 8, 9, 3, 0));
    }

    #[test]
    fn test_exact_boundary_moves_to_next_slot() {
        let now = local(2026, 8, 1, 2, 0);
        let next = next_occurrence(now, WallClock { hour: 2, minute: 0 }, None);
        assert_eq!(next, local(2026, 8, 2, 2, 0));
    }
}
