use crate::clock::Clock;
use crate::namer::TriggerKind;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};
use tracing::debug;

/// Time left until the next local 00:00:00 after `now`.
///
/// Computed from the wall clock each time so DST shifts do not accumulate.
/// When midnight does not exist in the zone (a DST gap) the first valid
/// instant after it is used.
pub fn until_next_midnight<Tz: TimeZone>(now: &DateTime<Tz>) -> Duration {
    let tz = now.timezone();
    let tomorrow = now
        .date_naive()
        .succ_opt()
        .unwrap_or(now.date_naive())
        .and_time(chrono::NaiveTime::MIN);

    let next = tz
        .from_local_datetime(&tomorrow)
        .earliest()
        .or_else(|| {
            tz.from_local_datetime(&(tomorrow + ChronoDuration::hours(1)))
                .earliest()
        });

    match next {
        Some(next) => next
            .signed_duration_since(now.clone())
            .to_std()
            .unwrap_or(Duration::ZERO),
        None => Duration::from_secs(24 * 60 * 60),
    }
}

/// The periodic ticker and the midnight ticker
pub struct UploadTrigger {
    periodic: Interval,
    midnight: Pin<Box<Sleep>>,
    clock: Arc<dyn Clock>,
}

impl UploadTrigger {
    /// The first periodic tick fires one full `period` after creation.
    pub fn new(period: Duration, clock: Arc<dyn Clock>) -> Self {
        let mut periodic = interval_at(Instant::now() + period, period);
        periodic.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let midnight = Box::pin(sleep(until_next_midnight(&clock.now())));

        Self {
            periodic,
            midnight,
            clock,
        }
    }

    fn rearm_midnight(&mut self) {
        let wait = until_next_midnight(&self.clock.now());
        debug!(wait_secs = wait.as_secs(), "Midnight ticker re-armed");
        self.midnight.as_mut().reset(Instant::now() + wait);
    }

    /// Wait for whichever ticker fires next.
    ///
    /// Cancel safe: dropping the future loses no tick.
    pub async fn tick(&mut self) -> TriggerKind {
        tokio::select! {
            _ = self.periodic.tick() => TriggerKind::Periodic,
            _ = &mut self.midnight => {
                self.rearm_midnight();
                TriggerKind::Midnight
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::{FixedOffset, Local};

    fn at(h: u32, m: u32, s: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 2, 28, h, m, s)
            .unwrap()
    }

    #[test]
    fn test_until_next_midnight() {
        assert_eq!(until_next_midnight(&at(23, 59, 50)), Duration::from_secs(10));
        assert_eq!(until_next_midnight(&at(12, 0, 0)), Duration::from_secs(12 * 3600));
    }

    #[test]
    fn test_exactly_midnight_waits_a_full_day() {
        assert_eq!(
            until_next_midnight(&at(0, 0, 0)),
            Duration::from_secs(24 * 3600)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_ticks_after_one_period() {
        let clock = Arc::new(FixedClock(Local.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        let mut trigger = UploadTrigger::new(Duration::from_secs(60), clock);

        let started = Instant::now();
        assert_eq!(trigger.tick().await, TriggerKind::Periodic);
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_midnight_fires_and_rearms() {
        let clock = Arc::new(FixedClock(
            Local.with_ymd_and_hms(2024, 3, 1, 23, 59, 30).unwrap(),
        ));
        let mut trigger = UploadTrigger::new(Duration::from_secs(3600), clock);

        assert_eq!(trigger.tick().await, TriggerKind::Midnight);
        // Frozen clock: the next midnight is again 30s away
        assert_eq!(trigger.tick().await, TriggerKind::Midnight);
    }
}
