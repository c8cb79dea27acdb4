//! Per-query scheduling: fires a notification on an `mpsc` channel at each
//! due time, either a fixed interval or a cron schedule, until stopped.
//!
//! Ported from the re-arm loop in `TimedCall`/`PeriodicCall`: rather than a
//! plain `tokio::time::interval` (which free-runs from a start instant), each
//! tick computes the delay to the next due time from a `Trigger`'s iterator
//! of wall-clock fire times, converted to the monotonic clock once at spawn
//! time. Cron schedules need this because their fire times aren't evenly
//! spaced; interval schedules use it too so both triggers share one run loop.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A query's configured schedule: a fixed interval or a cron expression.
#[derive(Debug, Clone)]
pub enum Trigger {
    Interval(Duration),
    Cron(Schedule),
}

impl Trigger {
    pub fn cron(expression: &str) -> Result<Self, cron::error::Error> {
        Schedule::from_str(expression).map(Trigger::Cron)
    }

    /// The wall-clock time of the next fire after `after`.
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval(d) => {
                Some(after + chrono::Duration::from_std(*d).unwrap_or(chrono::Duration::zero()))
            }
            Trigger::Cron(schedule) => schedule.after(&after).next(),
        }
    }
}

/// Handle to a single running schedule. Dropping this without calling
/// [`ScheduledTask::stop`] aborts the ticker task.
pub struct ScheduledTask {
    join_handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Start firing `name` on `ready_sender` according to `trigger`. The
    /// first fire happens immediately; later fires happen at each of the
    /// trigger's due times, catching up without bursting if the process was
    /// blocked past one or more of them (mirrors `_get_run_delay`'s
    /// `while next_time < now` skip-ahead). Sending the execution name
    /// (rather than a bare signal) lets every schedule share one ready
    /// channel, matching the teacher's ticker task.
    pub fn spawn(name: String, trigger: Trigger, ready_sender: mpsc::Sender<String>) -> Self {
        let join_handle = tokio::spawn(async move {
            if ready_sender.send(name.clone()).await.is_err() {
                return;
            }

            let mut wall_clock = Utc::now();
            let mut monotonic = Instant::now();

            loop {
                let Some(mut next_wall) = trigger.next_after(wall_clock) else {
                    tracing::debug!(query = %name, "schedule exhausted, stopping");
                    return;
                };

                // Skip ahead past any fire times already in the past (e.g. after
                // the process was blocked), rather than firing immediately for
                // each of them.
                let now_wall = Utc::now();
                while next_wall <= now_wall {
                    let Some(later) = trigger.next_after(next_wall) else {
                        tracing::debug!(query = %name, "schedule exhausted, stopping");
                        return;
                    };
                    next_wall = later;
                }

                let delay = (next_wall - now_wall)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::time::sleep_until(monotonic + delay).await;

                wall_clock = next_wall;
                monotonic = Instant::now();

                if ready_sender.send(name.clone()).await.is_err() {
                    tracing::debug!(query = %name, "ready channel closed, stopping");
                    return;
                }
            }
        });

        Self { join_handle }
    }

    /// Stop the schedule and wait for the ticker task to exit.
    pub async fn stop(self) {
        self.join_handle.abort();
        let _ = self.join_handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn interval_trigger_fires_immediately_then_repeatedly() {
        let (tx, mut rx) = mpsc::channel(8);
        let task = ScheduledTask::spawn(
            "q".to_string(),
            Trigger::Interval(StdDuration::from_millis(20)),
            tx,
        );

        let first = tokio::time::timeout(StdDuration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, "q");
        let second = tokio::time::timeout(StdDuration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, "q");

        task.stop().await;
    }

    #[test]
    fn cron_trigger_computes_next_fire() {
        let trigger = Trigger::cron("0 * * * * *").unwrap();
        let now = Utc::now();
        let next = trigger.next_after(now).unwrap();
        assert!(next > now);
    }
}
