use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::enrich::EnrichedTimeEntry;
use crate::timer::{RefreshOutcome, TimerController, TimerError, TimerState};
use crate::toggl::TrackerApi;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// Clock skew never yields a negative value.
pub fn elapsed_seconds(start: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - start).num_seconds().max(0)
}

pub fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!(
        "{}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

pub struct DurationTicker<C> {
    clock: C,
}

impl<C: Clock> DurationTicker<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    pub fn elapsed(&self, state: &TimerState) -> Option<i64> {
        match state {
            TimerState::Running { started_at, .. } => {
                Some(elapsed_seconds(*started_at, self.clock.now()))
            }
            TimerState::Stopping { entry } => Some(self.elapsed_for(entry)),
            TimerState::Idle | TimerState::Starting => None,
        }
    }

    pub fn elapsed_for(&self, entry: &EnrichedTimeEntry) -> i64 {
        elapsed_seconds(entry.entry.start, self.clock.now())
    }
}

pub struct PeriodicTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    fn spawn<F, Fut>(body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(body(shutdown_rx));
        Self { shutdown, handle }
    }

    pub async fn cancel(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

pub fn spawn_ticker<C: Clock + 'static>(
    mut timer: watch::Receiver<Option<EnrichedTimeEntry>>,
    clock: C,
    period: Duration,
) -> (watch::Receiver<Option<i64>>, PeriodicTask) {
    let ticker = DurationTicker::new(clock);
    let initial = timer
        .borrow_and_update()
        .as_ref()
        .map(|entry| ticker.elapsed_for(entry));
    let (elapsed_tx, elapsed_rx) = watch::channel(initial);

    let task = PeriodicTask::spawn(move |mut shutdown| async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                changed = timer.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = interval.tick() => {}
            }

            let elapsed = timer
                .borrow_and_update()
                .as_ref()
                .map(|entry| ticker.elapsed_for(entry));
            elapsed_tx.send_replace(elapsed);
            if elapsed_tx.is_closed() {
                break;
            }
        }
        debug!("ticker stopped");
    });

    (elapsed_rx, task)
}

// Every poll result goes to `on_result`, failures included, so the front end
// can surface them.
pub fn spawn_refresh_loop<A, F>(
    controller: TimerController<A>,
    period: Duration,
    on_result: F,
) -> PeriodicTask
where
    A: TrackerApi + ?Sized + 'static,
    F: Fn(Result<RefreshOutcome, TimerError>) + Send + 'static,
{
    PeriodicTask::spawn(move |mut shutdown| async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }

            let result = controller.refresh().await;
            match &result {
                Ok(RefreshOutcome::Applied(_)) => {}
                Ok(outcome) => debug!(?outcome, "poll not applied"),
                Err(err) => warn!(error = %err, "poll failed"),
            }
            on_result(result);
        }
        debug!("refresh loop stopped");
    })
}
