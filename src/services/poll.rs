/// Adaptive poll timer
/// The single process-tree polling interval. Changing the cadence replaces the
/// interval outright; a generation counter makes the replacement observable.

use std::time::Duration;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

#[derive(Debug, Default)]
pub struct PollTimer {
    interval: Option<Interval>,
    period: Option<Duration>,
    generation: u64,
}

impl PollTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    /// Bumped every time a new interval is installed
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start polling at `period` unless already running
    pub fn start(&mut self, period: Duration) {
        if !self.is_running() {
            self.install(period);
        }
    }

    pub fn stop(&mut self) {
        if self.interval.take().is_some() {
            log::debug!("process poll stopped");
        }
        self.period = None;
    }

    /// Switch cadence. Only replaces the interval when the period actually changes.
    pub fn retune(&mut self, period: Duration) -> bool {
        if !self.is_running() || self.period == Some(period) {
            return false;
        }
        self.install(period);
        true
    }

    fn install(&mut self, period: Duration) {
        // First tick one full period out, never immediately
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
        self.period = Some(period);
        self.generation += 1;
        log::debug!("process poll every {}ms (generation {})", period.as_millis(), self.generation);
    }

    /// Wait for the next tick; pends forever while stopped
    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST: Duration = Duration::from_millis(1000);
    const SLOW: Duration = Duration::from_millis(3000);

    #[tokio::test(start_paused = true)]
    async fn retune_replaces_only_on_change() {
        let mut timer = PollTimer::new();
        assert!(!timer.retune(FAST));

        timer.start(SLOW);
        timer.start(FAST);
        assert_eq!(timer.period(), Some(SLOW));
        assert_eq!(timer.generation(), 1);

        assert!(!timer.retune(SLOW));
        assert_eq!(timer.generation(), 1);

        assert!(timer.retune(FAST));
        assert_eq!(timer.period(), Some(FAST));
        assert_eq!(timer.generation(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_waits_one_period() {
        let mut timer = PollTimer::new();
        timer.start(FAST);
        let started = Instant::now();
        timer.tick().await;
        assert_eq!(started.elapsed(), FAST);
        timer.tick().await;
        assert_eq!(started.elapsed(), FAST * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_timer_never_ticks() {
        let mut timer = PollTimer::new();
        timer.start(FAST);
        timer.stop();
        assert!(!timer.is_running());
        let ticked = time::timeout(SLOW * 10, timer.tick()).await;
        assert!(ticked.is_err());
    }
}
