//! Periodic driver for master and slave ticks.
//!
//! One tokio task per directory. Stop requests travel over a `watch` channel
//! and are only observed between ticks, so a tick that has started always
//! runs to completion before [`SchedulerHandle::stop`] returns.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Instrument, Span};

use crate::error::{ReplError, ReplResult};

/// Work a scheduler runs on every tick.
#[async_trait]
pub trait RefreshTask: Send + Sync + 'static {
    /// Name used in logs, usually the directory name.
    fn name(&self) -> &str;

    /// Span the scheduler runs ticks in.
    fn span(&self) -> &Span;

    /// One synchronization attempt.
    async fn tick(&self) -> ReplResult<()>;
}

/// Counters published by a running scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Ticks run, successful or not.
    pub ticks: u64,
    /// Ticks that returned an error.
    pub failures: u64,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
}

/// Handle to a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    trigger: mpsc::Sender<()>,
    stats: watch::Receiver<SchedulerStats>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Name of the task being driven.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests a tick as soon as the current one (if any) finishes.
    ///
    /// Returns false when a trigger is already pending or the scheduler stopped.
    pub fn trigger(&self) -> bool {
        self.trigger.try_send(()).is_ok()
    }

    /// Latest counters.
    pub fn stats(&self) -> SchedulerStats {
        self.stats.borrow().clone()
    }

    /// Number of ticks run so far.
    pub fn tick_count(&self) -> u64 {
        self.stats.borrow().ticks
    }

    /// Whether the driving task is still alive.
    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    /// Waits until at least `ticks` ticks have run.
    pub async fn wait_for_ticks(&mut self, ticks: u64) -> ReplResult<()> {
        self.stats
            .wait_for(|s| s.ticks >= ticks)
            .await
            .map(|_| ())
            .map_err(|_| ReplError::Shutdown)
    }

    /// Stops the scheduler, letting an in-flight tick finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            warn!(task = %self.name, error = %e, "refresh scheduler ended abnormally");
        }
    }
}

/// Spawns refresh loops.
pub struct RefreshScheduler;

impl RefreshScheduler {
    /// Starts driving `task` every `interval`, with the first tick immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(task: Arc<dyn RefreshTask>, interval: Duration) -> SchedulerHandle {
        let interval = interval.max(Duration::from_millis(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (stats_tx, stats_rx) = watch::channel(SchedulerStats::default());
        let name = task.name().to_string();
        let span = task.span().clone();

        let join = tokio::spawn(
            run(task, interval, shutdown_rx, trigger_rx, stats_tx).instrument(span),
        );

        SchedulerHandle {
            name,
            shutdown: shutdown_tx,
            trigger: trigger_tx,
            stats: stats_rx,
            join,
        }
    }
}

async fn run(
    task: Arc<dyn RefreshTask>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut trigger: mpsc::Receiver<()>,
    stats_tx: watch::Sender<SchedulerStats>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_ms = interval.as_millis() as u64, "refresh scheduler started");

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
            Some(()) = trigger.recv() => {
                ticker.reset();
            }
        }

        let result = task.tick().await;
        stats_tx.send_modify(|stats| {
            stats.ticks += 1;
            if let Err(e) = &result {
                stats.failures += 1;
                stats.last_error = Some(e.to_string());
            }
        });
        match result {
            Ok(()) => debug!("tick finished"),
            Err(e) => warn!(error = %e, "tick failed, retrying next interval"),
        }
    }

    info!("refresh scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug)]
    struct CountingTask {
        span: Span,
        ticks: AtomicU64,
        fail_on: Mutex<Vec<u64>>,
        tick_duration: Duration,
    }

    impl CountingTask {
        fn new() -> Self {
            Self {
                span: Span::none(),
                ticks: AtomicU64::new(0),
                fail_on: Mutex::new(Vec::new()),
                tick_duration: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl RefreshTask for CountingTask {
        fn name(&self) -> &str {
            "Animal.1"
        }

        fn span(&self) -> &Span {
            &self.span
        }

        async fn tick(&self) -> ReplResult<()> {
            let n = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.tick_duration.is_zero() {
                tokio::time::sleep(self.tick_duration).await;
            }
            if self.fail_on.lock().contains(&n) {
                return Err(ReplError::Io(std::io::Error::other("injected")));
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_follow_interval() {
        let task = Arc::new(CountingTask::new());
        let mut handle = RefreshScheduler::spawn(task.clone(), Duration::from_secs(10));

        handle.wait_for_ticks(1).await.unwrap();
        assert_eq!(task.ticks.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(handle.tick_count(), 3);

        handle.stop().await;
        assert_eq!(task.ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_loop() {
        let task = Arc::new(CountingTask::new());
        task.fail_on.lock().extend([1, 2]);
        let mut handle = RefreshScheduler::spawn(task.clone(), Duration::from_secs(1));

        handle.wait_for_ticks(3).await.unwrap();
        let stats = handle.stats();
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.last_error.as_deref(), Some("I/O error: injected"));
        assert!(handle.is_running());
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_runs_immediately() {
        let task = Arc::new(CountingTask::new());
        let mut handle = RefreshScheduler::spawn(task.clone(), Duration::from_secs(3600));
        handle.wait_for_ticks(1).await.unwrap();

        assert!(handle.trigger());
        handle.wait_for_ticks(2).await.unwrap();
        assert_eq!(task.ticks.load(Ordering::SeqCst), 2);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_in_flight_tick() {
        let mut task = CountingTask::new();
        task.tick_duration = Duration::from_secs(5);
        let task = Arc::new(task);
        let handle = RefreshScheduler::spawn(task.clone(), Duration::from_secs(60));

        // Let the first tick start, then stop in the middle of it.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(task.ticks.load(Ordering::SeqCst), 1);
        assert_eq!(handle.tick_count(), 0);

        let stats = handle.stats.clone();
        handle.stop().await;
        assert_eq!(stats.borrow().ticks, 1);
    }
}
