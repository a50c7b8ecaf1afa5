//! Unit supervision: spawns the acquisition units, watches them for crashes,
//! restarts them with exponential backoff, and winds them down on shutdown.
//!
//! One crashed unit never takes down the rest; a unit that crashes past the
//! cap is parked as failed while everything else keeps running.

use std::cmp::min;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::collectors::Collector;
use crate::config::{
    MAX_UNIT_RESTARTS, MONITOR_INTERVAL_SECS, RESTART_BASE_DELAY_SECS, RESTART_MAX_DELAY_SECS,
    RESTART_STABLE_SECS, SHUTDOWN_GRACE_SECS,
};
use crate::health::{HealthRegistry, HealthSnapshot};

/// Lifecycle of a supervised unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Starting,
    Running,
    Crashed,
    Restarting,
    Stopping,
    Stopped,
    Failed,
}

/// Builds a fresh task each time the unit is (re)started. Streaming units
/// rebuild their whole world on restart; polling units re-enter their loop.
pub type StreamFactory = Arc<dyn Fn(watch::Receiver<bool>) -> JoinHandle<()> + Send + Sync>;

enum UnitKind {
    Polling(Arc<dyn Collector>),
    Streaming(StreamFactory),
}

struct UnitSlot {
    name: &'static str,
    kind: UnitKind,
    state: UnitState,
    handle: Option<JoinHandle<()>>,
    crashes: u32,
    restart_at: Option<Instant>,
    last_spawn: Option<Instant>,
}

/// What the API reports for one unit.
#[derive(Debug, Clone, Serialize)]
pub struct UnitStatus {
    pub state: UnitState,
    pub crashes: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DaemonSnapshot {
    pub units: BTreeMap<String, UnitStatus>,
    pub health: HealthSnapshot,
}

pub struct Daemon {
    health: Arc<HealthRegistry>,
    units: Mutex<Vec<UnitSlot>>,
    shutdown_tx: watch::Sender<bool>,
    stopping: AtomicBool,
}

impl Daemon {
    pub fn new(health: Arc<HealthRegistry>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            health,
            units: Mutex::new(Vec::new()),
            shutdown_tx,
            stopping: AtomicBool::new(false),
        }
    }

    pub async fn add_collector(&self, collector: Arc<dyn Collector>) {
        let name = collector.name();
        self.health.register(name);
        self.units.lock().await.push(UnitSlot {
            name,
            kind: UnitKind::Polling(collector),
            state: UnitState::Starting,
            handle: None,
            crashes: 0,
            restart_at: None,
            last_spawn: None,
        });
    }

    pub async fn add_stream(&self, name: &'static str, factory: StreamFactory) {
        self.health.register(name);
        self.units.lock().await.push(UnitSlot {
            name,
            kind: UnitKind::Streaming(factory),
            state: UnitState::Starting,
            handle: None,
            crashes: 0,
            restart_at: None,
            last_spawn: None,
        });
    }

    pub async fn start(&self) {
        let now = Instant::now();
        let mut units = self.units.lock().await;
        for slot in units.iter_mut() {
            info!(unit = slot.name, "starting unit");
            slot.handle = Some(self.spawn_unit(&slot.kind));
            slot.state = UnitState::Running;
            slot.last_spawn = Some(now);
        }
        info!(units = units.len(), "all units started");
    }

    /// Starts every unit then supervises until shutdown.
    pub async fn run(&self) {
        self.start().await;

        let mut shutdown = self.shutdown_tx.subscribe();
        let mut tick = interval(Duration::from_secs(MONITOR_INTERVAL_SECS));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await; // consume immediate first tick

        loop {
            tokio::select! {
                _ = tick.tick() => self.monitor_cycle().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn spawn_unit(&self, kind: &UnitKind) -> JoinHandle<()> {
        let shutdown = self.shutdown_tx.subscribe();
        match kind {
            UnitKind::Polling(collector) => tokio::spawn(run_polling_unit(
                Arc::clone(collector),
                Arc::clone(&self.health),
                shutdown,
            )),
            UnitKind::Streaming(factory) => factory(shutdown),
        }
    }

    /// One pass over every unit: detect crashes, schedule and execute
    /// restarts, clear crash streaks for units that have stayed up.
    pub async fn monitor_cycle(&self) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        let mut units = self.units.lock().await;
        for slot in units.iter_mut() {
            match slot.state {
                UnitState::Running => {
                    let finished = slot
                        .handle
                        .as_ref()
                        .map(JoinHandle::is_finished)
                        .unwrap_or(true);
                    if finished {
                        slot.crashes += 1;
                        self.health.set_running(slot.name, false);
                        if slot.crashes > MAX_UNIT_RESTARTS {
                            error!(
                                unit = slot.name,
                                crashes = slot.crashes,
                                "unit exceeded restart cap, giving up on it"
                            );
                            slot.state = UnitState::Failed;
                        } else {
                            warn!(unit = slot.name, crash = slot.crashes, "unit crashed");
                            slot.state = UnitState::Crashed;
                        }
                    } else if let Some(spawned) = slot.last_spawn {
                        if slot.crashes > 0
                            && now.duration_since(spawned).as_secs() >= RESTART_STABLE_SECS
                        {
                            debug!(unit = slot.name, "unit stable, crash streak cleared");
                            slot.crashes = 0;
                        }
                    }
                }
                UnitState::Restarting => {
                    if slot.restart_at.map(|t| now >= t).unwrap_or(true) {
                        info!(unit = slot.name, "restarting unit");
                        slot.handle = Some(self.spawn_unit(&slot.kind));
                        slot.state = UnitState::Running;
                        slot.last_spawn = Some(now);
                        slot.restart_at = None;
                        self.health.record_restart(slot.name);
                    }
                }
                _ => {}
            }

            // A crash observed above is scheduled in the same pass, so a
            // killed unit reaches Restarting within one monitor interval.
            if slot.state == UnitState::Crashed {
                let delay = restart_delay(slot.crashes);
                info!(
                    unit = slot.name,
                    delay_secs = delay.as_secs(),
                    "restart scheduled"
                );
                slot.state = UnitState::Restarting;
                slot.restart_at = Some(now + delay);
            }
        }
    }

    /// Signals every unit, waits out a grace period per unit, then aborts
    /// stragglers. Safe to call more than once.
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("daemon stopping");
        let _ = self.shutdown_tx.send(true);

        let mut units = self.units.lock().await;
        for slot in units.iter_mut() {
            slot.state = UnitState::Stopping;
            if let Some(mut handle) = slot.handle.take() {
                match timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), &mut handle).await {
                    Ok(_) => {}
                    Err(_) => {
                        warn!(unit = slot.name, "unit did not stop in time, aborting");
                        handle.abort();
                        let _ = handle.await;
                    }
                }
            }
            slot.state = UnitState::Stopped;
            slot.restart_at = None;
            self.health.set_running(slot.name, false);
            info!(unit = slot.name, "unit stopped");
        }
        info!("daemon stopped");
    }

    pub async fn snapshot(&self) -> DaemonSnapshot {
        let units = self.units.lock().await;
        DaemonSnapshot {
            units: units
                .iter()
                .map(|s| {
                    (
                        s.name.to_string(),
                        UnitStatus { state: s.state, crashes: s.crashes },
                    )
                })
                .collect(),
            health: self.health.snapshot(),
        }
    }

    #[cfg(test)]
    async fn unit_state(&self, name: &str) -> Option<UnitState> {
        self.units
            .lock()
            .await
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.state)
    }

    #[cfg(test)]
    async fn abort_unit(&self, name: &str) {
        let units = self.units.lock().await;
        if let Some(handle) = units
            .iter()
            .find(|s| s.name == name)
            .and_then(|s| s.handle.as_ref())
        {
            handle.abort();
        }
    }
}

/// Backoff for the n-th consecutive crash: base doubles each time, capped.
fn restart_delay(crashes: u32) -> Duration {
    let exp = crashes.saturating_sub(1).min(10);
    Duration::from_secs(min(RESTART_BASE_DELAY_SECS << exp, RESTART_MAX_DELAY_SECS))
}

/// Drives one polling collector on its cadence until shutdown. Cycle
/// failures are recorded and absorbed; only panics end the task early.
async fn run_polling_unit(
    collector: Arc<dyn Collector>,
    health: Arc<HealthRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = collector.name();
    health.set_running(name, true);

    let mut tick = interval(collector.interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = tick.tick() => {
                match collector.collect_once().await {
                    Ok(rows) => {
                        debug!(unit = name, rows, "collection cycle complete");
                        health.record_success(name, rows as u64);
                    }
                    Err(e) => {
                        warn!(unit = name, "collection cycle failed: {e}");
                        health.record_failure(name, &e.to_string());
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    health.set_running(name, false);
    info!(unit = name, "collector stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU64;

    struct MockCollector {
        name: &'static str,
        calls: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Collector for MockCollector {
        fn name(&self) -> &'static str {
            self.name
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(3600)
        }

        async fn collect_once(&self) -> Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }
    }

    fn mock_collector(name: &'static str) -> (Arc<dyn Collector>, Arc<AtomicU64>) {
        let calls = Arc::new(AtomicU64::new(0));
        let collector = Arc::new(MockCollector { name, calls: Arc::clone(&calls) });
        (collector, calls)
    }

    /// A streaming unit that behaves: waits out the shutdown signal.
    fn steady_stream() -> StreamFactory {
        Arc::new(|mut rx: watch::Receiver<bool>| {
            tokio::spawn(async move {
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            })
        })
    }

    /// A streaming unit that exits immediately, i.e. a crash loop.
    fn flappy_stream() -> StreamFactory {
        Arc::new(|_rx: watch::Receiver<bool>| tokio::spawn(async {}))
    }

    #[test]
    fn restart_delay_doubles_and_caps() {
        assert_eq!(restart_delay(1), Duration::from_secs(5));
        assert_eq!(restart_delay(2), Duration::from_secs(10));
        assert_eq!(restart_delay(3), Duration::from_secs(20));
        assert_eq!(restart_delay(7), Duration::from_secs(300));
        assert_eq!(restart_delay(50), Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_unit_is_rescheduled_others_untouched() {
        let health = Arc::new(HealthRegistry::new());
        let daemon = Daemon::new(Arc::clone(&health));

        for name in ["metadata", "prices", "books", "resolutions"] {
            let (collector, _) = mock_collector(name);
            daemon.add_collector(collector).await;
        }
        daemon.add_stream("trade_listener", steady_stream()).await;
        daemon.start().await;
        tokio::task::yield_now().await;

        daemon.abort_unit("prices").await;
        tokio::task::yield_now().await;

        // A single monitor pass both detects the crash and schedules the
        // restart; the other units are untouched.
        daemon.monitor_cycle().await;
        assert_eq!(daemon.unit_state("prices").await, Some(UnitState::Restarting));
        for name in ["metadata", "books", "resolutions", "trade_listener"] {
            assert_eq!(daemon.unit_state(name).await, Some(UnitState::Running));
        }

        // Once the backoff elapses the next cycle brings it back.
        tokio::time::advance(Duration::from_secs(RESTART_BASE_DELAY_SECS + 1)).await;
        daemon.monitor_cycle().await;
        assert_eq!(daemon.unit_state("prices").await, Some(UnitState::Running));
        assert_eq!(
            daemon.snapshot().await.health.units["prices"].restart_count,
            1
        );

        daemon.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unit_exceeding_restart_cap_is_parked_as_failed() {
        let health = Arc::new(HealthRegistry::new());
        let daemon = Daemon::new(Arc::clone(&health));
        daemon.add_stream("flappy", flappy_stream()).await;
        daemon.start().await;

        for _ in 0..MAX_UNIT_RESTARTS {
            tokio::task::yield_now().await;
            daemon.monitor_cycle().await;
            assert_eq!(
                daemon.unit_state("flappy").await,
                Some(UnitState::Restarting)
            );
            tokio::time::advance(Duration::from_secs(RESTART_MAX_DELAY_SECS + 1)).await;
            daemon.monitor_cycle().await;
            assert_eq!(daemon.unit_state("flappy").await, Some(UnitState::Running));
        }

        // One crash past the cap parks it for good.
        tokio::task::yield_now().await;
        daemon.monitor_cycle().await;
        assert_eq!(daemon.unit_state("flappy").await, Some(UnitState::Failed));

        daemon.monitor_cycle().await;
        assert_eq!(daemon.unit_state("flappy").await, Some(UnitState::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_leaves_everything_stopped() {
        let health = Arc::new(HealthRegistry::new());
        let daemon = Daemon::new(Arc::clone(&health));

        let (metadata, _) = mock_collector("metadata");
        daemon.add_collector(metadata).await;
        daemon.add_stream("trade_listener", steady_stream()).await;
        daemon.start().await;
        tokio::task::yield_now().await;

        daemon.stop().await;
        assert_eq!(daemon.unit_state("metadata").await, Some(UnitState::Stopped));
        assert_eq!(
            daemon.unit_state("trade_listener").await,
            Some(UnitState::Stopped)
        );

        daemon.stop().await;
        assert_eq!(daemon.unit_state("metadata").await, Some(UnitState::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_does_not_restart_during_shutdown() {
        let health = Arc::new(HealthRegistry::new());
        let daemon = Daemon::new(Arc::clone(&health));
        daemon.add_stream("flappy", flappy_stream()).await;
        daemon.start().await;
        tokio::task::yield_now().await;

        daemon.stop().await;
        daemon.monitor_cycle().await;
        assert_eq!(daemon.unit_state("flappy").await, Some(UnitState::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn polling_unit_runs_cycles_and_reports_health() {
        let health = Arc::new(HealthRegistry::new());
        let daemon = Daemon::new(Arc::clone(&health));

        let (resolutions, calls) = mock_collector("resolutions");
        daemon.add_collector(resolutions).await;
        daemon.start().await;

        // First interval tick fires immediately.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(calls.load(Ordering::SeqCst) >= 1);

        let snap = daemon.snapshot().await;
        let unit = &snap.health.units["resolutions"];
        assert!(unit.running);
        assert!(unit.last_success.is_some());
        assert_eq!(unit.rows_ingested, 1);

        daemon.stop().await;
        let snap = daemon.snapshot().await;
        assert!(!snap.health.units["resolutions"].running);
    }
}
