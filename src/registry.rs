use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, TimeInfo};
use crate::session::{ServerMessage, SessionState};
use crate::stats::StatsProvider;
use crate::weather::WeatherProvider;

struct ConnectionEntry {
    outbound: mpsc::Sender<ServerMessage>,
    state: SessionState,
    timers: Vec<JoinHandle<()>>,
}

/// Live connections keyed by id, each owning its periodic push timers.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<Uuid, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Uuid, ConnectionEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn connect(&self, id: Uuid, outbound: mpsc::Sender<ServerMessage>) {
        self.entries().insert(
            id,
            ConnectionEntry {
                outbound,
                state: SessionState::Connecting,
                timers: Vec::new(),
            },
        );
    }

    /// Attach the connection's timers and mark it active. Timers for an
    /// unknown id are aborted immediately.
    pub fn activate(&self, id: Uuid, timers: Vec<JoinHandle<()>>) -> bool {
        let mut entries = self.entries();
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.timers.extend(timers);
                entry.state = SessionState::Active;
                true
            }
            None => {
                timers.iter().for_each(JoinHandle::abort);
                false
            }
        }
    }

    /// Abort the connection's timers and forget it.
    pub fn remove(&self, id: Uuid) -> bool {
        let entry = self.entries().remove(&id);
        match entry {
            Some(entry) => {
                entry.timers.iter().for_each(JoinHandle::abort);
                debug!(connection = %id, timers = entry.timers.len(), "connection timers stopped");
                true
            }
            None => false,
        }
    }

    pub fn state(&self, id: Uuid) -> SessionState {
        self.entries()
            .get(&id)
            .map(|entry| entry.state)
            .unwrap_or(SessionState::Closed)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Queue `message` on every active connection without waiting; returns
    /// how many accepted it.
    pub fn broadcast(&self, message: &ServerMessage) -> usize {
        let targets: Vec<(Uuid, mpsc::Sender<ServerMessage>)> = self
            .entries()
            .iter()
            .filter(|(_, entry)| entry.state == SessionState::Active)
            .map(|(id, entry)| (*id, entry.outbound.clone()))
            .collect();

        let mut delivered = 0;
        for (id, outbound) in targets {
            match outbound.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(connection = %id, event = message.event_name(), "outbound queue full; frame dropped")
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(connection = %id, event = message.event_name(), "outbound queue closed; frame dropped")
                }
            }
        }
        delivered
    }
}

fn ticker(period: Duration) -> time::Interval {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Push `timeUpdate` every `period`, starting immediately.
pub fn spawn_time_updates(
    id: Uuid,
    outbound: mpsc::Sender<ServerMessage>,
    clock: Arc<dyn Clock>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = ticker(period);
        loop {
            interval.tick().await;
            let message = ServerMessage::TimeUpdate(TimeInfo::now(clock.as_ref()));
            if let Err(TrySendError::Closed(_)) = outbound.try_send(message) {
                debug!(connection = %id, "time updates stopped");
                break;
            }
        }
    })
}

/// Push `weatherUpdate` for the default location every `period`, starting
/// immediately.
pub fn spawn_weather_updates(
    id: Uuid,
    outbound: mpsc::Sender<ServerMessage>,
    weather: Arc<dyn WeatherProvider>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = ticker(period);
        loop {
            interval.tick().await;
            let report = weather.current(None).await;
            if report.error {
                warn!(connection = %id, message = ?report.message, "weather update failed");
            }
            if let Err(TrySendError::Closed(_)) = outbound.try_send(ServerMessage::WeatherUpdate(report)) {
                debug!(connection = %id, "weather updates stopped");
                break;
            }
        }
    })
}

/// Process-wide `systemStats` pusher.
pub struct Broadcaster {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Broadcaster {
    /// Sample and broadcast once now, then every `period`.
    pub fn start(
        registry: Arc<ConnectionRegistry>,
        stats: Arc<dyn StatsProvider>,
        period: Duration,
    ) -> Self {
        info!(period_secs = period.as_secs_f64(), "starting system stats broadcaster");
        let handle = tokio::spawn(async move {
            let mut interval = ticker(period);
            loop {
                interval.tick().await;
                match stats.snapshot().await {
                    Ok(snapshot) => {
                        let delivered = registry.broadcast(&ServerMessage::SystemStats(snapshot));
                        debug!(delivered, "system stats broadcast");
                    }
                    Err(err) => warn!(error = %format!("{err:#}"), "system stats sample failed"),
                }
            }
        });
        Self {
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .map(|handle| handle.as_ref().is_some_and(|task| !task.is_finished()))
            .unwrap_or(false)
    }

    pub fn shutdown(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            info!("system stats broadcaster stopped");
        }
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::tests::{FixedClock, moment};
    use crate::testing::{StubStats, StubWeather};

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(message) = rx.try_recv() {
            names.push(message.event_name());
        }
        names
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timers_push_immediately_then_periodically_until_removed() {
        let registry = ConnectionRegistry::new();
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(32);
        registry.connect(id, tx.clone());
        assert_eq!(registry.state(id), SessionState::Connecting);

        let weather = Arc::new(StubWeather::default());
        let timers = vec![
            spawn_time_updates(id, tx.clone(), Arc::new(FixedClock(moment(14, 5, 0))), Duration::from_secs(1)),
            spawn_weather_updates(id, tx, weather.clone(), Duration::from_secs(300)),
        ];
        assert!(registry.activate(id, timers));
        assert_eq!(registry.state(id), SessionState::Active);

        settle().await;
        let mut first = drain(&mut rx);
        first.sort_unstable();
        assert_eq!(first, vec!["timeUpdate", "weatherUpdate"]);

        time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(drain(&mut rx), vec!["timeUpdate"]);
        assert_eq!(weather.requests(), vec![None]);

        assert!(registry.remove(id));
        assert_eq!(registry.state(id), SessionState::Closed);
        time::advance(Duration::from_secs(600)).await;
        settle().await;
        drain(&mut rx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_skips_full_queues_and_inactive_connections() {
        let registry = ConnectionRegistry::new();
        let (roomy_tx, mut roomy_rx) = mpsc::channel(4);
        let (full_tx, mut full_rx) = mpsc::channel(1);
        let (pending_tx, mut pending_rx) = mpsc::channel(4);

        let roomy = Uuid::new_v4();
        let full = Uuid::new_v4();
        registry.connect(roomy, roomy_tx);
        registry.connect(full, full_tx.clone());
        registry.connect(Uuid::new_v4(), pending_tx);
        registry.activate(roomy, Vec::new());
        registry.activate(full, Vec::new());

        let time = ServerMessage::TimeUpdate(TimeInfo::at(moment(8, 0, 0)));
        full_tx.try_send(time.clone()).expect("fill queue");

        assert_eq!(registry.broadcast(&time), 1);
        assert_eq!(drain(&mut roomy_rx), vec!["timeUpdate"]);
        assert_eq!(drain(&mut full_rx), vec!["timeUpdate"]);
        assert!(drain(&mut pending_rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn broadcaster_ticks_at_start_and_each_period() {
        let registry = Arc::new(ConnectionRegistry::new());
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(8);
        registry.connect(id, tx);
        registry.activate(id, Vec::new());

        let stats = Arc::new(StubStats::default());
        let broadcaster = Broadcaster::start(Arc::clone(&registry), stats.clone(), Duration::from_secs(5));
        settle().await;
        assert_eq!(drain(&mut rx), vec!["systemStats"]);

        time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(drain(&mut rx), vec!["systemStats"]);
        assert_eq!(stats.calls(), 2);

        broadcaster.shutdown();
        settle().await;
        assert!(!broadcaster.is_running());
        time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_samples_do_not_stop_the_broadcaster() {
        let registry = Arc::new(ConnectionRegistry::new());
        let stats = Arc::new(StubStats::default());
        stats.fail();
        let broadcaster = Broadcaster::start(registry, stats.clone(), Duration::from_secs(5));
        settle().await;
        time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(stats.calls(), 2);
        assert!(broadcaster.is_running());
    }
}
