/// Polling fallback: periodic authoritative refetch through the same entry
/// points as push delivery
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// What a poll cycle refetches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollTarget {
    Conversations,
    ActiveMessages,
    Notifications,
}

impl fmt::Display for PollTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PollTarget::Conversations => "conversations",
            PollTarget::ActiveMessages => "active messages",
            PollTarget::Notifications => "notifications",
        };
        f.write_str(name)
    }
}

/// Targets with a fetch in flight. Shared by the poller and the initial load.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    shared: Arc<InFlightShared>,
}

#[derive(Debug, Default)]
struct InFlightShared {
    targets: Mutex<HashSet<PollTarget>>,
    released: Notify,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `target`. `None` if a fetch for it is already running.
    pub fn try_begin(&self, target: PollTarget) -> Option<InFlightGuard> {
        let mut targets = self.shared.targets.lock().unwrap_or_else(|e| e.into_inner());
        if !targets.insert(target) {
            return None;
        }
        Some(InFlightGuard {
            shared: self.shared.clone(),
            target,
        })
    }

    /// Claim `target`, waiting for a running fetch of it to finish first
    pub async fn begin(&self, target: PollTarget) -> InFlightGuard {
        loop {
            let released = self.shared.released.notified();
            if let Some(guard) = self.try_begin(target) {
                return guard;
            }
            debug!("Waiting for in-flight fetch of {}", target);
            released.await;
        }
    }

    pub fn is_in_flight(&self, target: PollTarget) -> bool {
        self.shared
            .targets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&target)
    }
}

/// Releases its target on drop
#[derive(Debug)]
pub struct InFlightGuard {
    shared: Arc<InFlightShared>,
    target: PollTarget,
}

impl InFlightGuard {
    pub fn target(&self) -> PollTarget {
        self.target
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut targets = self.shared.targets.lock().unwrap_or_else(|e| e.into_inner());
        targets.remove(&self.target);
        drop(targets);
        self.shared.released.notify_waiters();
    }
}

/// Where poll results go
#[async_trait]
pub trait PollSink: Send + Sync {
    /// Fetch `target` and route the result through the ingestion entry points
    async fn poll(&self, target: PollTarget) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    /// Conversation list and active conversation messages
    pub conversations: Duration,
    pub notifications: Duration,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            conversations: Duration::from_secs(5),
            notifications: Duration::from_secs(10),
        }
    }
}

/// Handle to the running poll loops
pub struct PollingSynchronizer {
    shutdown: Arc<RwLock<bool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PollingSynchronizer {
    /// Spawn the poll loops. The first tick fires one period from now; the
    /// initial load covers time zero.
    pub fn start(sink: Arc<dyn PollSink>, in_flight: InFlight, schedule: PollSchedule) -> Self {
        let shutdown = Arc::new(RwLock::new(false));
        let loops = [
            (
                schedule.conversations,
                vec![PollTarget::Conversations, PollTarget::ActiveMessages],
            ),
            (schedule.notifications, vec![PollTarget::Notifications]),
        ];

        let tasks = loops
            .into_iter()
            .map(|(period, targets)| {
                let sink = sink.clone();
                let in_flight = in_flight.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    run_loop(sink, in_flight, shutdown, period, targets).await;
                })
            })
            .collect();

        info!(
            "Polling every {:?} (conversations) and {:?} (notifications)",
            schedule.conversations, schedule.notifications
        );
        Self {
            shutdown,
            tasks: Mutex::new(tasks),
        }
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
        debug!("Polling stopped");
    }

    pub async fn is_stopped(&self) -> bool {
        *self.shutdown.read().await
    }
}

async fn run_loop(
    sink: Arc<dyn PollSink>,
    in_flight: InFlight,
    shutdown: Arc<RwLock<bool>>,
    period: Duration,
    targets: Vec<PollTarget>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if *shutdown.read().await {
            break;
        }

        for &target in &targets {
            let Some(guard) = in_flight.try_begin(target) else {
                debug!("Skipping {} poll, previous fetch still in flight", target);
                continue;
            };
            let sink = sink.clone();
            tokio::spawn(async move {
                if let Err(e) = sink.poll(target).await {
                    warn!("Polling {} failed: {}", target, e);
                }
                drop(guard);
            });
        }
    }
}
