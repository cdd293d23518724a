//! Stall watchdog: a background tick loop that emits
//! `stage.stalled` once per node whose last activity has aged past the
//! stall timeout. Never cancels execution, only observes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use treadle_event::{EngineEvent, EventType};

use crate::interfaces::EventHandlerFn;

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Tracks per-node last-activity times and whether a stall warning has
/// already fired for the node's current activity window.
pub struct Watchdog {
    last_activity: DashMap<String, Instant>,
    warned: DashMap<String, bool>,
    check_interval: Duration,
    stall_timeout: Duration,
}

impl Watchdog {
    pub fn new(check_interval: Duration, stall_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            last_activity: DashMap::new(),
            warned: DashMap::new(),
            check_interval,
            stall_timeout,
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(DEFAULT_CHECK_INTERVAL, DEFAULT_STALL_TIMEOUT)
    }

    /// Marks a node as active, resetting its stall clock and warned flag.
    pub fn node_started(&self, node_id: &str) {
        self.last_activity.insert(node_id.to_string(), Instant::now());
        self.warned.insert(node_id.to_string(), false);
    }

    /// Stops tracking a node once it has reported `stage.completed` or
    /// `stage.failed`.
    pub fn node_finished(&self, node_id: &str) {
        self.last_activity.remove(node_id);
        self.warned.remove(node_id);
    }

    /// Runs one tick: collects node ids whose last activity is older than
    /// the stall timeout and haven't already been warned, marks them
    /// warned, and returns them for the caller to emit events for.
    fn tick(&self) -> Vec<String> {
        let now = Instant::now();
        let mut stalled = Vec::new();
        for entry in self.last_activity.iter() {
            let node_id = entry.key().clone();
            let elapsed = now.duration_since(*entry.value());
            if elapsed < self.stall_timeout {
                continue;
            }
            let already_warned = self.warned.get(&node_id).map(|w| *w).unwrap_or(false);
            if already_warned {
                continue;
            }
            stalled.push(node_id);
        }
        for node_id in &stalled {
            self.warned.insert(node_id.clone(), true);
        }
        stalled
    }

    /// Spawns the background tick loop. The returned handle is aborted by
    /// dropping it or calling `.abort()`; the loop never terminates on its
    /// own.
    pub fn spawn(self: Arc<Self>, on_event: Option<EventHandlerFn>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.check_interval);
            loop {
                interval.tick().await;
                let stalled = self.tick();
                // Emission happens outside the internal DashMap locks (tick()
                // above has already returned, releasing its guards) so a
                // handler that re-enters the watchdog cannot deadlock.
                if let Some(handler) = &on_event {
                    for node_id in stalled {
                        let mut event = EngineEvent::new(EventType::StageStalled, Some(node_id));
                        event.ensure_timestamp();
                        handler(event);
                    }
                }
            }
        })
    }
}
