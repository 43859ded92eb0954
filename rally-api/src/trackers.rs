use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use rally_notification::{NotificationCenter, NotificationService, Tracking};
use rally_shared::clients::Channels;
use rally_shared::errors::AppResult;

#[derive(Debug)]
struct Activity {
    born: Instant,
    watchers: AtomicUsize,
    last_seen_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            born: Instant::now(),
            watchers: AtomicUsize::new(0),
            last_seen_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = u64::try_from(self.born.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_seen_ms.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last_seen = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.born.elapsed().saturating_sub(last_seen)
    }

    fn is_watched(&self) -> bool {
        self.watchers.load(Ordering::Acquire) > 0
    }
}

struct Tracker {
    center: Arc<NotificationCenter>,
    activity: Arc<Activity>,
    _tracking: Tracking,
}

/// Keeps a tracker from being evicted while a stream is reading it.
#[derive(Debug)]
pub struct WatchLease {
    activity: Arc<Activity>,
}

impl Drop for WatchLease {
    fn drop(&mut self) {
        self.activity.watchers.fetch_sub(1, Ordering::AcqRel);
        self.activity.touch();
    }
}

/// Live unread trackers, one per user who asked for their counters.
///
/// A tracker lives while a stream holds a [`WatchLease`] on it, and for
/// `max_idle` after its last use; the sweeper removes it after that.
pub struct UnreadTrackers {
    trackers: DashMap<Uuid, Tracker>,
    starting: Mutex<()>,
    resync_every: Duration,
}

impl UnreadTrackers {
    pub fn new(resync_every: Duration) -> Self {
        Self {
            trackers: DashMap::new(),
            starting: Mutex::new(()),
            resync_every,
        }
    }

    pub fn get(&self, user_id: Uuid) -> Option<Arc<NotificationCenter>> {
        self.trackers.get(&user_id).map(|t| {
            t.activity.touch();
            t.center.clone()
        })
    }

    /// The user's tracker, started (push channel plus first recount) on first use.
    pub async fn get_or_start(
        &self,
        user_id: Uuid,
        service: &NotificationService,
        channels: &Channels,
    ) -> AppResult<Arc<NotificationCenter>> {
        if let Some(center) = self.get(user_id) {
            return Ok(center);
        }

        // Two starts for one user would fight over the same channel name.
        let _starting = self.starting.lock().await;
        if let Some(center) = self.get(user_id) {
            return Ok(center);
        }

        let center = Arc::new(NotificationCenter::new(user_id, service.clone()));
        let tracking = center.start(channels, self.resync_every).await?;
        let activity = Arc::new(Activity::new());
        activity.touch();
        self.trackers.insert(
            user_id,
            Tracker {
                center: center.clone(),
                activity,
                _tracking: tracking,
            },
        );

        tracing::info!(user_id = %user_id, trackers = self.trackers.len(), "unread tracker started");
        Ok(center)
    }

    /// Like [`get_or_start`](Self::get_or_start), plus a lease that pins the
    /// tracker until it is dropped.
    pub async fn watch(
        &self,
        user_id: Uuid,
        service: &NotificationService,
        channels: &Channels,
    ) -> AppResult<(Arc<NotificationCenter>, WatchLease)> {
        loop {
            self.get_or_start(user_id, service, channels).await?;
            if let Some(leased) = self.lease(user_id) {
                return Ok(leased);
            }
            // Evicted between start and lease; start again.
        }
    }

    fn lease(&self, user_id: Uuid) -> Option<(Arc<NotificationCenter>, WatchLease)> {
        let tracker = self.trackers.get(&user_id)?;
        tracker.activity.watchers.fetch_add(1, Ordering::AcqRel);
        tracker.activity.touch();
        Some((
            tracker.center.clone(),
            WatchLease {
                activity: tracker.activity.clone(),
            },
        ))
    }

    /// Drops the user's tracker, closing its channel and its recount timer.
    pub fn stop(&self, user_id: Uuid) -> bool {
        let stopped = self.trackers.remove(&user_id).is_some();
        if stopped {
            tracing::info!(user_id = %user_id, trackers = self.trackers.len(), "unread tracker stopped");
        }
        stopped
    }

    /// Removes trackers nobody streams from and nobody used for `max_idle`.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let before = self.trackers.len();
        self.trackers
            .retain(|_, tracker| tracker.activity.is_watched() || tracker.activity.idle_for() < max_idle);
        let evicted = before.saturating_sub(self.trackers.len());
        if evicted > 0 {
            tracing::info!(evicted, trackers = self.trackers.len(), "idle unread trackers evicted");
        }
        evicted
    }

    /// Runs [`evict_idle`](Self::evict_idle) every `every` until the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, max_idle: Duration) -> JoinHandle<()> {
        let trackers: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(every);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                let Some(trackers) = trackers.upgrade() else {
                    break;
                };
                trackers.evict_idle(max_idle);
            }
        })
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }
}
