use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

use rally_messaging::models::Message;
use rally_shared::clients::realtime::{ChannelHandle, Channels};
use rally_shared::errors::{AppResult, ErrorCode};
use rally_shared::schema;
use rally_shared::types::event::{ChangeEvent, ChangeKind};

use crate::counter::{UnreadCounter, UnreadSnapshot};
use crate::events::subscriber;
use crate::models::Delta;
use crate::services::NotificationService;

fn column_uuid(event: &ChangeEvent, column: &str) -> Option<Uuid> {
    event
        .column(column)
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}

/// A started center: its push channel plus the periodic recount that
/// reconciles whatever the channel missed. Dropping it stops both.
pub struct Tracking {
    channel: ChannelHandle,
    reconcile: JoinHandle<()>,
}

impl Tracking {
    pub fn channel_name(&self) -> &str {
        self.channel.name()
    }

    pub fn is_active(&self) -> bool {
        self.channel.is_active() && !self.reconcile.is_finished()
    }
}

impl Drop for Tracking {
    fn drop(&mut self) {
        self.reconcile.abort();
    }
}

/// Unread state of one signed-in user.
///
/// Push events move the counters by small deltas; a resync replaces all of them
/// in one swap. Deltas that land while a recount is in flight are journaled and
/// replayed on top of it, so neither path loses the other's work.
pub struct NotificationCenter {
    user_id: Uuid,
    service: NotificationService,
    counter: UnreadCounter,
    journal: Mutex<Option<Vec<Delta>>>,
    resync_gate: Mutex<()>,
}

impl NotificationCenter {
    pub fn new(user_id: Uuid, service: NotificationService) -> Self {
        Self {
            user_id,
            service,
            counter: UnreadCounter::new(),
            journal: Mutex::new(None),
            resync_gate: Mutex::new(()),
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn snapshot(&self) -> Arc<UnreadSnapshot> {
        self.counter.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<Arc<UnreadSnapshot>> {
        self.counter.watch()
    }

    /// Opens the user's push channel, recounts from scratch, then keeps
    /// recounting every `resync_every`.
    pub async fn start(self: &Arc<Self>, channels: &Channels, resync_every: Duration) -> AppResult<Tracking> {
        let channel = subscriber::listen_unread_events(self.clone(), channels).await?;
        self.resync().await?;
        let reconcile = tokio::spawn(reconcile_periodically(Arc::downgrade(self), resync_every));
        Ok(Tracking { channel, reconcile })
    }

    /// Replaces every counter with an authoritative recount. On error the
    /// previous snapshot stays in place.
    pub async fn resync(&self) -> AppResult<Arc<UnreadSnapshot>> {
        let _gate = self.resync_gate.lock().await;
        *self.journal.lock().await = Some(Vec::new());

        let fetched = self.service.fetch_unread_counts(self.user_id).await;

        let mut journal = self.journal.lock().await;
        let deltas = journal.take().unwrap_or_default();
        let mut counts = match fetched {
            Ok(counts) => counts,
            Err(e) => {
                metrics::counter!("rally_unread_resyncs_total", "outcome" => "failed").increment(1);
                return Err(e);
            }
        };
        let replayed = counts.replay(&deltas);
        let snapshot = self.counter.replace(counts);
        drop(journal);

        metrics::counter!("rally_unread_resyncs_total", "outcome" => "ok").increment(1);
        tracing::debug!(
            user_id = %self.user_id,
            version = snapshot.version,
            total = snapshot.total(),
            replayed,
            "unread counters resynced"
        );
        Ok(snapshot)
    }

    /// Zeroes the message counter of one match, locally. Proposal counters are
    /// untouched; a pending proposal still needs an answer.
    pub fn mark_match_as_read(&self, match_id: Uuid) -> Arc<UnreadSnapshot> {
        self.counter.apply(|snapshot| {
            if let Some(count) = snapshot.messages.get_mut(&match_id) {
                *count = 0;
            }
        })
    }

    pub async fn handle_event(&self, event: &ChangeEvent) -> AppResult<()> {
        match event.table.as_str() {
            schema::MESSAGES => self.on_message(event).await,
            schema::MATCH_PROPOSALS => self.on_proposal(event).await,
            schema::NOTIFICATIONS => self.on_notification(event).await,
            other => {
                tracing::trace!(table = other, "ignoring change");
                Ok(())
            }
        }
    }

    async fn on_message(&self, event: &ChangeEvent) -> AppResult<()> {
        if event.kind != ChangeKind::Insert {
            return Ok(());
        }
        let message = match event.decode::<Message>() {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "undecodable message change");
                return Ok(());
            }
        };
        if message.sender_id == self.user_id || message.read {
            return Ok(());
        }

        let delta = Delta::Message {
            match_id: message.match_id,
            id: message.id,
        };
        {
            let mut journal = self.journal.lock().await;
            if let Some(pending) = journal.as_mut() {
                pending.push(delta);
            }
            if self.counter.snapshot().knows_match(message.match_id) {
                self.counter
                    .apply(|snapshot| *snapshot.messages.entry(message.match_id).or_default() += 1);
                return Ok(());
            }
        }

        // Not in the snapshot: either someone else's match or one created
        // since the last recount.
        match self.service.matches().get_match(message.match_id).await {
            Ok(found) if found.involves(self.user_id) => {
                tracing::debug!(match_id = %message.match_id, "message for a new match, resyncing");
                self.resync().await.map(|_| ())
            }
            Ok(_) => Ok(()),
            Err(e) if e.is(ErrorCode::MatchNotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn on_proposal(&self, event: &ChangeEvent) -> AppResult<()> {
        let involved = ["sender_id", "receiver_id"]
            .iter()
            .any(|column| column_uuid(event, column) == Some(self.user_id))
            || column_uuid(event, "match_id").is_some_and(|m| self.counter.snapshot().knows_match(m));
        if !involved {
            return Ok(());
        }

        tracing::debug!(kind = event.kind.as_str(), "proposal changed, resyncing");
        self.resync().await.map(|_| ())
    }

    async fn on_notification(&self, event: &ChangeEvent) -> AppResult<()> {
        if column_uuid(event, "user_id").is_some_and(|owner| owner != self.user_id) {
            return Ok(());
        }

        if event.kind != ChangeKind::Insert {
            return self.resync().await.map(|_| ());
        }

        let unread = event.column("read").and_then(|v| v.as_bool()) != Some(true);
        let Some(id) = column_uuid(event, "id") else {
            return Ok(());
        };
        if !unread {
            return Ok(());
        }

        let mut journal = self.journal.lock().await;
        if let Some(pending) = journal.as_mut() {
            pending.push(Delta::Social { id });
        }
        self.counter.apply(|snapshot| snapshot.social += 1);
        Ok(())
    }
}

/// Ends on its own once the center is gone.
async fn reconcile_periodically(center: Weak<NotificationCenter>, every: Duration) {
    let mut ticks = interval_at(Instant::now() + every, every);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticks.tick().await;
        let Some(center) = center.upgrade() else {
            break;
        };
        if let Err(e) = center.resync().await {
            tracing::warn!(user_id = %center.user_id(), error = %e, "scheduled unread resync failed");
        }
    }
}
