use std::collections::HashMap;
use std::sync::Arc;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use tokio::sync::watch;
use uuid::Uuid;

use crate::models::UnreadCounts;

/// One consistent view of every unread counter of a user.
///
/// The total is derived, never stored, so it cannot drift from its parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnreadSnapshot {
    pub version: u64,
    pub messages: HashMap<Uuid, u32>,
    pub proposals: HashMap<Uuid, u32>,
    pub social: u32,
}

impl UnreadSnapshot {
    pub fn total(&self) -> u32 {
        self.messages.values().sum::<u32>() + self.proposals.values().sum::<u32>() + self.social
    }

    /// Badge for one match row: its messages plus its proposals.
    pub fn for_match(&self, match_id: Uuid) -> u32 {
        self.messages.get(&match_id).copied().unwrap_or(0) + self.proposals.get(&match_id).copied().unwrap_or(0)
    }

    pub fn knows_match(&self, match_id: Uuid) -> bool {
        self.messages.contains_key(&match_id)
    }
}

impl Serialize for UnreadSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("UnreadSnapshot", 5)?;
        state.serialize_field("version", &self.version)?;
        state.serialize_field("total", &self.total())?;
        state.serialize_field("messages", &self.messages)?;
        state.serialize_field("proposals", &self.proposals)?;
        state.serialize_field("social", &self.social)?;
        state.end()
    }
}

/// Publishes whole snapshots. Every change, delta or recount, is a single
/// swap that bumps the version by one; readers never observe a partial update.
pub struct UnreadCounter {
    tx: watch::Sender<Arc<UnreadSnapshot>>,
}

impl Default for UnreadCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl UnreadCounter {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(UnreadSnapshot::default()));
        Self { tx }
    }

    pub fn snapshot(&self) -> Arc<UnreadSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Arc<UnreadSnapshot>> {
        self.tx.subscribe()
    }

    /// Overwrites every counter with a recount.
    pub fn replace(&self, counts: UnreadCounts) -> Arc<UnreadSnapshot> {
        self.publish(move |next| {
            next.messages = counts.messages;
            next.proposals = counts.proposals;
            next.social = counts.social;
        })
    }

    /// Applies a local change on top of the current snapshot.
    pub fn apply(&self, change: impl FnOnce(&mut UnreadSnapshot)) -> Arc<UnreadSnapshot> {
        self.publish(change)
    }

    fn publish(&self, change: impl FnOnce(&mut UnreadSnapshot)) -> Arc<UnreadSnapshot> {
        let mut published = None;
        self.tx.send_modify(|current| {
            let mut next = (**current).clone();
            change(&mut next);
            next.version = current.version + 1;
            let next = Arc::new(next);
            published = Some(next.clone());
            *current = next;
        });
        published.unwrap_or_else(|| self.snapshot())
    }
}
