use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use super::data::{operand, values_equal, DataError, DataService};
use crate::types::event::{ChangeEvent, ChangeKind};

/// Buffer between a feed forwarder and the channel pump.
pub const SUBSCRIPTION_BUFFER: usize = 256;

/// One table (and optionally one `column = value` predicate) a channel listens to.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub table: String,
    pub events: Vec<ChangeKind>,
    pub filter: Option<(String, Value)>,
}

impl Binding {
    /// Listens to every kind of change on `table`.
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            events: ChangeKind::ALL.to_vec(),
            filter: None,
        }
    }

    pub fn events(mut self, events: &[ChangeKind]) -> Self {
        self.events = events.to_vec();
        self
    }

    pub fn filter_eq<T: Serialize>(mut self, column: &str, value: T) -> Self {
        self.filter = Some((column.to_string(), operand(value)));
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table || !self.events.contains(&event.kind) {
            return false;
        }
        match &self.filter {
            Some((column, expected)) => event
                .column(column)
                .is_some_and(|actual| values_equal(actual, expected)),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub name: String,
    pub bindings: Vec<Binding>,
}

impl ChannelSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bindings: Vec::new(),
        }
    }

    pub fn bind(mut self, binding: Binding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.bindings.iter().any(|b| b.matches(event))
    }
}

/// A live change feed for one channel.
///
/// Dropping it closes the receiving side; the forwarder behind it notices and
/// releases its upstream resources.
#[derive(Debug)]
pub struct Subscription {
    name: String,
    rx: mpsc::Receiver<ChangeEvent>,
}

impl Subscription {
    pub fn new(name: impl Into<String>, rx: mpsc::Receiver<ChangeEvent>) -> Self {
        Self { name: name.into(), rx }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}

/// Registry of open channels, keyed by channel name.
///
/// At most one listener per name is alive: opening a channel whose name is
/// already open tears the previous listener down first.
#[derive(Clone)]
pub struct Channels {
    data: Arc<dyn DataService>,
    open: Arc<DashMap<String, (u64, AbortHandle)>>,
    next_id: Arc<AtomicU64>,
}

impl Channels {
    pub fn new(data: Arc<dyn DataService>) -> Self {
        Self {
            data,
            open: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Opens `spec` and runs `handler` for each event, one at a time, in feed order.
    pub async fn listen<F, Fut>(&self, spec: ChannelSpec, mut handler: F) -> Result<ChannelHandle, DataError>
    where
        F: FnMut(ChangeEvent) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = spec.name.clone();
        self.close(&name);

        let mut subscription = self.data.subscribe(spec).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let open = self.open.clone();
        let pump_name = name.clone();
        // The pump waits for its registry entry, so a feed that ends at once still cleans up.
        let (registered_tx, registered) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            if registered.await.is_err() {
                return;
            }
            while let Some(event) = subscription.next().await {
                handler(event).await;
            }
            tracing::debug!(channel = %pump_name, "change feed ended");
            open.remove_if(&pump_name, |_, (owner, _)| *owner == id);
        });

        let abort = task.abort_handle();
        if let Some((_, (_, replaced))) = self.open.remove(&name) {
            // Another listener for the same name won the race while we subscribed.
            replaced.abort();
        }
        self.open.insert(name.clone(), (id, abort.clone()));
        let _ = registered_tx.send(());

        tracing::debug!(channel = %name, listener = id, "channel opened");

        Ok(ChannelHandle {
            name,
            id,
            abort,
            open: self.open.clone(),
        })
    }

    /// Tears down the listener currently owning `name`, if any.
    pub fn close(&self, name: &str) -> bool {
        match self.open.remove(name) {
            Some((_, (id, abort))) => {
                abort.abort();
                tracing::debug!(channel = %name, listener = id, "channel closed");
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.open.contains_key(name)
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}

/// Ownership of one open channel listener. Dropping it stops the listener.
#[derive(Debug)]
pub struct ChannelHandle {
    name: String,
    id: u64,
    abort: AbortHandle,
    open: Arc<DashMap<String, (u64, AbortHandle)>>,
}

impl ChannelHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// False once the listener was replaced, closed, or its feed ended.
    pub fn is_active(&self) -> bool {
        self.open
            .get(&self.name)
            .is_some_and(|entry| entry.value().0 == self.id)
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.abort.abort();
        let id = self.id;
        self.open.remove_if(&self.name, |_, (owner, _)| *owner == id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::data::{to_row, Query, Row};
    use crate::clients::memory::MemoryDataService;
    use serde_json::json;
    use std::time::Duration;

    fn messages_of(match_id: &str) -> ChannelSpec {
        ChannelSpec::new(format!("messages:{match_id}")).bind(
            Binding::table("messages")
                .events(&[ChangeKind::Insert])
                .filter_eq("match_id", match_id),
        )
    }

    async fn say(data: &MemoryDataService, match_id: &str, content: &str) {
        let row = to_row(&json!({ "match_id": match_id, "content": content })).unwrap();
        data.insert("messages", vec![row]).await.unwrap();
    }

    #[test]
    fn binding_filters_on_table_kind_and_column() {
        let binding = Binding::table("messages")
            .events(&[ChangeKind::Insert])
            .filter_eq("match_id", "m1");
        let row = to_row(&json!({ "match_id": "m1" })).unwrap();

        assert!(binding.matches(&ChangeEvent::insert("messages", row.clone())));
        assert!(!binding.matches(&ChangeEvent::update("messages", row.clone(), None)));
        assert!(!binding.matches(&ChangeEvent::insert("match_proposals", row)));
    }

    #[tokio::test]
    async fn reopening_a_channel_replaces_the_listener() {
        let data = Arc::new(MemoryDataService::new());
        let channels = Channels::new(data.clone());
        let (tx, mut rx) = mpsc::unbounded_channel::<(u8, String)>();

        let first_tx = tx.clone();
        let first = channels
            .listen(messages_of("m1"), move |event| {
                let tx = first_tx.clone();
                async move {
                    let content = event.column("content").and_then(|v| v.as_str()).unwrap_or_default();
                    let _ = tx.send((1, content.to_string()));
                }
            })
            .await
            .unwrap();

        let second = channels
            .listen(messages_of("m1"), move |event| {
                let tx = tx.clone();
                async move {
                    let content = event.column("content").and_then(|v| v.as_str()).unwrap_or_default();
                    let _ = tx.send((2, content.to_string()));
                }
            })
            .await
            .unwrap();

        assert!(!first.is_active());
        assert!(second.is_active());
        assert_eq!(channels.open_count(), 1);

        say(&data, "m1", "hello").await;
        let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(delivered, Some((2, "hello".to_string())));

        // Dropping the stale handle must not evict the live listener.
        drop(first);
        assert!(channels.is_open("messages:m1"));

        drop(second);
        assert!(!channels.is_open("messages:m1"));
    }

    /// A backend whose change feed closes as soon as it is opened.
    struct EndedFeed;

    #[async_trait::async_trait]
    impl DataService for EndedFeed {
        async fn select(&self, _query: &Query) -> Result<Vec<Row>, DataError> {
            Ok(Vec::new())
        }

        async fn count(&self, _query: &Query) -> Result<u64, DataError> {
            Ok(0)
        }

        async fn insert(&self, _table: &str, rows: Vec<Row>) -> Result<Vec<Row>, DataError> {
            Ok(rows)
        }

        async fn update(&self, _query: &Query, _patch: Row) -> Result<Vec<Row>, DataError> {
            Ok(Vec::new())
        }

        async fn delete(&self, _query: &Query) -> Result<Vec<Row>, DataError> {
            Ok(Vec::new())
        }

        async fn subscribe(&self, spec: ChannelSpec) -> Result<Subscription, DataError> {
            let (tx, rx) = mpsc::channel(1);
            drop(tx);
            Ok(Subscription::new(spec.name, rx))
        }
    }

    #[tokio::test]
    async fn feed_that_ends_immediately_leaves_no_entry() {
        let channels = Channels::new(Arc::new(EndedFeed));
        let handle = channels.listen(messages_of("m1"), |_| async {}).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while channels.is_open("messages:m1") {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert!(!handle.is_active());
        assert_eq!(channels.open_count(), 0);
    }

    #[tokio::test]
    async fn close_stops_delivery() {
        let data = Arc::new(MemoryDataService::new());
        let channels = Channels::new(data.clone());
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let _handle = channels
            .listen(messages_of("m1"), move |event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event.column("content").map(|v| v.to_string()).unwrap_or_default());
                }
            })
            .await
            .unwrap();

        assert!(channels.close("messages:m1"));
        say(&data, "m1", "ignored").await;

        let received = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(matches!(received, Err(_) | Ok(None)));
    }
}
