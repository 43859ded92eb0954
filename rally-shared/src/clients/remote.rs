use async_trait::async_trait;

use super::data::{DataError, DataService, Query, Row};
use super::postgrest::PostgrestClient;
use super::rabbitmq::RabbitMQClient;
use super::realtime::{ChannelSpec, Subscription};
use crate::types::event::{ChangeEvent, ChangeKind, Event};

/// The hosted service as a whole: rows over REST, changes over the broker.
#[derive(Clone)]
pub struct RemoteDataService {
    rest: PostgrestClient,
    feed: RabbitMQClient,
    echo_writes: bool,
}

impl RemoteDataService {
    pub fn new(rest: PostgrestClient, feed: RabbitMQClient) -> Self {
        Self {
            rest,
            feed,
            echo_writes: false,
        }
    }

    /// Publish our own writes on the change feed. Only for deployments where
    /// nothing on the database side does it already, or every change arrives twice.
    pub fn with_echo_writes(mut self, echo_writes: bool) -> Self {
        self.echo_writes = echo_writes;
        self
    }

    async fn echo(&self, changes: Vec<ChangeEvent>) {
        if !self.echo_writes {
            return;
        }
        for change in changes {
            let event = Event::new("rally-api", "row_changed", change);
            // The write stands; listeners catch up on their next resync.
            if let Err(e) = self.feed.publish(&event).await {
                tracing::warn!(table = %event.data.table, error = %e, "failed to echo write to change feed");
            }
        }
    }

    pub fn rest(&self) -> &PostgrestClient {
        &self.rest
    }

    pub fn feed(&self) -> &RabbitMQClient {
        &self.feed
    }
}

/// Feed events for rows returned by a write.
fn changes_for(table: &str, kind: ChangeKind, rows: &[Row]) -> Vec<ChangeEvent> {
    rows.iter()
        .map(|row| match kind {
            ChangeKind::Insert => ChangeEvent::insert(table, row.clone()),
            ChangeKind::Update => ChangeEvent::update(table, row.clone(), None),
            ChangeKind::Delete => ChangeEvent::delete(table, row.clone()),
        })
        .collect()
}

#[async_trait]
impl DataService for RemoteDataService {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, DataError> {
        self.rest.select(query).await
    }

    async fn count(&self, query: &Query) -> Result<u64, DataError> {
        self.rest.count(query).await
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, DataError> {
        let stored = self.rest.insert(table, rows).await?;
        self.echo(changes_for(table, ChangeKind::Insert, &stored)).await;
        Ok(stored)
    }

    async fn update(&self, query: &Query, patch: Row) -> Result<Vec<Row>, DataError> {
        let updated = self.rest.update(query, patch).await?;
        self.echo(changes_for(&query.table, ChangeKind::Update, &updated)).await;
        Ok(updated)
    }

    async fn delete(&self, query: &Query) -> Result<Vec<Row>, DataError> {
        let deleted = self.rest.delete(query).await?;
        self.echo(changes_for(&query.table, ChangeKind::Delete, &deleted)).await;
        Ok(deleted)
    }

    async fn subscribe(&self, spec: ChannelSpec) -> Result<Subscription, DataError> {
        self.feed.subscribe(spec).await
    }
}
