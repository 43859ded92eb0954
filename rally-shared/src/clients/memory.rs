use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex};
use uuid::Uuid;

use super::data::{compare_values, values_equal, DataError, DataService, Direction, Query, Row};
use super::realtime::{ChannelSpec, Subscription, SUBSCRIPTION_BUFFER};
use crate::schema;
use crate::types::event::ChangeEvent;

const FEED_CAPACITY: usize = 1024;

struct UniqueKey {
    name: &'static str,
    columns: &'static [&'static str],
}

/// In-process data service with the same filter semantics as the hosted one.
///
/// Ids and `created_at` are assigned on insert when absent; timestamps are
/// strictly increasing so `created_at` ordering is total.
pub struct MemoryDataService {
    state: Mutex<State>,
    feed: broadcast::Sender<ChangeEvent>,
}

struct State {
    tables: HashMap<String, Vec<Row>>,
    last_timestamp: DateTime<Utc>,
    failing: HashSet<String>,
}

impl Default for MemoryDataService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDataService {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            state: Mutex::new(State {
                tables: HashMap::new(),
                last_timestamp: DateTime::<Utc>::MIN_UTC,
                failing: HashSet::new(),
            }),
            feed,
        }
    }

    /// Makes every call touching `table` fail with a transport error.
    pub async fn fail_table(&self, table: &str) {
        self.state.lock().await.failing.insert(table.to_string());
    }

    pub async fn heal_table(&self, table: &str) {
        self.state.lock().await.failing.remove(table);
    }

    /// Current contents of `table`, in insertion order.
    pub async fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .await
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    fn publish(&self, event: ChangeEvent) {
        // No receivers is not an error: nobody is listening yet.
        let _ = self.feed.send(event);
    }
}

fn unique_keys(table: &str) -> &'static [UniqueKey] {
    const SWIPES: &[UniqueKey] = &[UniqueKey {
        name: "swipes_user_id_target_user_id_key",
        columns: &["user_id", "target_user_id"],
    }];
    const MATCHES: &[UniqueKey] = &[UniqueKey {
        name: "matches_user1_id_user2_id_key",
        columns: &["user1_id", "user2_id"],
    }];
    match table {
        schema::SWIPES => SWIPES,
        schema::MATCHES => MATCHES,
        _ => &[],
    }
}

fn unread() -> Value {
    Value::Bool(false)
}

fn pending() -> Value {
    Value::String("pending".into())
}

/// Server-side column defaults of the hosted schema.
fn column_defaults(table: &str) -> &'static [(&'static str, fn() -> Value)] {
    const READ: &[(&str, fn() -> Value)] = &[("read", unread)];
    const STATUS: &[(&str, fn() -> Value)] = &[("status", pending)];
    match table {
        schema::MESSAGES | schema::NOTIFICATIONS => READ,
        schema::MATCH_PROPOSALS => STATUS,
        _ => &[],
    }
}

fn same_key(a: &Row, b: &Row, columns: &[&str]) -> bool {
    columns.iter().all(|c| match (a.get(*c), b.get(*c)) {
        (Some(x), Some(y)) if !x.is_null() && !y.is_null() => values_equal(x, y),
        _ => false,
    })
}

fn sort_rows(rows: &mut [Row], query: &Query) {
    if query.order.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        for order in &query.order {
            let x = a.get(&order.column).filter(|v| !v.is_null());
            let y = b.get(&order.column).filter(|v| !v.is_null());
            // Postgres defaults: NULLS LAST ascending, NULLS FIRST descending.
            let ordering = match (x, y) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
            };
            let ordering = match order.direction {
                Direction::Asc => ordering,
                Direction::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn project(row: Row, columns: &Option<Vec<String>>) -> Row {
    match columns {
        Some(columns) => row
            .into_iter()
            .filter(|(k, _)| columns.iter().any(|c| c == k))
            .collect(),
        None => row,
    }
}

impl State {
    fn check_available(&self, table: &str) -> Result<(), DataError> {
        if self.failing.contains(table) {
            return Err(DataError::Transport(format!("{table} is unreachable")));
        }
        Ok(())
    }

    fn next_timestamp(&mut self) -> String {
        let mut now = Utc::now();
        if now <= self.last_timestamp {
            now = self.last_timestamp + Duration::microseconds(1);
        }
        self.last_timestamp = now;
        now.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn matching<'a>(&'a self, query: &'a Query) -> impl Iterator<Item = &'a Row> + 'a {
        self.tables
            .get(&query.table)
            .into_iter()
            .flatten()
            .filter(move |row| query.matches(row))
    }
}

#[async_trait]
impl DataService for MemoryDataService {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, DataError> {
        let state = self.state.lock().await;
        state.check_available(&query.table)?;

        let mut rows: Vec<Row> = state.matching(query).cloned().collect();
        sort_rows(&mut rows, query);

        let offset = query.offset.unwrap_or(0) as usize;
        let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|row| project(row, &query.columns))
            .collect())
    }

    async fn count(&self, query: &Query) -> Result<u64, DataError> {
        let state = self.state.lock().await;
        state.check_available(&query.table)?;
        Ok(state.matching(query).count() as u64)
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, DataError> {
        let mut state = self.state.lock().await;
        state.check_available(table)?;

        let mut prepared = Vec::with_capacity(rows.len());
        for mut row in rows {
            if row.get("id").map_or(true, Value::is_null) {
                row.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
            }
            if row.get("created_at").map_or(true, Value::is_null) {
                let ts = state.next_timestamp();
                row.insert("created_at".into(), Value::String(ts));
            }
            for (column, default) in column_defaults(table) {
                row.entry(column.to_string()).or_insert_with(*default);
            }
            prepared.push(row);
        }

        // Whole batch is rejected if any row collides, like a single statement.
        let existing = state.tables.get(table).map(Vec::as_slice).unwrap_or_default();
        for (i, row) in prepared.iter().enumerate() {
            let earlier = &prepared[..i];
            let id_taken = existing
                .iter()
                .chain(earlier)
                .any(|other| same_key(row, other, &["id"]));
            if id_taken {
                return Err(DataError::UniqueViolation {
                    table: table.to_string(),
                    message: format!("duplicate key value violates unique constraint \"{table}_pkey\""),
                });
            }
            for key in unique_keys(table) {
                if existing.iter().chain(earlier).any(|other| same_key(row, other, key.columns)) {
                    return Err(DataError::UniqueViolation {
                        table: table.to_string(),
                        message: format!("duplicate key value violates unique constraint \"{}\"", key.name),
                    });
                }
            }
        }

        state
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(prepared.iter().cloned());

        for row in &prepared {
            self.publish(ChangeEvent::insert(table, row.clone()));
        }

        tracing::trace!(table = %table, rows = prepared.len(), "memory insert");
        Ok(prepared)
    }

    async fn update(&self, query: &Query, patch: Row) -> Result<Vec<Row>, DataError> {
        let mut state = self.state.lock().await;
        state.check_available(&query.table)?;

        let mut updated = Vec::new();
        if let Some(rows) = state.tables.get_mut(&query.table) {
            for row in rows.iter_mut().filter(|row| query.matches(row)) {
                let old = row.clone();
                for (column, value) in &patch {
                    row.insert(column.clone(), value.clone());
                }
                updated.push((old, row.clone()));
            }
        }

        for (old, new) in &updated {
            self.publish(ChangeEvent::update(&query.table, new.clone(), Some(old.clone())));
        }

        Ok(updated.into_iter().map(|(_, new)| new).collect())
    }

    async fn delete(&self, query: &Query) -> Result<Vec<Row>, DataError> {
        let mut state = self.state.lock().await;
        state.check_available(&query.table)?;

        let mut removed = Vec::new();
        if let Some(rows) = state.tables.get_mut(&query.table) {
            rows.retain(|row| {
                if query.matches(row) {
                    removed.push(row.clone());
                    false
                } else {
                    true
                }
            });
        }

        for row in &removed {
            self.publish(ChangeEvent::delete(&query.table, row.clone()));
        }

        Ok(removed)
    }

    async fn subscribe(&self, spec: ChannelSpec) -> Result<Subscription, DataError> {
        {
            let state = self.state.lock().await;
            for binding in &spec.bindings {
                state.check_available(&binding.table)?;
            }
        }

        let mut feed = self.feed.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let name = spec.name.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    received = feed.recv() => match received {
                        Ok(event) => {
                            if spec.matches(&event) && tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(channel = %spec.name, skipped, "change feed lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(Subscription::new(name, rx))
    }
}
