use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clients::data::Row;

/// Broker envelope wrapping every change published on the feed.
///
/// Routing key format: `rally.db.{table}.{insert|update|delete}`
/// Example: `rally.db.messages.insert`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T> {
    pub id: Uuid,
    pub source: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub data: T,
}

impl<T> Event<T> {
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, data: T) -> Self {
        Self {
            id: Uuid::now_v7(),
            source: source.into(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            data,
        }
    }
}

pub mod routing_keys {
    use super::ChangeKind;

    pub const CHANGES_EXCHANGE: &str = "rally.changes";

    /// Routing key for one kind of change on one table.
    pub fn change(table: &str, kind: ChangeKind) -> String {
        format!("rally.db.{table}.{}", kind.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 3] = [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

/// One row change on a table, as delivered by the change feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    #[serde(default)]
    pub new: Option<Row>,
    #[serde(default)]
    pub old: Option<Row>,
    pub commit_timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn insert(table: impl Into<String>, row: Row) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Insert,
            new: Some(row),
            old: None,
            commit_timestamp: Utc::now(),
        }
    }

    pub fn update(table: impl Into<String>, new: Row, old: Option<Row>) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Update,
            new: Some(new),
            old,
            commit_timestamp: Utc::now(),
        }
    }

    pub fn delete(table: impl Into<String>, old: Row) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Delete,
            new: None,
            old: Some(old),
            commit_timestamp: Utc::now(),
        }
    }

    /// The row the event is about: the new image, or the old one for deletes.
    pub fn record(&self) -> Option<&Row> {
        self.new.as_ref().or(self.old.as_ref())
    }

    pub fn column(&self, name: &str) -> Option<&serde_json::Value> {
        self.record().and_then(|row| row.get(name))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.record()
            .map(|row| serde_json::from_value(serde_json::Value::Object(row.clone())))
            .transpose()
    }
}
