use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::realtime::{ChannelSpec, Subscription};

/// A row as it travels over the wire: one JSON object per record.
pub type Row = Map<String, Value>;

/// PostgreSQL `unique_violation`.
pub const UNIQUE_VIOLATION: &str = "23505";
/// PostgreSQL `foreign_key_violation`.
pub const FOREIGN_KEY_VIOLATION: &str = "23503";

#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("unique constraint violated on {table}: {message}")]
    UniqueViolation { table: String, message: String },

    #[error("foreign key violated on {table}: {message}")]
    ForeignKeyViolation { table: String, message: String },

    #[error("data service rejected request ({status}): {message}")]
    Remote {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed row: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("change feed error: {0}")]
    Feed(String),
}

impl DataError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, DataError::UniqueViolation { .. })
    }

    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(self, DataError::ForeignKeyViolation { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Neq(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    In(String, Vec<Value>),
    NotIn(String, Vec<Value>),
    IsNull(String),
    Or(Vec<Filter>),
}

/// Converts anything serializable into a filter operand.
///
/// Ids, strings, numbers and booleans never fail to serialize; anything that
/// does becomes `null`, which matches no row.
pub fn operand<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

impl Filter {
    pub fn eq<T: Serialize>(column: &str, value: T) -> Self {
        Filter::Eq(column.to_string(), operand(value))
    }

    pub fn neq<T: Serialize>(column: &str, value: T) -> Self {
        Filter::Neq(column.to_string(), operand(value))
    }

    /// SQL semantics: a comparison against a missing or null column is never
    /// true, except for `IsNull`.
    pub fn matches(&self, row: &Row) -> bool {
        let present = |column: &str| row.get(column).filter(|v| !v.is_null());
        match self {
            Filter::Eq(c, v) => present(c).is_some_and(|x| values_equal(x, v)),
            Filter::Neq(c, v) => present(c).is_some_and(|x| !values_equal(x, v)),
            Filter::Gt(c, v) => present(c).is_some_and(|x| compare_values(x, v) == Some(Ordering::Greater)),
            Filter::Gte(c, v) => present(c)
                .is_some_and(|x| matches!(compare_values(x, v), Some(Ordering::Greater | Ordering::Equal))),
            Filter::Lt(c, v) => present(c).is_some_and(|x| compare_values(x, v) == Some(Ordering::Less)),
            Filter::Lte(c, v) => present(c)
                .is_some_and(|x| matches!(compare_values(x, v), Some(Ordering::Less | Ordering::Equal))),
            Filter::In(c, vs) => present(c).is_some_and(|x| vs.iter().any(|v| values_equal(x, v))),
            Filter::NotIn(c, vs) => present(c).is_some_and(|x| !vs.iter().any(|v| values_equal(x, v))),
            Filter::IsNull(c) => present(c).is_none(),
            Filter::Or(fs) => fs.iter().any(|f| f.matches(row)),
        }
    }
}

fn as_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Equality the way the data service compares a column with a literal.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::String(x), Value::String(y)) => {
            x == y
                || matches!((Uuid::parse_str(x), Uuid::parse_str(y)), (Ok(p), Ok(q)) if p == q)
                || matches!((as_timestamp(a), as_timestamp(b)), (Some(p), Some(q)) if p == q)
        }
        (Value::String(s), other) | (other, Value::String(s)) if !other.is_null() => {
            other.to_string() == *s
        }
        _ => a == b,
    }
}

/// Ordering between two non-null values; `None` when they are not comparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => match (as_timestamp(a), as_timestamp(b)) {
            (Some(p), Some(q)) => Some(p.cmp(&q)),
            _ => Some(x.cmp(y)),
        },
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// A read (or the filter part of a write) against one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    pub columns: Option<Vec<String>>,
    pub filters: Vec<Filter>,
    pub order: Vec<Order>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl Query {
    pub fn table(name: &str) -> Self {
        Self {
            table: name.to_string(),
            columns: None,
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn eq<T: Serialize>(self, column: &str, value: T) -> Self {
        self.filter(Filter::eq(column, value))
    }

    pub fn neq<T: Serialize>(self, column: &str, value: T) -> Self {
        self.filter(Filter::neq(column, value))
    }

    pub fn gt<T: Serialize>(self, column: &str, value: T) -> Self {
        self.filter(Filter::Gt(column.to_string(), operand(value)))
    }

    pub fn gte<T: Serialize>(self, column: &str, value: T) -> Self {
        self.filter(Filter::Gte(column.to_string(), operand(value)))
    }

    pub fn lt<T: Serialize>(self, column: &str, value: T) -> Self {
        self.filter(Filter::Lt(column.to_string(), operand(value)))
    }

    pub fn lte<T: Serialize>(self, column: &str, value: T) -> Self {
        self.filter(Filter::Lte(column.to_string(), operand(value)))
    }

    pub fn in_list<T: Serialize>(self, column: &str, values: impl IntoIterator<Item = T>) -> Self {
        let values = values.into_iter().map(operand).collect();
        self.filter(Filter::In(column.to_string(), values))
    }

    /// Skipped entirely when `values` is empty, since `not in ()` excludes nothing.
    pub fn not_in<T: Serialize>(self, column: &str, values: impl IntoIterator<Item = T>) -> Self {
        let values: Vec<Value> = values.into_iter().map(operand).collect();
        if values.is_empty() {
            return self;
        }
        self.filter(Filter::NotIn(column.to_string(), values))
    }

    pub fn is_null(self, column: &str) -> Self {
        self.filter(Filter::IsNull(column.to_string()))
    }

    pub fn or(self, filters: Vec<Filter>) -> Self {
        self.filter(Filter::Or(filters))
    }

    pub fn order(mut self, column: &str, direction: Direction) -> Self {
        self.order.push(Order {
            column: column.to_string(),
            direction,
        });
        self
    }

    pub fn order_asc(self, column: &str) -> Self {
        self.order(column, Direction::Asc)
    }

    pub fn order_desc(self, column: &str) -> Self {
        self.order(column, Direction::Desc)
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }
}

/// The hosted relational-data-and-realtime service, as the core consumes it.
#[async_trait]
pub trait DataService: Send + Sync {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, DataError>;

    /// Exact number of rows matching the query's filters.
    async fn count(&self, query: &Query) -> Result<u64, DataError>;

    /// Appends rows and returns them as stored (server-assigned ids and timestamps included).
    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, DataError>;

    /// Patches every row matching the query's filters and returns the updated rows.
    async fn update(&self, query: &Query, patch: Row) -> Result<Vec<Row>, DataError>;

    async fn delete(&self, query: &Query) -> Result<Vec<Row>, DataError>;

    /// Opens a change feed for the channel; events flow until the subscription is dropped.
    async fn subscribe(&self, spec: ChannelSpec) -> Result<Subscription, DataError>;
}

pub fn to_row<T: Serialize>(value: &T) -> Result<Row, DataError> {
    match serde_json::to_value(value)? {
        Value::Object(row) => Ok(row),
        _ => Err(DataError::Decode(<serde_json::Error as serde::ser::Error>::custom(
            "row must serialize to a JSON object",
        ))),
    }
}

pub fn from_row<T: DeserializeOwned>(row: Row) -> Result<T, DataError> {
    Ok(serde_json::from_value(Value::Object(row))?)
}

pub fn decode_rows<T: DeserializeOwned>(rows: Vec<Row>) -> Result<Vec<T>, DataError> {
    rows.into_iter().map(from_row).collect()
}

/// Typed helpers over any [`DataService`].
#[async_trait]
pub trait DataServiceExt: DataService {
    async fn select_as<T: DeserializeOwned + Send>(&self, query: &Query) -> Result<Vec<T>, DataError> {
        let rows = self.select(query).await?;
        decode_rows(rows)
    }

    async fn select_one_as<T: DeserializeOwned + Send>(&self, query: &Query) -> Result<Option<T>, DataError> {
        let query = query.clone().limit(1);
        let rows = self.select(&query).await?;
        rows.into_iter().next().map(from_row).transpose()
    }

    async fn insert_one<I, T>(&self, table: &str, row: &I) -> Result<T, DataError>
    where
        I: Serialize + Sync,
        T: DeserializeOwned + Send,
    {
        let row = to_row(row)?;
        let stored = self.insert(table, vec![row]).await?;
        match stored.into_iter().next() {
            Some(row) => from_row(row),
            None => Err(DataError::Remote {
                status: 200,
                code: None,
                message: format!("insert into {table} returned no row"),
            }),
        }
    }

    async fn update_as<T: DeserializeOwned + Send>(&self, query: &Query, patch: Row) -> Result<Vec<T>, DataError> {
        let rows = self.update(query, patch).await?;
        decode_rows(rows)
    }
}

impl<S: DataService + ?Sized> DataServiceExt for S {}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap_or_default()
    }

    #[rstest]
    #[case(Filter::eq("status", "pending"), true)]
    #[case(Filter::neq("status", "pending"), false)]
    #[case(Filter::eq("read", false), true)]
    #[case(Filter::In("status".into(), vec![json!("accepted"), json!("pending")]), true)]
    #[case(Filter::NotIn("status".into(), vec![json!("pending")]), false)]
    #[case(Filter::IsNull("court_name".into()), true)]
    #[case(Filter::neq("court_name", "Centre Court"), false)]
    #[case(Filter::Or(vec![Filter::eq("status", "declined"), Filter::eq("read", false)]), true)]
    fn filter_semantics(#[case] filter: Filter, #[case] expected: bool) {
        let row = row(json!({ "status": "pending", "read": false, "court_name": null }));
        assert_eq!(filter.matches(&row), expected);
    }

    #[test]
    fn timestamps_compare_chronologically() {
        let earlier = json!("2026-03-01T09:00:00Z");
        let later = json!("2026-03-01T10:00:00.000001+00:00");
        assert_eq!(compare_values(&earlier, &later), Some(Ordering::Less));
        assert!(values_equal(&json!("2026-03-01T09:00:00Z"), &json!("2026-03-01T09:00:00.000000+00:00")));
    }

    #[test]
    fn ids_compare_case_insensitively() {
        let upper = json!("6F1C6D1E-8A2B-4C5D-9E0F-112233445566");
        let lower = json!("6f1c6d1e-8a2b-4c5d-9e0f-112233445566");
        assert!(values_equal(&upper, &lower));
    }

    #[test]
    fn empty_not_in_adds_no_filter() {
        let query = Query::table("profiles").not_in("id", Vec::<String>::new());
        assert!(query.filters.is_empty());
    }

    #[test]
    fn to_row_rejects_scalars() {
        assert!(to_row(&42).is_err());
        assert!(to_row(&json!({ "id": 1 })).is_ok());
    }
}
