use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use super::data::{DataError, DataService, Direction, Filter, Query, Row, FOREIGN_KEY_VIOLATION, UNIQUE_VIOLATION};
use super::realtime::{ChannelSpec, Subscription};

/// Row access over the hosted REST dialect (`/rest/v1/{table}`).
#[derive(Clone)]
pub struct PostgrestClient {
    http: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct PostgrestError {
    code: Option<String>,
    message: Option<String>,
    details: Option<String>,
    hint: Option<String>,
}

impl From<reqwest::Error> for DataError {
    fn from(e: reqwest::Error) -> Self {
        DataError::Transport(e.to_string())
    }
}

impl PostgrestClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn request(&self, method: Method, query: &Query) -> RequestBuilder {
        self.http
            .request(method, format!("{}/rest/v1/{}", self.base_url, query.table))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .query(&query_params(query))
    }

    /// Cheap reachability probe used by health checks.
    pub async fn ping(&self) -> Result<(), DataError> {
        let response = self
            .http
            .get(format!("{}/rest/v1/", self.base_url))
            .header("apikey", &self.api_key)
            .send()
            .await?;
        if response.status().is_server_error() {
            return Err(DataError::Remote {
                status: response.status().as_u16(),
                code: None,
                message: "data service unhealthy".into(),
            });
        }
        Ok(())
    }
}

async fn rows_or_error(table: &str, response: Response) -> Result<Vec<Row>, DataError> {
    let status = response.status();
    if status == StatusCode::NO_CONTENT {
        return Ok(Vec::new());
    }
    if !status.is_success() {
        return Err(remote_error(table, response).await);
    }
    Ok(response.json::<Vec<Row>>().await?)
}

async fn remote_error(table: &str, response: Response) -> DataError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    classify_error(table, status, body)
}

fn classify_error(table: &str, status: u16, body: String) -> DataError {
    let parsed: Option<PostgrestError> = serde_json::from_str(&body).ok();

    match parsed {
        Some(err) if err.code.as_deref() == Some(UNIQUE_VIOLATION) => DataError::UniqueViolation {
            table: table.to_string(),
            message: err.message.unwrap_or_default(),
        },
        Some(err) if err.code.as_deref() == Some(FOREIGN_KEY_VIOLATION) => DataError::ForeignKeyViolation {
            table: table.to_string(),
            message: err.message.unwrap_or_default(),
        },
        Some(err) => {
            tracing::debug!(
                table = %table,
                status,
                details = ?err.details,
                hint = ?err.hint,
                "data service rejected request"
            );
            DataError::Remote {
                status,
                code: err.code,
                message: err.message.unwrap_or(body),
            }
        }
        None => DataError::Remote {
            status,
            code: None,
            message: body,
        },
    }
}

/// Renders a literal the way the REST dialect expects it in a filter.
fn literal(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Literal inside a list or `or=(...)` group; reserved characters force quoting.
fn list_literal(value: &Value) -> String {
    let raw = literal(value);
    if raw.chars().any(|c| matches!(c, ',' | '.' | ':' | '(' | ')' | '"' | ' ')) {
        format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        raw
    }
}

fn list(values: &[Value]) -> String {
    let items: Vec<String> = values.iter().map(list_literal).collect();
    format!("({})", items.join(","))
}

/// `(column, "op.value")` for a top-level filter.
fn filter_param(filter: &Filter) -> (String, String) {
    match filter {
        Filter::Eq(c, v) => (c.clone(), format!("eq.{}", literal(v))),
        Filter::Neq(c, v) => (c.clone(), format!("neq.{}", literal(v))),
        Filter::Gt(c, v) => (c.clone(), format!("gt.{}", literal(v))),
        Filter::Gte(c, v) => (c.clone(), format!("gte.{}", literal(v))),
        Filter::Lt(c, v) => (c.clone(), format!("lt.{}", literal(v))),
        Filter::Lte(c, v) => (c.clone(), format!("lte.{}", literal(v))),
        Filter::In(c, vs) => (c.clone(), format!("in.{}", list(vs))),
        Filter::NotIn(c, vs) => (c.clone(), format!("not.in.{}", list(vs))),
        Filter::IsNull(c) => (c.clone(), "is.null".to_string()),
        Filter::Or(fs) => ("or".to_string(), or_group(fs)),
    }
}

/// Member of an `or=(...)` group: `column.op.value`, with nested groups as `or(...)`.
fn group_member(filter: &Filter) -> String {
    match filter {
        Filter::Or(fs) => format!("or{}", or_group(fs)),
        Filter::Eq(c, v) => format!("{c}.eq.{}", list_literal(v)),
        Filter::Neq(c, v) => format!("{c}.neq.{}", list_literal(v)),
        Filter::Gt(c, v) => format!("{c}.gt.{}", list_literal(v)),
        Filter::Gte(c, v) => format!("{c}.gte.{}", list_literal(v)),
        Filter::Lt(c, v) => format!("{c}.lt.{}", list_literal(v)),
        Filter::Lte(c, v) => format!("{c}.lte.{}", list_literal(v)),
        other => {
            let (column, op) = filter_param(other);
            format!("{column}.{op}")
        }
    }
}

fn or_group(filters: &[Filter]) -> String {
    let members: Vec<String> = filters.iter().map(group_member).collect();
    format!("({})", members.join(","))
}

pub(crate) fn query_params(query: &Query) -> Vec<(String, String)> {
    let mut params = vec![(
        "select".to_string(),
        query
            .columns
            .as_ref()
            .map(|c| c.join(","))
            .unwrap_or_else(|| "*".to_string()),
    )];

    params.extend(query.filters.iter().map(filter_param));

    if !query.order.is_empty() {
        let order: Vec<String> = query
            .order
            .iter()
            .map(|o| match o.direction {
                Direction::Asc => format!("{}.asc", o.column),
                Direction::Desc => format!("{}.desc", o.column),
            })
            .collect();
        params.push(("order".to_string(), order.join(",")));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    if let Some(offset) = query.offset {
        params.push(("offset".to_string(), offset.to_string()));
    }
    params
}

/// Total from a `Content-Range` header such as `0-24/3573` or `*/0`.
pub(crate) fn parse_content_range(header: &str) -> Option<u64> {
    header.rsplit_once('/').and_then(|(_, total)| total.trim().parse().ok())
}

#[async_trait]
impl DataService for PostgrestClient {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, DataError> {
        let response = self.request(Method::GET, query).send().await?;
        rows_or_error(&query.table, response).await
    }

    async fn count(&self, query: &Query) -> Result<u64, DataError> {
        let query = Query {
            columns: Some(vec!["id".to_string()]),
            order: Vec::new(),
            limit: None,
            offset: None,
            ..query.clone()
        };
        let response = self
            .request(Method::HEAD, &query)
            .header("Prefer", "count=exact")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(remote_error(&query.table, response).await);
        }

        response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range)
            .ok_or_else(|| DataError::Remote {
                status: response.status().as_u16(),
                code: None,
                message: "missing or malformed content-range".into(),
            })
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, DataError> {
        let response = self
            .http
            .post(format!("{}/rest/v1/{}", self.base_url, table))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Prefer", "return=representation")
            .json(&rows)
            .send()
            .await?;
        rows_or_error(table, response).await
    }

    async fn update(&self, query: &Query, patch: Row) -> Result<Vec<Row>, DataError> {
        let query = Query {
            order: Vec::new(),
            limit: None,
            offset: None,
            ..query.clone()
        };
        let response = self
            .request(Method::PATCH, &query)
            .header("Prefer", "return=representation")
            .json(&patch)
            .send()
            .await?;
        rows_or_error(&query.table, response).await
    }

    async fn delete(&self, query: &Query) -> Result<Vec<Row>, DataError> {
        let query = Query {
            order: Vec::new(),
            limit: None,
            offset: None,
            ..query.clone()
        };
        let response = self
            .request(Method::DELETE, &query)
            .header("Prefer", "return=representation")
            .send()
            .await?;
        rows_or_error(&query.table, response).await
    }

    async fn subscribe(&self, spec: ChannelSpec) -> Result<Subscription, DataError> {
        Err(DataError::Feed(format!(
            "channel {} needs a change feed; the REST client serves rows only",
            spec.name
        )))
    }
}
