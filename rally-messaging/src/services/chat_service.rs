use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use rally_shared::clients::data::{DataService, DataServiceExt, Filter, Query};
use rally_shared::errors::{AppError, AppResult, ErrorCode, LogErr};
use rally_shared::schema;

use crate::models::{Message, NewMessage};

pub const MAX_MESSAGE_LEN: usize = 2000;

#[derive(Deserialize)]
struct MatchId {
    id: Uuid,
}

fn read_patch() -> Map<String, Value> {
    let mut patch = Map::new();
    patch.insert("read".into(), Value::Bool(true));
    patch
}

#[derive(Clone)]
pub struct ChatService {
    data: Arc<dyn DataService>,
}

impl ChatService {
    pub fn new(data: Arc<dyn DataService>) -> Self {
        Self { data }
    }

    /// Full history of a match, oldest first.
    pub async fn get_messages(&self, match_id: Uuid) -> AppResult<Vec<Message>> {
        self.data
            .select_as(
                &Query::table(schema::MESSAGES)
                    .eq("match_id", match_id)
                    .order_asc("created_at"),
            )
            .await
            .log_err("chat.history")
    }

    /// Stores a message and returns it as stored. Nothing is stored on `Err`.
    pub async fn send_message(&self, match_id: Uuid, sender_id: Uuid, content: &str) -> AppResult<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(AppError::new(ErrorCode::EmptyMessage, "message cannot be empty"));
        }
        if content.chars().count() > MAX_MESSAGE_LEN {
            return Err(AppError::with_details(
                ErrorCode::MessageTooLong,
                format!("message must be at most {MAX_MESSAGE_LEN} characters"),
                serde_json::json!({ "max": MAX_MESSAGE_LEN }),
            ));
        }

        let message: Message = self
            .data
            .insert_one(
                schema::MESSAGES,
                &NewMessage {
                    match_id,
                    sender_id,
                    content: content.to_string(),
                },
            )
            .await
            .log_err("chat.send")?;

        metrics::counter!("rally_messages_sent_total").increment(1);
        tracing::debug!(message_id = %message.id, match_id = %match_id, sender_id = %sender_id, "message sent");

        Ok(message)
    }

    /// Marks what the other player sent in this match as read. Returns how many
    /// messages flipped; zero on repeat calls.
    pub async fn mark_match_messages_as_read(&self, match_id: Uuid, user_id: Uuid) -> AppResult<usize> {
        let updated = self
            .data
            .update(
                &Query::table(schema::MESSAGES)
                    .eq("match_id", match_id)
                    .neq("sender_id", user_id)
                    .eq("read", false),
                read_patch(),
            )
            .await
            .log_err("chat.mark_read")?;

        if !updated.is_empty() {
            tracing::debug!(match_id = %match_id, user_id = %user_id, count = updated.len(), "messages marked read");
        }
        Ok(updated.len())
    }

    pub async fn mark_message_read(&self, message_id: Uuid) -> AppResult<Message> {
        let updated: Vec<Message> = self
            .data
            .update_as(&Query::table(schema::MESSAGES).eq("id", message_id), read_patch())
            .await
            .log_err("chat.mark_message_read")?;

        updated
            .into_iter()
            .next()
            .ok_or_else(|| AppError::new(ErrorCode::MessageNotFound, "message not found"))
    }

    /// Unread messages addressed to `user_id` across all their matches.
    pub async fn unread_count(&self, user_id: Uuid) -> AppResult<u64> {
        let matches: Vec<MatchId> = self
            .data
            .select_as(
                &Query::table(schema::MATCHES)
                    .columns(&["id"])
                    .or(vec![Filter::eq("user1_id", user_id), Filter::eq("user2_id", user_id)]),
            )
            .await
            .log_err("chat.unread_matches")?;

        if matches.is_empty() {
            return Ok(0);
        }

        self.data
            .count(
                &Query::table(schema::MESSAGES)
                    .in_list("match_id", matches.iter().map(|m| m.id))
                    .eq("read", false)
                    .neq("sender_id", user_id),
            )
            .await
            .log_err("chat.unread_count")
    }
}
