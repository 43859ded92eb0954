use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use rally_matching::services::MatchService;
use rally_shared::clients::data::{DataService, DataServiceExt, Query};
use rally_shared::errors::{AppError, AppResult, ErrorCode, LogErr};
use rally_shared::schema;
use rally_shared::types::pagination::{Paginated, PaginationParams};

use crate::models::{Notification, UnreadCounts};

#[derive(Deserialize)]
struct UnreadMessageRow {
    id: Uuid,
    match_id: Uuid,
}

#[derive(Deserialize)]
struct PendingProposalRow {
    match_id: Uuid,
}

#[derive(Deserialize)]
struct NotificationId {
    id: Uuid,
}

fn read_patch() -> Map<String, Value> {
    let mut patch = Map::new();
    patch.insert("read".into(), Value::Bool(true));
    patch
}

#[derive(Clone)]
pub struct NotificationService {
    data: Arc<dyn DataService>,
    matches: MatchService,
}

impl NotificationService {
    pub fn new(data: Arc<dyn DataService>) -> Self {
        Self {
            matches: MatchService::new(data.clone()),
            data,
        }
    }

    pub fn matches(&self) -> &MatchService {
        &self.matches
    }

    /// Recomputes every unread counter of `user_id` from the remote store.
    ///
    /// Each of the user's matches appears in both maps, at zero when nothing is
    /// pending there. Fails as a whole: no partial recount is ever returned.
    pub async fn fetch_unread_counts(&self, user_id: Uuid) -> AppResult<UnreadCounts> {
        let match_ids: Vec<Uuid> = self
            .matches
            .list_matches(user_id)
            .await?
            .into_iter()
            .map(|m| m.id)
            .collect();

        let (messages, proposals, social) = tokio::try_join!(
            self.unread_messages(user_id, &match_ids),
            self.pending_proposals(user_id, &match_ids),
            self.unread_notifications(user_id),
        )?;

        let mut counts = UnreadCounts {
            messages: match_ids.iter().map(|id| (*id, 0)).collect(),
            proposals: match_ids.iter().map(|id| (*id, 0)).collect(),
            social: social.len() as u32,
            seen: social.into_iter().map(|n| n.id).collect(),
        };
        for message in messages {
            *counts.messages.entry(message.match_id).or_default() += 1;
            counts.seen.insert(message.id);
        }
        for proposal in proposals {
            *counts.proposals.entry(proposal.match_id).or_default() += 1;
        }

        tracing::debug!(
            user_id = %user_id,
            matches = match_ids.len(),
            messages = counts.messages.values().sum::<u32>(),
            proposals = counts.proposals.values().sum::<u32>(),
            social = counts.social,
            "unread counts fetched"
        );
        Ok(counts)
    }

    async fn unread_messages(&self, user_id: Uuid, match_ids: &[Uuid]) -> AppResult<Vec<UnreadMessageRow>> {
        if match_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.data
            .select_as(
                &Query::table(schema::MESSAGES)
                    .columns(&["id", "match_id"])
                    .in_list("match_id", match_ids.iter().copied())
                    .eq("read", false)
                    .neq("sender_id", user_id),
            )
            .await
            .log_err("unread.messages")
    }

    async fn pending_proposals(&self, user_id: Uuid, match_ids: &[Uuid]) -> AppResult<Vec<PendingProposalRow>> {
        if match_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.data
            .select_as(
                &Query::table(schema::MATCH_PROPOSALS)
                    .columns(&["match_id"])
                    .in_list("match_id", match_ids.iter().copied())
                    .eq("status", "pending")
                    .eq("receiver_id", user_id),
            )
            .await
            .log_err("unread.proposals")
    }

    async fn unread_notifications(&self, user_id: Uuid) -> AppResult<Vec<NotificationId>> {
        self.data
            .select_as(
                &Query::table(schema::NOTIFICATIONS)
                    .columns(&["id"])
                    .eq("user_id", user_id)
                    .eq("read", false),
            )
            .await
            .log_err("unread.notifications")
    }

    /// Social notifications of `user_id`, newest first.
    pub async fn list_notifications(
        &self,
        user_id: Uuid,
        params: &PaginationParams,
    ) -> AppResult<Paginated<Notification>> {
        let filter = Query::table(schema::NOTIFICATIONS).eq("user_id", user_id);

        let total = self.data.count(&filter).await.log_err("notifications.count")?;
        let items = self
            .data
            .select_as(
                &filter
                    .order_desc("created_at")
                    .limit(params.limit())
                    .offset(params.offset()),
            )
            .await
            .log_err("notifications.list")?;

        Ok(Paginated::new(items, total, params))
    }

    pub async fn mark_notification_read(&self, notification_id: Uuid, user_id: Uuid) -> AppResult<Notification> {
        let updated: Vec<Notification> = self
            .data
            .update_as(
                &Query::table(schema::NOTIFICATIONS)
                    .eq("id", notification_id)
                    .eq("user_id", user_id),
                read_patch(),
            )
            .await
            .log_err("notifications.mark_read")?;

        updated
            .into_iter()
            .next()
            .ok_or_else(|| AppError::new(ErrorCode::NotificationNotFound, "notification not found"))
    }

    pub async fn mark_all_read(&self, user_id: Uuid) -> AppResult<usize> {
        let updated = self
            .data
            .update(
                &Query::table(schema::NOTIFICATIONS)
                    .eq("user_id", user_id)
                    .eq("read", false),
                read_patch(),
            )
            .await
            .log_err("notifications.mark_all_read")?;

        tracing::debug!(user_id = %user_id, count = updated.len(), "notifications marked read");
        Ok(updated.len())
    }
}
