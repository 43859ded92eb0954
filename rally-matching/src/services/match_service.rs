use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use rally_shared::clients::data::{DataService, DataServiceExt, Filter, Query};
use rally_shared::errors::{AppError, AppResult, ErrorCode, LogErr};
use rally_shared::schema;

use crate::models::{Match, MatchSummary, MatchedProfile, Profile};
use crate::services::proposal_service::ProposalService;

#[derive(Clone)]
pub struct MatchService {
    data: Arc<dyn DataService>,
}

impl MatchService {
    pub fn new(data: Arc<dyn DataService>) -> Self {
        Self { data }
    }

    /// All matches of `user_id`, newest first.
    pub async fn list_matches(&self, user_id: Uuid) -> AppResult<Vec<Match>> {
        self.data
            .select_as(
                &Query::table(schema::MATCHES)
                    .or(vec![Filter::eq("user1_id", user_id), Filter::eq("user2_id", user_id)])
                    .order_desc("created_at"),
            )
            .await
            .log_err("matches.list")
    }

    /// Matches with the counterpart's profile, newest first.
    pub async fn get_matches(&self, user_id: Uuid) -> AppResult<Vec<MatchedProfile>> {
        let matches = self.list_matches(user_id).await?;
        if matches.is_empty() {
            return Ok(Vec::new());
        }

        let profiles: HashMap<Uuid, Profile> = self
            .data
            .select_as::<Profile>(
                &Query::table(schema::PROFILES).in_list("id", matches.iter().map(|m| m.counterpart(user_id))),
            )
            .await
            .log_err("matches.profiles")?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let matched = matches
            .into_iter()
            .filter_map(|m| {
                let counterpart = m.counterpart(user_id);
                match profiles.get(&counterpart) {
                    Some(profile) => Some(MatchedProfile {
                        profile: profile.clone(),
                        match_id: m.id,
                        matched_at: m.created_at,
                    }),
                    None => {
                        tracing::warn!(match_id = %m.id, counterpart = %counterpart, "counterpart profile missing");
                        None
                    }
                }
            })
            .collect();

        Ok(matched)
    }

    pub async fn get_match(&self, match_id: Uuid) -> AppResult<Match> {
        self.data
            .select_one_as::<Match>(&Query::table(schema::MATCHES).eq("id", match_id))
            .await
            .log_err("matches.get")?
            .ok_or_else(|| AppError::new(ErrorCode::MatchNotFound, "match not found"))
    }

    /// The match, provided `user_id` is one of its two players.
    pub async fn require_participant(&self, match_id: Uuid, user_id: Uuid) -> AppResult<Match> {
        let found = self.get_match(match_id).await?;
        if !found.involves(user_id) {
            return Err(AppError::new(ErrorCode::NotMatchParticipant, "not a participant of this match"));
        }
        Ok(found)
    }

    /// Dashboard view: each match with its session banner.
    pub async fn match_summaries(&self, user_id: Uuid, proposals: &ProposalService) -> AppResult<Vec<MatchSummary>> {
        let matched = self.get_matches(user_id).await?;
        let ids: Vec<Uuid> = matched.iter().map(|m| m.match_id).collect();
        let mut active = proposals.get_active_proposals_for_matches(&ids).await?;

        Ok(matched
            .into_iter()
            .map(|m| MatchSummary {
                active_proposal: active.remove(&m.match_id),
                matched: m,
            })
            .collect())
    }
}
