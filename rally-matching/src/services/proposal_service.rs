use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use rally_shared::clients::data::{DataService, DataServiceExt, Query};
use rally_shared::clients::realtime::{Binding, ChannelHandle, ChannelSpec, Channels};
use rally_shared::errors::{AppError, AppResult, ErrorCode, LogErr};
use rally_shared::schema;
use rally_shared::types::event::ChangeKind;

use crate::calendar::CalendarEvent;
use crate::models::{MatchProposal, NewProposal, ProposalStatus};
use crate::services::match_service::MatchService;

pub const MAX_COURT_NAME_LEN: usize = 120;

/// A proposal row change pushed for one match.
#[derive(Debug, Clone)]
pub struct ProposalChange {
    pub kind: ChangeKind,
    pub proposal: MatchProposal,
}

#[derive(Clone)]
pub struct ProposalService {
    data: Arc<dyn DataService>,
    matches: MatchService,
}

impl ProposalService {
    pub fn new(data: Arc<dyn DataService>) -> Self {
        Self {
            matches: MatchService::new(data.clone()),
            data,
        }
    }

    /// At most one banner-worthy proposal per match: accepted beats pending,
    /// and the newest wins among equals.
    pub async fn get_active_proposals_for_matches(&self, match_ids: &[Uuid]) -> AppResult<HashMap<Uuid, MatchProposal>> {
        if match_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows: Vec<MatchProposal> = self
            .data
            .select_as(
                &Query::table(schema::MATCH_PROPOSALS)
                    .in_list("match_id", match_ids)
                    .in_list("status", [ProposalStatus::Pending, ProposalStatus::Accepted])
                    .order_desc("created_at"),
            )
            .await
            .log_err("proposals.active")?;

        Ok(pick_active(rows))
    }

    pub async fn create_proposal(
        &self,
        match_id: Uuid,
        sender_id: Uuid,
        scheduled_at: DateTime<Utc>,
        court_name: Option<String>,
    ) -> AppResult<MatchProposal> {
        let found = self.matches.require_participant(match_id, sender_id).await?;

        if scheduled_at <= Utc::now() {
            return Err(AppError::new(ErrorCode::ProposalInPast, "session must be scheduled in the future"));
        }

        let court_name = court_name
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        if court_name.as_ref().is_some_and(|c| c.chars().count() > MAX_COURT_NAME_LEN) {
            return Err(AppError::Validation(format!(
                "court name must be at most {MAX_COURT_NAME_LEN} characters"
            )));
        }

        let new_proposal = NewProposal {
            match_id,
            sender_id,
            receiver_id: found.counterpart(sender_id),
            scheduled_at,
            court_name,
            status: ProposalStatus::Pending,
        };

        let proposal: MatchProposal = self
            .data
            .insert_one(schema::MATCH_PROPOSALS, &new_proposal)
            .await
            .log_err("proposals.create")?;

        metrics::counter!("rally_proposals_total", "status" => "pending").increment(1);
        tracing::info!(
            proposal_id = %proposal.id,
            match_id = %match_id,
            sender_id = %sender_id,
            "proposal created"
        );

        Ok(proposal)
    }

    pub async fn get_proposal(&self, proposal_id: Uuid) -> AppResult<MatchProposal> {
        self.data
            .select_one_as::<MatchProposal>(&Query::table(schema::MATCH_PROPOSALS).eq("id", proposal_id))
            .await
            .log_err("proposals.get")?
            .ok_or_else(|| AppError::new(ErrorCode::ProposalNotFound, "proposal not found"))
    }

    /// The session as a calendar entry, for either player while it is still on.
    pub async fn calendar_event(&self, proposal_id: Uuid, actor_id: Uuid) -> AppResult<CalendarEvent> {
        let proposal = self.get_proposal(proposal_id).await?;

        if actor_id != proposal.sender_id && actor_id != proposal.receiver_id {
            return Err(AppError::new(ErrorCode::NotMatchParticipant, "not a participant of this proposal"));
        }
        if !proposal.status.is_active() {
            return Err(AppError::new(
                ErrorCode::Conflict,
                format!("a {} session has nothing to put in a calendar", proposal.status.as_str()),
            ));
        }

        Ok(CalendarEvent::for_proposal(&proposal))
    }

    /// Moves a proposal along its lifecycle on behalf of `actor_id`.
    ///
    /// The write only lands if the row still has the status read here; a
    /// concurrent transition turns into `ProposalConflict`.
    pub async fn respond_to_proposal(
        &self,
        proposal_id: Uuid,
        actor_id: Uuid,
        status: ProposalStatus,
    ) -> AppResult<MatchProposal> {
        let current = self.get_proposal(proposal_id).await?;

        if actor_id != current.sender_id && actor_id != current.receiver_id {
            return Err(AppError::new(ErrorCode::NotMatchParticipant, "not a participant of this proposal"));
        }

        if !current.status.can_transition_to(status) {
            return Err(AppError::with_details(
                ErrorCode::InvalidProposalTransition,
                format!("cannot move a {} proposal to {}", current.status.as_str(), status.as_str()),
                serde_json::json!({ "from": current.status, "to": status }),
            ));
        }

        let allowed = match (current.status, status) {
            (ProposalStatus::Pending, ProposalStatus::Accepted | ProposalStatus::Declined) => {
                actor_id == current.receiver_id
            }
            (ProposalStatus::Pending, ProposalStatus::Cancelled) => actor_id == current.sender_id,
            (ProposalStatus::Accepted, ProposalStatus::Cancelled) => true,
            _ => false,
        };
        if !allowed {
            return Err(AppError::forbidden(format!(
                "you cannot {} this proposal",
                match status {
                    ProposalStatus::Accepted => "accept",
                    ProposalStatus::Declined => "decline",
                    _ => "cancel",
                }
            )));
        }

        let mut patch = Map::new();
        patch.insert("status".into(), Value::String(status.as_str().into()));

        let updated: Vec<MatchProposal> = self
            .data
            .update_as(
                &Query::table(schema::MATCH_PROPOSALS)
                    .eq("id", proposal_id)
                    .eq("status", current.status),
                patch,
            )
            .await
            .log_err("proposals.respond")?;

        let proposal = updated.into_iter().next().ok_or_else(|| {
            tracing::info!(proposal_id = %proposal_id, "proposal changed concurrently");
            AppError::new(ErrorCode::ProposalConflict, "proposal was updated by someone else")
        })?;

        metrics::counter!("rally_proposals_total", "status" => status.as_str()).increment(1);
        tracing::info!(
            proposal_id = %proposal_id,
            actor_id = %actor_id,
            from = current.status.as_str(),
            to = status.as_str(),
            "proposal updated"
        );

        Ok(proposal)
    }

    /// Full history for a match, newest first.
    pub async fn get_proposals(&self, match_id: Uuid) -> AppResult<Vec<MatchProposal>> {
        self.data
            .select_as(
                &Query::table(schema::MATCH_PROPOSALS)
                    .eq("match_id", match_id)
                    .order_desc("created_at"),
            )
            .await
            .log_err("proposals.history")
    }

    /// Pushes every proposal change of a match to `callback` until the handle is dropped.
    pub async fn subscribe_to_proposals<F>(
        &self,
        channels: &Channels,
        match_id: Uuid,
        mut callback: F,
    ) -> AppResult<ChannelHandle>
    where
        F: FnMut(ProposalChange) + Send + 'static,
    {
        let spec = ChannelSpec::new(format!("proposals:{match_id}"))
            .bind(Binding::table(schema::MATCH_PROPOSALS).filter_eq("match_id", match_id));

        let handle = channels
            .listen(spec, move |event| {
                match event.decode::<MatchProposal>() {
                    Ok(Some(proposal)) => callback(ProposalChange {
                        kind: event.kind,
                        proposal,
                    }),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "undecodable proposal change"),
                }
                std::future::ready(())
            })
            .await
            .log_err("proposals.subscribe")?;

        Ok(handle)
    }
}

/// Rows must arrive newest first.
fn pick_active(rows: Vec<MatchProposal>) -> HashMap<Uuid, MatchProposal> {
    let mut active: HashMap<Uuid, MatchProposal> = HashMap::new();
    for proposal in rows.into_iter().filter(|p| p.status.is_active()) {
        match active.get(&proposal.match_id) {
            None => {
                active.insert(proposal.match_id, proposal);
            }
            Some(kept) if kept.status == ProposalStatus::Pending && proposal.status == ProposalStatus::Accepted => {
                active.insert(proposal.match_id, proposal);
            }
            Some(_) => {}
        }
    }
    active
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewMatch;
    use crate::testing::MockData;
    use chrono::Duration;
    use rally_shared::clients::data::to_row;
    use rally_shared::clients::memory::MemoryDataService;
    use rstest::rstest;
    use std::time::Duration as StdDuration;
    use tokio::sync::mpsc;

    struct Fixture {
        data: Arc<MemoryDataService>,
        service: ProposalService,
        match_id: Uuid,
        sender: Uuid,
        receiver: Uuid,
    }

    async fn fixture() -> Fixture {
        let data = Arc::new(MemoryDataService::new());
        let (sender, receiver) = (Uuid::new_v4(), Uuid::new_v4());
        let stored = data
            .insert(schema::MATCHES, vec![to_row(&NewMatch::between(sender, receiver)).unwrap()])
            .await
            .unwrap();
        let match_id = serde_json::from_value(stored[0]["id"].clone()).unwrap();
        Fixture {
            service: ProposalService::new(data.clone()),
            data,
            match_id,
            sender,
            receiver,
        }
    }

    fn tomorrow() -> DateTime<Utc> {
        Utc::now() + Duration::days(1)
    }

    fn proposal(match_id: Uuid, status: ProposalStatus, age_minutes: i64) -> MatchProposal {
        let now = Utc::now();
        MatchProposal {
            id: Uuid::new_v4(),
            match_id,
            sender_id: Uuid::new_v4(),
            receiver_id: Uuid::new_v4(),
            scheduled_at: now + Duration::days(1),
            court_name: None,
            status,
            created_at: now - Duration::minutes(age_minutes),
        }
    }

    #[test]
    fn accepted_beats_newer_pending() {
        let m = Uuid::new_v4();
        let newer_pending = proposal(m, ProposalStatus::Pending, 1);
        let older_accepted = proposal(m, ProposalStatus::Accepted, 10);
        let oldest_pending = proposal(m, ProposalStatus::Pending, 20);

        let active = pick_active(vec![newer_pending, older_accepted.clone(), oldest_pending]);
        assert_eq!(active.len(), 1);
        assert_eq!(active[&m].id, older_accepted.id);
    }

    #[test]
    fn newest_wins_among_equal_status() {
        let m = Uuid::new_v4();
        let newest = proposal(m, ProposalStatus::Pending, 1);
        let older = proposal(m, ProposalStatus::Pending, 5);

        let active = pick_active(vec![newest.clone(), older]);
        assert_eq!(active[&m].id, newest.id);
    }

    #[tokio::test]
    async fn empty_match_list_makes_no_remote_call() {
        // No expectations: any call on the mock panics.
        let service = ProposalService::new(Arc::new(MockData::new()));
        let active = service.get_active_proposals_for_matches(&[]).await.unwrap();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn pending_then_accepted_keeps_the_same_banner() {
        let f = fixture().await;
        let created = f
            .service
            .create_proposal(f.match_id, f.sender, tomorrow(), Some("  Court 7  ".into()))
            .await
            .unwrap();
        assert_eq!(created.receiver_id, f.receiver);
        assert_eq!(created.court_name.as_deref(), Some("Court 7"));

        let active = f.service.get_active_proposals_for_matches(&[f.match_id]).await.unwrap();
        assert_eq!(active[&f.match_id].status, ProposalStatus::Pending);

        f.service
            .respond_to_proposal(created.id, f.receiver, ProposalStatus::Accepted)
            .await
            .unwrap();
        // A stale pending proposal created later must not take over the banner.
        f.service
            .create_proposal(f.match_id, f.receiver, tomorrow(), None)
            .await
            .unwrap();

        let active = f.service.get_active_proposals_for_matches(&[f.match_id]).await.unwrap();
        assert_eq!(active[&f.match_id].id, created.id);
        assert_eq!(active[&f.match_id].status, ProposalStatus::Accepted);
    }

    #[tokio::test]
    async fn declined_proposal_clears_the_banner() {
        let f = fixture().await;
        let created = f.service.create_proposal(f.match_id, f.sender, tomorrow(), None).await.unwrap();
        f.service
            .respond_to_proposal(created.id, f.receiver, ProposalStatus::Declined)
            .await
            .unwrap();

        let active = f.service.get_active_proposals_for_matches(&[f.match_id]).await.unwrap();
        assert!(active.is_empty());
        assert_eq!(f.service.get_proposals(f.match_id).await.unwrap().len(), 1);
    }

    #[rstest]
    #[case::sender_accepts(true, ProposalStatus::Accepted, ErrorCode::Forbidden)]
    #[case::receiver_cancels_pending(false, ProposalStatus::Cancelled, ErrorCode::Forbidden)]
    #[case::back_to_pending(false, ProposalStatus::Pending, ErrorCode::InvalidProposalTransition)]
    #[tokio::test]
    async fn role_and_transition_rules(#[case] as_sender: bool, #[case] to: ProposalStatus, #[case] expected: ErrorCode) {
        let f = fixture().await;
        let created = f.service.create_proposal(f.match_id, f.sender, tomorrow(), None).await.unwrap();
        let actor = if as_sender { f.sender } else { f.receiver };

        let err = f.service.respond_to_proposal(created.id, actor, to).await.unwrap_err();
        assert!(err.is(expected), "got {:?}", err.error_code());
    }

    #[tokio::test]
    async fn either_player_cancels_an_accepted_session() {
        let f = fixture().await;
        let created = f.service.create_proposal(f.match_id, f.sender, tomorrow(), None).await.unwrap();
        f.service
            .respond_to_proposal(created.id, f.receiver, ProposalStatus::Accepted)
            .await
            .unwrap();

        let cancelled = f
            .service
            .respond_to_proposal(created.id, f.receiver, ProposalStatus::Cancelled)
            .await
            .unwrap();
        assert_eq!(cancelled.status, ProposalStatus::Cancelled);

        let err = f
            .service
            .respond_to_proposal(created.id, f.sender, ProposalStatus::Cancelled)
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::InvalidProposalTransition));
    }

    #[tokio::test]
    async fn past_sessions_and_outsiders_are_rejected() {
        let f = fixture().await;
        let err = f
            .service
            .create_proposal(f.match_id, f.sender, Utc::now() - Duration::hours(1), None)
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::ProposalInPast));

        let err = f
            .service
            .create_proposal(f.match_id, Uuid::new_v4(), tomorrow(), None)
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::NotMatchParticipant));
        assert!(f.data.rows(schema::MATCH_PROPOSALS).await.is_empty());
    }

    #[tokio::test]
    async fn calendar_entry_only_for_players_of_a_live_session() {
        let f = fixture().await;
        let at = tomorrow();
        let created = f
            .service
            .create_proposal(f.match_id, f.sender, at, Some("Court 2".into()))
            .await
            .unwrap();

        let event = f.service.calendar_event(created.id, f.receiver).await.unwrap();
        assert_eq!(event.start, at);
        assert_eq!(event.end(), at + Duration::hours(1));
        assert_eq!(event.location.as_deref(), Some("Court 2"));

        let err = f.service.calendar_event(created.id, Uuid::new_v4()).await.unwrap_err();
        assert!(err.is(ErrorCode::NotMatchParticipant));

        f.service
            .respond_to_proposal(created.id, f.sender, ProposalStatus::Cancelled)
            .await
            .unwrap();
        let err = f.service.calendar_event(created.id, f.sender).await.unwrap_err();
        assert!(err.is(ErrorCode::Conflict));

        let err = f.service.calendar_event(Uuid::new_v4(), f.sender).await.unwrap_err();
        assert!(err.is(ErrorCode::ProposalNotFound));
    }

    #[tokio::test]
    async fn subscription_delivers_changes_for_its_match_only() {
        let f = fixture().await;
        let channels = Channels::new(f.data.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _handle = f
            .service
            .subscribe_to_proposals(&channels, f.match_id, move |change| {
                let _ = tx.send((change.kind, change.proposal.status));
            })
            .await
            .unwrap();

        let created = f.service.create_proposal(f.match_id, f.sender, tomorrow(), None).await.unwrap();
        f.service
            .respond_to_proposal(created.id, f.receiver, ProposalStatus::Accepted)
            .await
            .unwrap();

        let first = tokio::time::timeout(StdDuration::from_secs(1), rx.recv()).await.unwrap();
        let second = tokio::time::timeout(StdDuration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(first, Some((ChangeKind::Insert, ProposalStatus::Pending)));
        assert_eq!(second, Some((ChangeKind::Update, ProposalStatus::Accepted)));
    }
}
