use std::sync::Arc;

use serde::Deserialize;
use uuid::Uuid;

use rally_shared::clients::data::{DataService, DataServiceExt, Query};
use rally_shared::errors::{AppError, AppResult, ErrorCode, LogErr};
use rally_shared::schema;

use crate::deck::{PendingSwipe, SwipeDeck};
use crate::models::{Match, NewMatch, NewSwipe, Swipe, SwipeAction, SwipeOutcome};

#[derive(Deserialize)]
struct MatchId {
    id: Uuid,
}

pub struct SwipeService {
    data: Arc<dyn DataService>,
}

impl SwipeService {
    pub fn new(data: Arc<dyn DataService>) -> Self {
        Self { data }
    }

    /// Records `actor`'s decision on `target` and materializes the match when
    /// the like is reciprocal.
    ///
    /// Repeating a like that is already stored re-runs the match step, so a
    /// match whose creation failed earlier is completed instead of lost.
    pub async fn swipe(&self, actor: Uuid, target: Uuid, action: SwipeAction) -> AppResult<SwipeOutcome> {
        if actor == target {
            return Err(AppError::new(ErrorCode::CannotSwipeSelf, "cannot swipe on yourself"));
        }

        let new_swipe = NewSwipe {
            user_id: actor,
            target_user_id: target,
            action,
        };
        match self.data.insert_one::<_, Swipe>(schema::SWIPES, &new_swipe).await {
            Ok(_) => {}
            Err(e) if e.is_unique_violation() => return self.repeated(actor, target, action).await,
            Err(e) if e.is_foreign_key_violation() => {
                tracing::info!(actor = %actor, target = %target, "swipe on unknown profile");
                return Err(AppError::with_details(
                    ErrorCode::ProfileNotFound,
                    "player not found",
                    serde_json::json!({ "target_id": target }),
                ));
            }
            Err(e) => return Err(e).log_err("swipe.insert"),
        }

        metrics::counter!("rally_swipes_total", "action" => action.as_str()).increment(1);
        tracing::info!(actor = %actor, target = %target, action = action.as_str(), "swipe recorded");

        if action == SwipeAction::Pass {
            return Ok(SwipeOutcome {
                is_match: false,
                match_id: None,
            });
        }

        self.match_if_reciprocal(actor, target).await
    }

    async fn repeated(&self, actor: Uuid, target: Uuid, action: SwipeAction) -> AppResult<SwipeOutcome> {
        if action == SwipeAction::Like && self.stored_action(actor, target).await? == Some(SwipeAction::Like) {
            let outcome = self.match_if_reciprocal(actor, target).await?;
            if outcome.is_match {
                tracing::info!(actor = %actor, target = %target, match_id = ?outcome.match_id, "repeated like settled a match");
                return Ok(outcome);
            }
        }

        tracing::info!(actor = %actor, target = %target, "duplicate swipe rejected");
        Err(AppError::with_details(
            ErrorCode::AlreadySwiped,
            "you already swiped on this player",
            serde_json::json!({ "target_id": target }),
        ))
    }

    async fn stored_action(&self, actor: Uuid, target: Uuid) -> AppResult<Option<SwipeAction>> {
        let query = Query::table(schema::SWIPES)
            .eq("user_id", actor)
            .eq("target_user_id", target);
        let stored = self
            .data
            .select_one_as::<Swipe>(&query)
            .await
            .log_err("swipe.reread")?;
        Ok(stored.map(|s| s.action))
    }

    async fn match_if_reciprocal(&self, actor: Uuid, target: Uuid) -> AppResult<SwipeOutcome> {
        let reciprocal = self
            .data
            .count(
                &Query::table(schema::SWIPES)
                    .eq("user_id", target)
                    .eq("target_user_id", actor)
                    .eq("action", SwipeAction::Like),
            )
            .await
            .log_err("swipe.reciprocal")?;

        if reciprocal == 0 {
            return Ok(SwipeOutcome {
                is_match: false,
                match_id: None,
            });
        }

        let pair = NewMatch::between(actor, target);
        let match_id = match self.data.insert_one::<_, Match>(schema::MATCHES, &pair).await {
            Ok(created) => {
                metrics::counter!("rally_matches_created_total").increment(1);
                tracing::info!(match_id = %created.id, user1 = %pair.user1_id, user2 = %pair.user2_id, "match created");
                Some(created.id)
            }
            Err(e) if e.is_unique_violation() => {
                // The other client won the race; the match exists all the same.
                tracing::debug!(user1 = %pair.user1_id, user2 = %pair.user2_id, "match already exists");
                self.existing_match(&pair).await
            }
            Err(e) => return Err(e).log_err("swipe.create_match"),
        };

        Ok(SwipeOutcome {
            is_match: true,
            match_id,
        })
    }

    async fn existing_match(&self, pair: &NewMatch) -> Option<Uuid> {
        let query = Query::table(schema::MATCHES)
            .columns(&["id"])
            .eq("user1_id", pair.user1_id)
            .eq("user2_id", pair.user2_id);

        match self.data.select_one_as::<MatchId>(&query).await {
            Ok(found) => found.map(|m| m.id),
            Err(e) => {
                tracing::warn!(error = %e, "could not re-read existing match");
                None
            }
        }
    }

    /// Sends a deck's pending swipe and settles the deck with the outcome.
    pub async fn commit(&self, deck: &mut SwipeDeck, pending: PendingSwipe) -> AppResult<SwipeOutcome> {
        let result = self.swipe(deck.user_id(), pending.target(), pending.action()).await;
        deck.settle(pending, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{candidate, seed_swipe, MockData};
    use rally_shared::clients::data::{to_row, DataError};
    use rally_shared::clients::memory::MemoryDataService;
    use serde_json::json;

    fn service(data: &Arc<MemoryDataService>) -> SwipeService {
        SwipeService::new(data.clone())
    }

    #[tokio::test]
    async fn reciprocal_like_creates_one_match() {
        let data = Arc::new(MemoryDataService::new());
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
        seed_swipe(&data, y, x, SwipeAction::Like).await;

        let outcome = service(&data).swipe(x, y, SwipeAction::Like).await.unwrap();

        assert!(outcome.is_match);
        let matches = data.rows(schema::MATCHES).await;
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0]["id"], json!(outcome.match_id.unwrap()));
        assert_eq!(matches[0]["user1_id"], json!(x.min(y)));
    }

    #[tokio::test]
    async fn one_sided_like_is_not_a_match() {
        let data = Arc::new(MemoryDataService::new());
        let outcome = service(&data)
            .swipe(Uuid::new_v4(), Uuid::new_v4(), SwipeAction::Like)
            .await
            .unwrap();

        assert_eq!(outcome, SwipeOutcome { is_match: false, match_id: None });
        assert!(data.rows(schema::MATCHES).await.is_empty());
    }

    #[tokio::test]
    async fn pass_never_matches() {
        let data = Arc::new(MemoryDataService::new());
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
        seed_swipe(&data, y, x, SwipeAction::Like).await;

        let outcome = service(&data).swipe(x, y, SwipeAction::Pass).await.unwrap();
        assert!(!outcome.is_match);
    }

    #[tokio::test]
    async fn match_race_is_success_with_existing_id() {
        let data = Arc::new(MemoryDataService::new());
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
        seed_swipe(&data, y, x, SwipeAction::Like).await;

        // The other client already created the match row.
        let pair = NewMatch::between(x, y);
        let stored = data
            .insert(schema::MATCHES, vec![to_row(&pair).unwrap()])
            .await
            .unwrap();

        let outcome = service(&data).swipe(x, y, SwipeAction::Like).await.unwrap();
        assert!(outcome.is_match);
        assert_eq!(json!(outcome.match_id.unwrap()), stored[0]["id"]);
        assert_eq!(data.rows(schema::MATCHES).await.len(), 1);
    }

    #[tokio::test]
    async fn reswipe_is_rejected() {
        let data = Arc::new(MemoryDataService::new());
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
        service(&data).swipe(x, y, SwipeAction::Pass).await.unwrap();

        let err = service(&data).swipe(x, y, SwipeAction::Like).await.unwrap_err();
        assert!(err.is(ErrorCode::AlreadySwiped));
    }

    #[tokio::test]
    async fn failed_match_insert_is_completed_by_retrying_the_like() {
        let data = Arc::new(MemoryDataService::new());
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
        seed_swipe(&data, y, x, SwipeAction::Like).await;

        data.fail_table(schema::MATCHES).await;
        assert!(service(&data).swipe(x, y, SwipeAction::Like).await.is_err());
        assert!(data.rows(schema::MATCHES).await.is_empty());

        data.heal_table(schema::MATCHES).await;
        let outcome = service(&data).swipe(x, y, SwipeAction::Like).await.unwrap();

        assert!(outcome.is_match);
        let matches = data.rows(schema::MATCHES).await;
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0]["id"], json!(outcome.match_id.unwrap()));
        assert_eq!(data.rows(schema::SWIPES).await.len(), 2);
    }

    #[tokio::test]
    async fn repeated_like_without_reciprocal_is_still_a_duplicate() {
        let data = Arc::new(MemoryDataService::new());
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
        service(&data).swipe(x, y, SwipeAction::Like).await.unwrap();

        let err = service(&data).swipe(x, y, SwipeAction::Like).await.unwrap_err();
        assert!(err.is(ErrorCode::AlreadySwiped));
    }

    #[tokio::test]
    async fn like_after_pass_does_not_match() {
        let data = Arc::new(MemoryDataService::new());
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
        seed_swipe(&data, y, x, SwipeAction::Like).await;
        seed_swipe(&data, x, y, SwipeAction::Pass).await;

        let err = service(&data).swipe(x, y, SwipeAction::Like).await.unwrap_err();
        assert!(err.is(ErrorCode::AlreadySwiped));
        assert!(data.rows(schema::MATCHES).await.is_empty());
    }

    #[tokio::test]
    async fn unknown_target_is_profile_not_found() {
        let mut data = MockData::new();
        data.expect_insert().returning(|_, _| {
            Err(DataError::ForeignKeyViolation {
                table: "swipes".into(),
                message: "insert or update on table \"swipes\" violates foreign key constraint".into(),
            })
        });
        let service = SwipeService::new(Arc::new(data));

        let err = service
            .swipe(Uuid::new_v4(), Uuid::new_v4(), SwipeAction::Like)
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::ProfileNotFound));
    }

    #[tokio::test]
    async fn self_swipe_is_rejected() {
        let data = Arc::new(MemoryDataService::new());
        let me = Uuid::new_v4();
        let err = service(&data).swipe(me, me, SwipeAction::Like).await.unwrap_err();
        assert!(err.is(ErrorCode::CannotSwipeSelf));
        assert!(data.rows(schema::SWIPES).await.is_empty());
    }

    #[tokio::test]
    async fn commit_rolls_back_on_transport_failure() {
        let mut data = MockData::new();
        data.expect_insert()
            .returning(|_, _| Err(DataError::Transport("offline".into())));
        let service = SwipeService::new(Arc::new(data));

        let card = candidate(false, None);
        let target = card.profile.id;
        let mut deck = SwipeDeck::new(Uuid::new_v4(), vec![card]);
        let pending = deck.swipe(SwipeAction::Like).unwrap();

        let result = service.commit(&mut deck, pending).await;
        assert!(result.is_err());
        assert_eq!(deck.top().map(|c| c.profile.id), Some(target));
        assert_eq!(deck.pending_count(), 0);
    }

    #[tokio::test]
    async fn commit_confirms_duplicate() {
        let data = Arc::new(MemoryDataService::new());
        let me = Uuid::new_v4();
        let card = candidate(false, None);
        seed_swipe(&data, me, card.profile.id, SwipeAction::Pass).await;

        let mut deck = SwipeDeck::new(me, vec![card]);
        let pending = deck.swipe(SwipeAction::Pass).unwrap();

        let result = service(&data).commit(&mut deck, pending).await;
        assert!(result.unwrap_err().is(ErrorCode::AlreadySwiped));
        assert!(deck.is_empty());
        assert_eq!(deck.pending_count(), 0);
        assert_eq!(data.rows(schema::SWIPES).await.len(), 1);
    }
}
