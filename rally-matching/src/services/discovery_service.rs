use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use uuid::Uuid;

use rally_shared::clients::data::{DataService, DataServiceExt, Query};
use rally_shared::errors::{AppResult, LogErr};
use rally_shared::schema;

use crate::geo::distance_km;
use crate::models::{Candidate, GeoPoint, Profile, SwipeAction};

pub const DEFAULT_DISCOVERY_LIMIT: u64 = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryQuery {
    pub user_id: Uuid,
    pub origin: Option<GeoPoint>,
    pub max_distance_km: Option<f64>,
    pub limit: u64,
}

impl DiscoveryQuery {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            origin: None,
            max_distance_km: None,
            limit: DEFAULT_DISCOVERY_LIMIT,
        }
    }

    pub fn near(mut self, origin: GeoPoint) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn within_km(mut self, radius: f64) -> Self {
        self.max_distance_km = Some(radius);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }
}

#[derive(Deserialize)]
struct SwipedTarget {
    target_user_id: Uuid,
}

#[derive(Deserialize)]
struct Liker {
    user_id: Uuid,
}

pub struct DiscoveryService {
    data: Arc<dyn DataService>,
}

impl DiscoveryService {
    pub fn new(data: Arc<dyn DataService>) -> Self {
        Self { data }
    }

    /// Candidates the user has not decided on yet, reciprocal likes first,
    /// then nearest first. Any failed fetch fails the whole call.
    pub async fn discover(&self, query: &DiscoveryQuery) -> AppResult<Vec<Candidate>> {
        let me = query.user_id;

        let swiped: HashSet<Uuid> = self
            .data
            .select_as::<SwipedTarget>(
                &Query::table(schema::SWIPES)
                    .columns(&["target_user_id"])
                    .eq("user_id", me),
            )
            .await
            .log_err("discovery.swiped")?
            .into_iter()
            .map(|s| s.target_user_id)
            .collect();

        let profiles: Vec<Profile> = self
            .data
            .select_as(
                &Query::table(schema::PROFILES)
                    .neq("id", me)
                    .not_in("id", swiped.iter())
                    .order_desc("created_at")
                    .limit(query.limit),
            )
            .await
            .log_err("discovery.profiles")?;

        let mut seen = HashSet::new();
        let profiles: Vec<Profile> = profiles
            .into_iter()
            .filter(|p| p.id != me && !swiped.contains(&p.id) && seen.insert(p.id))
            .collect();

        if profiles.is_empty() {
            return Ok(Vec::new());
        }

        let liked_me: HashSet<Uuid> = self
            .data
            .select_as::<Liker>(
                &Query::table(schema::SWIPES)
                    .columns(&["user_id"])
                    .eq("target_user_id", me)
                    .eq("action", SwipeAction::Like)
                    .in_list("user_id", profiles.iter().map(|p| p.id)),
            )
            .await
            .log_err("discovery.incoming_likes")?
            .into_iter()
            .map(|l| l.user_id)
            .collect();

        let candidates: Vec<Candidate> = profiles
            .into_iter()
            .map(|profile| Candidate {
                has_liked_me: liked_me.contains(&profile.id),
                distance_km: query
                    .origin
                    .zip(profile.position())
                    .map(|(origin, there)| distance_km(origin, there)),
                profile,
            })
            .collect();

        let ranked = rank(candidates, query.max_distance_km);

        metrics::histogram!("rally_discovery_candidates").record(ranked.len() as f64);
        tracing::debug!(
            user_id = %me,
            excluded = swiped.len(),
            returned = ranked.len(),
            "discovery ranked"
        );

        Ok(ranked)
    }
}

/// Applies the radius filter and the ranking order. The sort is stable, so
/// ties keep the fetch order (newest profile first).
pub fn rank(mut candidates: Vec<Candidate>, max_distance_km: Option<f64>) -> Vec<Candidate> {
    if let Some(radius) = max_distance_km {
        candidates.retain(|c| c.distance_km.is_some_and(|d| d <= radius));
    }

    candidates.sort_by(|a, b| {
        b.has_liked_me
            .cmp(&a.has_liked_me)
            .then_with(|| match (a.distance_km, b.distance_km) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
    });

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{candidate, seed_profile, seed_swipe, MockData};
    use rally_shared::clients::data::DataError;
    use rally_shared::clients::memory::MemoryDataService;
    use rally_shared::ErrorCode;
    use rstest::rstest;

    const PARIS: (f64, f64) = (48.8566, 2.3522);

    #[test]
    fn reciprocal_likes_come_first_then_nearest() {
        let input = vec![
            candidate(false, Some(2.0)),
            candidate(true, None),
            candidate(false, None),
            candidate(true, Some(10.0)),
            candidate(false, Some(1.0)),
        ];
        let ids: Vec<Uuid> = input.iter().map(|c| c.profile.id).collect();

        let ranked: Vec<Uuid> = rank(input, None).into_iter().map(|c| c.profile.id).collect();
        assert_eq!(ranked, vec![ids[3], ids[1], ids[4], ids[0], ids[2]]);
    }

    #[test]
    fn ties_keep_fetch_order() {
        let input = vec![candidate(false, Some(5.0)), candidate(false, Some(5.0)), candidate(false, Some(5.0))];
        let ids: Vec<Uuid> = input.iter().map(|c| c.profile.id).collect();

        let ranked: Vec<Uuid> = rank(input, None).into_iter().map(|c| c.profile.id).collect();
        assert_eq!(ranked, ids);
    }

    #[rstest]
    #[case(Some(24.9), true)]
    #[case(Some(25.0), true)]
    #[case(Some(30.0), false)]
    #[case(None, false)]
    fn radius_filter(#[case] distance: Option<f64>, #[case] kept: bool) {
        let ranked = rank(vec![candidate(false, distance)], Some(25.0));
        assert_eq!(ranked.len() == 1, kept);
    }

    #[tokio::test]
    async fn excludes_self_and_swiped_and_flags_reciprocal_likes() {
        let data = Arc::new(MemoryDataService::new());
        let me = seed_profile(&data, "me", Some(PARIS)).await;
        let passed = seed_profile(&data, "passed", Some(PARIS)).await;
        let admirer = seed_profile(&data, "admirer", Some((48.9, 2.4))).await;
        let stranger = seed_profile(&data, "stranger", None).await;

        seed_swipe(&data, me, passed, SwipeAction::Pass).await;
        seed_swipe(&data, admirer, me, SwipeAction::Like).await;
        seed_swipe(&data, stranger, me, SwipeAction::Pass).await;

        let service = DiscoveryService::new(data.clone());
        let query = DiscoveryQuery::new(me).near(GeoPoint::new(PARIS.0, PARIS.1));
        let found = service.discover(&query).await.unwrap();

        let ids: Vec<Uuid> = found.iter().map(|c| c.profile.id).collect();
        assert_eq!(ids, vec![admirer, stranger]);
        assert!(found[0].has_liked_me);
        assert!(found[0].distance_km.is_some());
        assert!(!found[1].has_liked_me);
        assert_eq!(found[1].distance_km, None);
    }

    #[tokio::test]
    async fn radius_without_origin_yields_nothing() {
        let data = Arc::new(MemoryDataService::new());
        let me = seed_profile(&data, "me", None).await;
        seed_profile(&data, "near", Some(PARIS)).await;

        let service = DiscoveryService::new(data);
        let found = service.discover(&DiscoveryQuery::new(me).within_km(50.0)).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn limit_caps_the_fetch() {
        let data = Arc::new(MemoryDataService::new());
        let me = seed_profile(&data, "me", None).await;
        for n in 0..5 {
            seed_profile(&data, &format!("p{n}"), None).await;
        }

        let service = DiscoveryService::new(data);
        let found = service.discover(&DiscoveryQuery::new(me).limit(3)).await.unwrap();
        let names: Vec<&str> = found.iter().map(|c| c.profile.name.as_str()).collect();
        assert_eq!(names, vec!["p4", "p3", "p2"]);
    }

    #[tokio::test]
    async fn remote_failure_aborts_without_partial_result() {
        let mut data = MockData::new();
        data.expect_select()
            .times(1)
            .returning(|_| Err(DataError::Transport("connection reset".into())));

        let service = DiscoveryService::new(Arc::new(data));
        let err = service.discover(&DiscoveryQuery::new(Uuid::new_v4())).await.unwrap_err();
        assert!(err.is(ErrorCode::ServiceUnavailable));
    }
}
