use async_trait::async_trait;
use chrono::Utc;
use mockall::mock;
use serde_json::json;
use uuid::Uuid;

use rally_shared::clients::data::{to_row, DataError, DataService, Query, Row};
use rally_shared::clients::memory::MemoryDataService;
use rally_shared::clients::realtime::{ChannelSpec, Subscription};
use rally_shared::schema;

use crate::models::{Candidate, Profile, SwipeAction};

mock! {
    pub Data {}

    #[async_trait]
    impl DataService for Data {
        async fn select(&self, query: &Query) -> Result<Vec<Row>, DataError>;
        async fn count(&self, query: &Query) -> Result<u64, DataError>;
        async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, DataError>;
        async fn update(&self, query: &Query, patch: Row) -> Result<Vec<Row>, DataError>;
        async fn delete(&self, query: &Query) -> Result<Vec<Row>, DataError>;
        async fn subscribe(&self, spec: ChannelSpec) -> Result<Subscription, DataError>;
    }
}

pub async fn seed_profile(data: &MemoryDataService, name: &str, position: Option<(f64, f64)>) -> Uuid {
    let id = Uuid::new_v4();
    let (latitude, longitude) = match position {
        Some((lat, lon)) => (json!(lat), json!(lon)),
        None => (json!(null), json!(null)),
    };
    let row = to_row(&json!({
        "id": id,
        "name": name,
        "skill_level": "Intermediate",
        "latitude": latitude,
        "longitude": longitude,
        "availability": [],
    }))
    .unwrap();
    data.insert(schema::PROFILES, vec![row]).await.unwrap();
    id
}

pub async fn seed_swipe(data: &MemoryDataService, actor: Uuid, target: Uuid, action: SwipeAction) {
    let row = to_row(&json!({ "user_id": actor, "target_user_id": target, "action": action })).unwrap();
    data.insert(schema::SWIPES, vec![row]).await.unwrap();
}

pub fn blank_profile() -> Profile {
    Profile {
        id: Uuid::new_v4(),
        name: String::new(),
        email: None,
        skill_level: None,
        location: None,
        latitude: None,
        longitude: None,
        bio: None,
        avatar_url: None,
        availability: Vec::new(),
        age: None,
        created_at: Utc::now(),
    }
}

pub fn candidate(has_liked_me: bool, distance_km: Option<f64>) -> Candidate {
    Candidate {
        profile: blank_profile(),
        has_liked_me,
        distance_km,
    }
}
