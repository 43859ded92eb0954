use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use rally_matching::models::NewMatch;
use rally_shared::clients::data::{to_row, DataService, Row};
use rally_shared::clients::memory::MemoryDataService;
use rally_shared::schema;

async fn insert(data: &MemoryDataService, table: &str, value: serde_json::Value) -> Row {
    let stored = data.insert(table, vec![to_row(&value).unwrap()]).await.unwrap();
    stored.into_iter().next().unwrap()
}

fn id_of(row: &Row) -> Uuid {
    serde_json::from_value(row["id"].clone()).unwrap()
}

pub async fn seed_match(data: &MemoryDataService, a: Uuid, b: Uuid) -> Uuid {
    let row = insert(data, schema::MATCHES, serde_json::to_value(NewMatch::between(a, b)).unwrap()).await;
    id_of(&row)
}

pub async fn seed_message_row(data: &MemoryDataService, match_id: Uuid, sender: Uuid, read: bool) -> Row {
    insert(
        data,
        schema::MESSAGES,
        json!({ "match_id": match_id, "sender_id": sender, "content": "hey", "read": read }),
    )
    .await
}

pub async fn seed_message(data: &MemoryDataService, match_id: Uuid, sender: Uuid, read: bool) -> Uuid {
    id_of(&seed_message_row(data, match_id, sender, read).await)
}

pub async fn seed_proposal(data: &MemoryDataService, match_id: Uuid, sender: Uuid, receiver: Uuid, status: &str) -> Uuid {
    let row = insert(
        data,
        schema::MATCH_PROPOSALS,
        json!({
            "match_id": match_id,
            "sender_id": sender,
            "receiver_id": receiver,
            "scheduled_at": Utc::now() + Duration::days(2),
            "status": status,
        }),
    )
    .await;
    id_of(&row)
}

pub async fn seed_notification_row(data: &MemoryDataService, user_id: Uuid, read: bool) -> Row {
    insert(
        data,
        schema::NOTIFICATIONS,
        json!({ "user_id": user_id, "sender_id": Uuid::new_v4(), "type": "like", "read": read }),
    )
    .await
}

pub async fn seed_notification(data: &MemoryDataService, user_id: Uuid, read: bool) -> Uuid {
    id_of(&seed_notification_row(data, user_id, read).await)
}
