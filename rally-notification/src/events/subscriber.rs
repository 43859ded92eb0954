use std::sync::Arc;

use uuid::Uuid;

use rally_shared::clients::realtime::{Binding, ChannelHandle, ChannelSpec, Channels};
use rally_shared::errors::{AppResult, LogErr};
use rally_shared::schema;
use rally_shared::types::event::ChangeKind;

use crate::center::NotificationCenter;

/// Everything that can move the unread counters of `user_id`.
pub fn unread_channel(user_id: Uuid) -> ChannelSpec {
    ChannelSpec::new(format!("unread:{user_id}"))
        .bind(Binding::table(schema::MESSAGES).events(&[ChangeKind::Insert]))
        .bind(Binding::table(schema::MATCH_PROPOSALS))
        .bind(Binding::table(schema::NOTIFICATIONS).filter_eq("user_id", user_id))
}

/// Feeds the user's change events into `center`, one at a time.
pub async fn listen_unread_events(center: Arc<NotificationCenter>, channels: &Channels) -> AppResult<ChannelHandle> {
    let user_id = center.user_id();
    let handle = channels
        .listen(unread_channel(user_id), move |event| {
            let center = center.clone();
            async move {
                if let Err(e) = center.handle_event(&event).await {
                    tracing::error!(
                        user_id = %center.user_id(),
                        table = %event.table,
                        kind = event.kind.as_str(),
                        error = %e,
                        "failed to apply change to unread counters"
                    );
                }
            }
        })
        .await
        .log_err("unread.subscribe")?;

    tracing::info!(user_id = %user_id, "listening for unread changes");
    Ok(handle)
}
