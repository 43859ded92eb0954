use std::sync::Arc;

use uuid::Uuid;

use rally_shared::clients::data::DataService;
use rally_shared::clients::realtime::{Binding, ChannelHandle, ChannelSpec, Channels};
use rally_shared::errors::{AppResult, LogErr};
use rally_shared::schema;
use rally_shared::types::event::ChangeKind;

use crate::models::Message;

/// Live delivery for one open chat screen.
///
/// Holds at most one listener. Subscribing again, to any match, releases the
/// previous listener first; dropping the session releases it too.
pub struct ChatSession {
    channels: Channels,
    current: Option<(Uuid, ChannelHandle)>,
}

impl ChatSession {
    pub fn new(data: Arc<dyn DataService>) -> Self {
        Self {
            channels: Channels::new(data),
            current: None,
        }
    }

    pub async fn subscribe_to_messages<F>(&mut self, match_id: Uuid, mut callback: F) -> AppResult<()>
    where
        F: FnMut(Message) + Send + 'static,
    {
        self.unsubscribe();

        let spec = ChannelSpec::new(format!("messages:{match_id}")).bind(
            Binding::table(schema::MESSAGES)
                .events(&[ChangeKind::Insert])
                .filter_eq("match_id", match_id),
        );

        let handle = self
            .channels
            .listen(spec, move |event| {
                match event.decode::<Message>() {
                    Ok(Some(message)) => callback(message),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "undecodable message event"),
                }
                std::future::ready(())
            })
            .await
            .log_err("chat.subscribe")?;

        tracing::debug!(match_id = %match_id, "chat subscription opened");
        self.current = Some((match_id, handle));
        Ok(())
    }

    pub fn unsubscribe(&mut self) {
        if let Some((match_id, handle)) = self.current.take() {
            drop(handle);
            tracing::debug!(match_id = %match_id, "chat subscription closed");
        }
    }

    /// The match currently delivering, if any.
    pub fn active_match(&self) -> Option<Uuid> {
        self.current
            .as_ref()
            .filter(|(_, handle)| handle.is_active())
            .map(|(match_id, _)| *match_id)
    }

    pub fn open_channels(&self) -> usize {
        self.channels.open_count()
    }
}
