use futures_lite::StreamExt;
use lapin::{
    options::*, types::FieldTable, BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::data::DataError;
use super::realtime::{ChannelSpec, Subscription, SUBSCRIPTION_BUFFER};
use crate::types::event::{routing_keys, ChangeEvent, Event};

impl From<lapin::Error> for DataError {
    fn from(e: lapin::Error) -> Self {
        DataError::Feed(e.to_string())
    }
}

/// Change feed carried over the `rally.changes` topic exchange.
#[derive(Clone)]
pub struct RabbitMQClient {
    channel: Channel,
}

impl RabbitMQClient {
    pub async fn connect(url: &str) -> Result<Self, lapin::Error> {
        let conn = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = conn.create_channel().await?;

        channel
            .exchange_declare(
                routing_keys::CHANGES_EXCHANGE,
                lapin::ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        tracing::info!(exchange = routing_keys::CHANGES_EXCHANGE, "connected to RabbitMQ");
        Ok(Self { channel })
    }

    /// Publishes one row change; used by the database bridge and by tooling.
    pub async fn publish(&self, event: &Event<ChangeEvent>) -> Result<(), DataError> {
        let routing_key = routing_keys::change(&event.data.table, event.data.kind);
        let payload = serde_json::to_vec(event)?;

        self.channel
            .basic_publish(
                routing_keys::CHANGES_EXCHANGE,
                &routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await?
            .await?;

        tracing::debug!(routing_key = %routing_key, event_id = %event.id, "change published");
        Ok(())
    }

    /// Opens a private queue for one channel and forwards its matching changes.
    pub async fn subscribe(&self, spec: ChannelSpec) -> Result<Subscription, DataError> {
        let queue = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        let queue_name = queue.name().as_str().to_string();

        let mut keys: Vec<String> = spec
            .bindings
            .iter()
            .flat_map(|b| b.events.iter().map(|kind| routing_keys::change(&b.table, *kind)))
            .collect();
        keys.sort();
        keys.dedup();

        for key in &keys {
            self.channel
                .queue_bind(
                    &queue_name,
                    routing_keys::CHANGES_EXCHANGE,
                    key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        let tag = format!("{}-{}", spec.name, Uuid::new_v4());
        let mut consumer = self
            .channel
            .basic_consume(
                &queue_name,
                &tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        tracing::info!(channel = %spec.name, queue = %queue_name, bindings = ?keys, "subscribed to change feed");

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let channel = self.channel.clone();
        let name = spec.name.clone();

        tokio::spawn(async move {
            loop {
                let delivery = tokio::select! {
                    _ = tx.closed() => break,
                    next = consumer.next() => match next {
                        Some(Ok(delivery)) => delivery,
                        Some(Err(e)) => {
                            tracing::error!(channel = %spec.name, error = %e, "consumer error");
                            continue;
                        }
                        None => break,
                    },
                };

                let event: Event<ChangeEvent> = match serde_json::from_slice(&delivery.data) {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::error!(channel = %spec.name, error = %e, "failed to deserialize change");
                        continue;
                    }
                };

                if spec.matches(&event.data) && tx.send(event.data).await.is_err() {
                    break;
                }
            }

            if let Err(e) = channel.basic_cancel(&tag, BasicCancelOptions::default()).await {
                tracing::debug!(channel = %spec.name, error = %e, "consumer cancel failed");
            }
            tracing::debug!(channel = %spec.name, "change feed consumer stopped");
        });

        Ok(Subscription::new(name, rx))
    }

    pub fn is_connected(&self) -> bool {
        self.channel.status().connected()
    }
}
