use std::future::Future;

use futures::StreamExt;
use lapin::options::{BasicConsumeOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use thiserror::Error;
use tracing::info;

const CONSUMER_TAG: &str = "report-relay";

/// Where report payloads come from. One call, one message.
pub trait MessageSource {
    /// Wait for the next payload. `None` means the source has closed for good.
    fn next_payload(
        &mut self,
    ) -> impl Future<Output = Option<Result<Vec<u8>, SourceError>>> + Send + '_;
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to connect to broker: {0}")]
    Connect(#[source] lapin::Error),

    #[error("failed to open channel: {0}")]
    OpenChannel(#[source] lapin::Error),

    #[error("failed to declare queue {queue}: {source}")]
    DeclareQueue { queue: String, source: lapin::Error },

    #[error("failed to start consuming {queue}: {source}")]
    Consume { queue: String, source: lapin::Error },

    #[error("delivery failed: {0}")]
    Delivery(#[from] lapin::Error),
}

/// Consumer on a durable AMQP queue with automatic acknowledgement.
///
/// The broker considers a message handled the moment it is delivered, so a
/// payload that later fails to decode is not redelivered.
pub struct AmqpSource {
    // Dropping either of these tears down the consumer.
    _connection: Connection,
    _channel: Channel,
    consumer: Consumer,
}

impl AmqpSource {
    pub async fn connect(url: &str, queue: &str) -> Result<Self, SourceError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(SourceError::Connect)?;

        let channel = connection
            .create_channel()
            .await
            .map_err(SourceError::OpenChannel)?;

        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| SourceError::DeclareQueue {
                queue: queue.to_owned(),
                source,
            })?;

        let consumer = channel
            .basic_consume(
                queue,
                CONSUMER_TAG,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| SourceError::Consume {
                queue: queue.to_owned(),
                source,
            })?;

        info!(queue, backlog = declared.message_count(), "consuming from queue");

        Ok(Self {
            _connection: connection,
            _channel: channel,
            consumer,
        })
    }
}

impl MessageSource for AmqpSource {
    async fn next_payload(&mut self) -> Option<Result<Vec<u8>, SourceError>> {
        let delivery = self.consumer.next().await?;
        Some(delivery.map(|d| d.data).map_err(SourceError::from))
    }
}
