//! Kafka command consumer with manual commits and reply support.
//!
//! One `CommandConsumer` per command topic. Offsets are committed only
//! after the handler finishes, giving at-least-once delivery; the handlers
//! are written to be safe under redelivery. A handler may return a reply
//! payload, which is produced to the `reply-to` header's topic (or the
//! configured default) with the incoming `correlation-id` echoed back.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const CORRELATION_ID_HEADER: &str = "correlation-id";
const REPLY_TO_HEADER: &str = "reply-to";

/// Failure to stand up the Kafka clients.
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Client creation or subscription failed
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

/// Processes one message payload; an optional reply payload comes back.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, payload: &[u8]) -> Option<Vec<u8>>;
}

/// Where replies go when a handler produces one.
struct ReplyChannel {
    producer: FutureProducer,
    default_topic: String,
}

/// A single-topic command consumer.
pub struct CommandConsumer {
    name: String,
    topic: String,
    consumer: StreamConsumer,
    reply: Option<ReplyChannel>,
    handler: Arc<dyn MessageHandler>,
    shutdown: broadcast::Receiver<()>,
    retry_delay: Duration,
}

impl CommandConsumer {
    /// Creates a consumer subscribed to `topic`.
    ///
    /// `reply_topic` configures the default reply destination; pass `None`
    /// for fire-and-forget workflows (any reply a handler produces is then
    /// dropped with a warning).
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Kafka`] when the clients cannot be created
    /// or the subscription fails.
    pub fn new(
        brokers: &str,
        group_id: &str,
        name: impl Into<String>,
        topic: impl Into<String>,
        reply_topic: Option<String>,
        handler: Arc<dyn MessageHandler>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self, ConsumerError> {
        let name = name.into();
        let topic = topic.into();

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()?;
        consumer.subscribe(&[topic.as_str()])?;

        let reply = match reply_topic {
            Some(default_topic) => {
                let producer: FutureProducer = ClientConfig::new()
                    .set("bootstrap.servers", brokers)
                    .set("message.timeout.ms", "5000")
                    .set("acks", "1")
                    .create()?;
                Some(ReplyChannel {
                    producer,
                    default_topic,
                })
            }
            None => None,
        };

        Ok(Self {
            name,
            topic,
            consumer,
            reply,
            handler,
            shutdown,
            retry_delay: Duration::from_secs(5),
        })
    }

    /// Spawn the consume loop as a background task.
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(consumer = %self.name, topic = %self.topic, "Command consumer started");
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Command consumer received shutdown signal");
                    break;
                }
                received = self.consumer.recv() => {
                    match received {
                        Ok(message) => {
                            self.dispatch(&message).await;
                            if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
                                warn!(
                                    consumer = %self.name,
                                    offset = message.offset(),
                                    error = %e,
                                    "Failed to commit offset; message may be redelivered"
                                );
                            }
                        }
                        Err(e) => {
                            error!(
                                consumer = %self.name,
                                error = %e,
                                "Failed to receive message, retrying in {:?}",
                                self.retry_delay
                            );
                            tokio::time::sleep(self.retry_delay).await;
                        }
                    }
                }
            }
        }
        info!(consumer = %self.name, "Command consumer stopped");
    }

    async fn dispatch(&self, message: &BorrowedMessage<'_>) {
        let Some(payload) = message.payload() else {
            warn!(consumer = %self.name, offset = message.offset(), "Message has no payload; skipping");
            return;
        };

        let reply_body = self.handler.handle(payload).await;
        let Some(body) = reply_body else {
            return;
        };
        let Some(reply) = &self.reply else {
            warn!(consumer = %self.name, "Handler produced a reply but no reply topic is configured");
            return;
        };

        let correlation_id = header_value(message, CORRELATION_ID_HEADER);
        let reply_topic = header_value(message, REPLY_TO_HEADER)
            .unwrap_or_else(|| reply.default_topic.clone());

        let mut headers = OwnedHeaders::new();
        if let Some(correlation_id) = &correlation_id {
            headers = headers.insert(Header {
                key: CORRELATION_ID_HEADER,
                value: Some(correlation_id.as_bytes()),
            });
        }

        let mut record: FutureRecord<'_, [u8], Vec<u8>> =
            FutureRecord::to(&reply_topic).payload(&body).headers(headers);
        if let Some(correlation_id) = &correlation_id {
            record = record.key(correlation_id.as_bytes());
        }

        match reply
            .producer
            .send(record, Timeout::After(Duration::from_secs(5)))
            .await
        {
            Ok((partition, offset)) => {
                info!(
                    consumer = %self.name,
                    reply_topic = %reply_topic,
                    partition = partition,
                    offset = offset,
                    "Reply published"
                );
            }
            Err((e, _)) => {
                error!(
                    consumer = %self.name,
                    reply_topic = %reply_topic,
                    error = %e,
                    "Failed to publish reply"
                );
            }
        }
    }
}

/// A UTF-8 header value, if present.
fn header_value(message: &BorrowedMessage<'_>, key: &str) -> Option<String> {
    let headers = message.headers()?;
    headers.iter().find_map(|header| {
        if header.key == key {
            header
                .value
                .and_then(|value| std::str::from_utf8(value).ok())
                .map(str::to_owned)
        } else {
            None
        }
    })
}
