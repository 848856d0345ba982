//! Replacement hand-off queue.
//!
//! Cron runs launch spot instances and enqueue a message per launch; the
//! event-driven path drains the queue and performs the attachment. The
//! queue is FIFO, keyed by instance id so retries of the same instance
//! collapse.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::aws::context::AwsContext;

/// One pending replacement attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementMessage {
    pub region: String,
    pub instance_id: String,
}

/// A received message with its deletion handle.
#[derive(Debug, Clone)]
pub struct QueuedReplacement {
    pub message: ReplacementMessage,
    pub receipt_handle: String,
}

pub struct ReplacementQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl ReplacementQueue {
    pub fn new(ctx: &AwsContext, queue_url: &str) -> Self {
        Self {
            client: ctx.sqs_client(),
            queue_url: queue_url.to_string(),
        }
    }

    pub async fn send(&self, message: &ReplacementMessage) -> Result<()> {
        let body = serde_json::to_string(message).context("Failed to encode queue message")?;

        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .message_group_id(&message.instance_id)
            .message_deduplication_id(&message.instance_id)
            .send()
            .await
            .context("Failed to send replacement message")?;

        debug!(instance_id = %message.instance_id, "Enqueued replacement hand-off");
        Ok(())
    }

    /// Drain up to ten pending messages. Undecodable bodies are dropped
    /// with a log line so one bad message cannot wedge the queue.
    pub async fn receive(&self) -> Result<Vec<QueuedReplacement>> {
        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(10)
            .wait_time_seconds(1)
            .send()
            .await
            .context("Failed to receive replacement messages")?;

        let mut received = Vec::new();
        for message in response.messages() {
            let (Some(body), Some(receipt_handle)) = (message.body(), message.receipt_handle())
            else {
                continue;
            };
            match serde_json::from_str::<ReplacementMessage>(body) {
                Ok(decoded) => received.push(QueuedReplacement {
                    message: decoded,
                    receipt_handle: receipt_handle.to_string(),
                }),
                Err(error) => {
                    warn!(%error, "Dropping undecodable replacement message");
                    if let Err(error) = self.delete(receipt_handle).await {
                        warn!(%error, "Failed to delete undecodable message");
                    }
                }
            }
        }
        Ok(received)
    }

    pub async fn delete(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .context("Failed to delete replacement message")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_round_trip_through_json() {
        let message = ReplacementMessage {
            region: "us-east-1".to_string(),
            instance_id: "i-123".to_string(),
        };
        let body = serde_json::to_string(&message).unwrap();
        let decoded: ReplacementMessage = serde_json::from_str(&body).unwrap();
        assert_eq!(decoded, message);
    }
}
