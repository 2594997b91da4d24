use std::sync::Arc;
use std::time::Duration;

use sea_orm::{ActiveModelTrait, ActiveValue::Set, DatabaseConnection, EntityTrait};
use tokio::sync::mpsc;
use tracing::{error, warn};

use entity::send_record::{self, SendResult};

use crate::connection::{self, ConnectionManager, SendOutcome, TransportFactory};
use crate::queue::WorkQueue;
use crate::rate_limiter::RateLimiter;
use crate::rate_meter::RateMeter;
use crate::render::RenderedMessage;
use crate::shutdown::ShutdownSignal;

/// A send-record id published to the supervisor when a worker hits an
/// unexpected, non-recipient-specific error (§4.7 "Error channel").
pub type ErrorEvent = i32;

/// Dequeues, sends, and records the outcome against the SendRecord
/// (C7). Workers share the queue, rate limiter, rate meter and
/// transport factory, but each owns its own [`ConnectionManager`] —
/// ordering between workers is unspecified (§5), connections are not
/// (§5 "Transport connections: not shared; each sender owns one").
pub struct Worker {
    pub db: DatabaseConnection,
    pub queue: Arc<WorkQueue<(RenderedMessage, i32)>>,
    pub rate_limiter: Arc<RateLimiter>,
    pub rate_meter: Arc<RateMeter>,
    pub transport_factory: Arc<dyn TransportFactory>,
    pub max_messages_per_connection: u32,
    pub error_tx: mpsc::UnboundedSender<ErrorEvent>,
    pub poll_interval: Duration,
}

impl Worker {
    /// Runs until the queue is drained and `shutdown` has fired.
    pub async fn run(&self, shutdown: ShutdownSignal) {
        let mut connection = ConnectionManager::new(self.transport_factory.clone(), self.max_messages_per_connection);

        loop {
            let Some((message, record_id)) = self.queue.get(self.poll_interval, &shutdown).await else {
                break;
            };

            self.rate_limiter.take(1.0).await;
            self.rate_meter.count_up(1.0).await;

            if let Err(err) = self.process(&mut connection, record_id, &message, &shutdown).await {
                error!(record_id, %err, "failed to persist send outcome");
            }
        }

        connection.close();
    }

    async fn process(
        &self,
        connection: &mut ConnectionManager,
        record_id: i32,
        message: &RenderedMessage,
        shutdown: &ShutdownSignal,
    ) -> Result<(), sea_orm::DbErr> {
        match connection.send(message, shutdown).await {
            Ok(SendOutcome::Accepted { esp_message_id }) => {
                self.transition(record_id, SendResult::Unknown, esp_message_id).await
            }
            Ok(SendOutcome::Rejected(reason)) => {
                warn!(record_id, reason, "message rejected by transport");
                self.transition(record_id, SendResult::Rejected, None).await
            }
            Ok(SendOutcome::Blocked(reason)) => {
                warn!(record_id, reason, "recipient refused by transport");
                self.transition(record_id, SendResult::Blocked, None).await
            }
            Err(err) => {
                error!(record_id, %err, "unexpected sender error, publishing to error channel");
                self.publish_error(record_id).await
            }
        }
    }

    /// Applies a terminal (non-webhook) transition per §4.7's state
    /// table. A record the dispatcher left non-Pending (already
    /// resolved by a race with a webhook, say) is left untouched.
    async fn transition(&self, record_id: i32, result: SendResult, esp_message_id: Option<String>) -> Result<(), sea_orm::DbErr> {
        let Some(record) = send_record::Entity::find_by_id(record_id).one(&self.db).await? else {
            return Ok(());
        };

        if !record.result.is_pending() {
            return Ok(());
        }

        let mut active: send_record::ActiveModel = record.into();
        active.result = Set(result);
        if esp_message_id.is_some() {
            active.esp_message_id = Set(esp_message_id);
        }
        active.update(&self.db).await?;

        Ok(())
    }

    async fn publish_error(&self, record_id: i32) -> Result<(), sea_orm::DbErr> {
        let record = send_record::Entity::find_by_id(record_id).one(&self.db).await?;

        if let Some(record) = record.and_then(|r| r.campaign_id) {
            let _ = self.error_tx.send(record);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use connection::{Transport, TransportError};

    struct AlwaysAccepts;

    #[async_trait]
    impl Transport for AlwaysAccepts {
        async fn send(&self, _message: &RenderedMessage) -> Result<SendOutcome, TransportError> {
            Ok(SendOutcome::Accepted { esp_message_id: Some("id-1".into()) })
        }
    }

    struct AlwaysAcceptsFactory;

    #[async_trait]
    impl TransportFactory for AlwaysAcceptsFactory {
        async fn open(&self) -> Result<Box<dyn Transport>, TransportError> {
            Ok(Box::new(AlwaysAccepts))
        }
    }

    fn sample_message() -> RenderedMessage {
        RenderedMessage {
            from_header: "hello@acme.test".into(),
            reply_to_header: None,
            to: "a@x".into(),
            subject: "Hi".into(),
            html_body: None,
            text_body: Some("Hello".into()),
        }
    }

    #[test]
    fn error_event_is_a_plain_campaign_id() {
        let _: ErrorEvent = 1;
    }

    #[tokio::test]
    async fn connection_manager_returns_accepted_for_a_healthy_transport() {
        let mut connection = ConnectionManager::new(Arc::new(AlwaysAcceptsFactory), 500);
        let shutdown = ShutdownSignal::new();

        let outcome = connection.send(&sample_message(), &shutdown).await.unwrap();
        assert!(matches!(outcome, SendOutcome::Accepted { esp_message_id: Some(_) }));
    }

    use crate::test_support::{insert_campaign, insert_subscriber, setup_db};

    fn new_worker(db: DatabaseConnection) -> (Worker, mpsc::UnboundedReceiver<ErrorEvent>) {
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            db,
            queue: Arc::new(WorkQueue::new(4)),
            rate_limiter: Arc::new(RateLimiter::new(1000.0, 1000.0)),
            rate_meter: Arc::new(RateMeter::new(0.5, 10.0)),
            transport_factory: Arc::new(AlwaysAcceptsFactory),
            max_messages_per_connection: 500,
            error_tx,
            poll_interval: Duration::from_millis(20),
        };
        (worker, error_rx)
    }

    /// A Pending record accepted by the transport transitions to
    /// `Unknown` with the transport-assigned `esp_message_id` recorded.
    #[tokio::test]
    async fn process_transitions_a_pending_record_to_unknown_on_acceptance() {
        let db = setup_db().await;
        let subscriber = insert_subscriber(&db, "a@x", entity::subscriber::SubscriberStatus::Subscribed).await;
        let campaign = insert_campaign(&db, "Hello").await;

        let record = send_record::ActiveModel {
            campaign_id: Set(Some(campaign.id)),
            subscriber_id: Set(Some(subscriber.id)),
            email: Set("a@x".into()),
            datetime: Set(chrono::Utc::now()),
            result: Set(SendResult::Pending),
            esp_message_id: Set(None),
            tracking_id: Set(None),
            open_count: Set(0),
            click_count: Set(0),
            ..Default::default()
        }
        .insert(&db)
        .await
        .unwrap();

        let (worker, _error_rx) = new_worker(db.clone());
        let mut connection = ConnectionManager::new(worker.transport_factory.clone(), worker.max_messages_per_connection);
        let shutdown = ShutdownSignal::new();

        worker.process(&mut connection, record.id, &sample_message(), &shutdown).await.unwrap();

        let updated = send_record::Entity::find_by_id(record.id).one(&db).await.unwrap().unwrap();
        assert_eq!(updated.result, SendResult::Unknown);
        assert_eq!(updated.esp_message_id, Some("id-1".into()));
    }

    /// A record a webhook already resolved (e.g. a race that landed
    /// first) is left untouched by a later sender-side transition.
    #[tokio::test]
    async fn process_leaves_an_already_resolved_record_untouched() {
        let db = setup_db().await;

        let record = send_record::ActiveModel {
            campaign_id: Set(None),
            subscriber_id: Set(None),
            email: Set("a@x".into()),
            datetime: Set(chrono::Utc::now()),
            result: Set(SendResult::Bounced),
            esp_message_id: Set(None),
            tracking_id: Set(None),
            open_count: Set(0),
            click_count: Set(0),
            ..Default::default()
        }
        .insert(&db)
        .await
        .unwrap();

        let (worker, _error_rx) = new_worker(db.clone());
        let mut connection = ConnectionManager::new(worker.transport_factory.clone(), worker.max_messages_per_connection);
        let shutdown = ShutdownSignal::new();

        worker.process(&mut connection, record.id, &sample_message(), &shutdown).await.unwrap();

        let updated = send_record::Entity::find_by_id(record.id).one(&db).await.unwrap().unwrap();
        assert_eq!(updated.result, SendResult::Bounced);
        assert_eq!(updated.esp_message_id, None);
    }
}
