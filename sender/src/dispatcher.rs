use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use tracing::{info, warn};

use entity::campaign;
use entity::send_record::{self, SendResult};

use crate::queue::WorkQueue;
use crate::render;
use crate::segment::SegmentRegistry;
use crate::shutdown::ShutdownSignal;

const TRACKING_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
const TRACKING_ID_LEN: usize = 12;

/// Rows fetched per segment page (§3/§4.6 step 2: the segment is walked
/// page by page rather than materialised into memory up front).
const SEGMENT_PAGE_SIZE: u64 = 500;

fn random_tracking_id() -> String {
    let mut rng = rand::thread_rng();
    (0..TRACKING_ID_LEN)
        .map(|_| TRACKING_ID_ALPHABET[rng.gen_range(0..TRACKING_ID_ALPHABET.len())] as char)
        .collect()
}

/// One instance per Sending campaign (C6). Walks the campaign's segment,
/// skipping subscribers already resolved by a prior run, rendering and
/// enqueuing the rest.
pub struct Dispatcher {
    db: DatabaseConnection,
    queue: Arc<WorkQueue<(render::RenderedMessage, i32)>>,
    segments: Arc<SegmentRegistry>,
    public_url: String,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        db: DatabaseConnection,
        queue: Arc<WorkQueue<(render::RenderedMessage, i32)>>,
        segments: Arc<SegmentRegistry>,
        public_url: String,
        poll_interval: Duration,
    ) -> Self {
        Dispatcher { db, queue, segments, public_url, poll_interval }
    }

    /// Runs the campaign to completion or until `shutdown` fires.
    /// Returns `true` if it ran out of subscribers cleanly (the caller
    /// then marks the campaign Sent), `false` if it unwound early.
    pub async fn run(&self, campaign: &campaign::Model, shutdown: &ShutdownSignal) -> Result<bool, sea_orm::DbErr> {
        let segment = self.segments.resolve(campaign.segment_id.as_deref());

        let resolved: HashSet<i32> = send_record::Entity::find()
            .filter(send_record::Column::CampaignId.eq(campaign.id))
            .filter(send_record::Column::Result.ne(SendResult::Pending))
            .all(&self.db)
            .await?
            .into_iter()
            .filter_map(|r| r.subscriber_id)
            .collect();

        let mut page = 0u64;
        loop {
            if shutdown.is_set() {
                info!(campaign_id = campaign.id, "dispatcher stopping early on shutdown signal");
                return Ok(false);
            }

            let subscribers = segment.fetch_page(&self.db, page, SEGMENT_PAGE_SIZE).await?;
            if subscribers.is_empty() {
                break;
            }

            for subscriber in &subscribers {
                if shutdown.is_set() {
                    info!(campaign_id = campaign.id, "dispatcher stopping early on shutdown signal");
                    return Ok(false);
                }

                if resolved.contains(&subscriber.id) {
                    continue;
                }

                if subscriber.status != entity::subscriber::SubscriberStatus::Subscribed {
                    continue;
                }

                let record = match self.get_or_create_record(campaign.id, subscriber).await? {
                    Some(record) => record,
                    None => continue,
                };

                let rendered = render::render(campaign, subscriber, record.tracking_id.as_deref().unwrap_or_default(), &self.public_url);

                if self.queue.put((rendered, record.id), self.poll_interval, shutdown).await.is_err() {
                    info!(campaign_id = campaign.id, "dispatcher stopping: shutdown fired while back-pressured");
                    return Ok(false);
                }
            }

            page += 1;
        }

        Ok(true)
    }

    /// Atomically gets or creates the `(campaign, subscriber)` SendRecord
    /// (§4.6 step 3c). Returns `None` if a record already exists and is
    /// non-Pending (nothing left to do for this subscriber).
    async fn get_or_create_record(
        &self,
        campaign_id: i32,
        subscriber: &entity::subscriber::Model,
    ) -> Result<Option<send_record::Model>, sea_orm::DbErr> {
        let existing = send_record::Entity::find()
            .filter(send_record::Column::CampaignId.eq(campaign_id))
            .filter(send_record::Column::SubscriberId.eq(subscriber.id))
            .one(&self.db)
            .await?;

        if let Some(record) = existing {
            return if record.result.is_pending() { Ok(Some(record)) } else { Ok(None) };
        }

        let new_record = send_record::ActiveModel {
            campaign_id: Set(Some(campaign_id)),
            subscriber_id: Set(Some(subscriber.id)),
            email: Set(subscriber.email.clone()),
            datetime: Set(Utc::now()),
            result: Set(SendResult::Pending),
            esp_message_id: Set(None),
            tracking_id: Set(Some(random_tracking_id())),
            open_count: Set(0),
            click_count: Set(0),
            ..Default::default()
        };

        match new_record.insert(&self.db).await {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                // Could be a lost get-or-create race with another dispatcher
                // run, or a genuine DB error; only the former has a row to
                // re-fetch, so an empty re-fetch means it's the latter and
                // the original error is the one worth propagating.
                let record = send_record::Entity::find()
                    .filter(send_record::Column::CampaignId.eq(campaign_id))
                    .filter(send_record::Column::SubscriberId.eq(subscriber.id))
                    .one(&self.db)
                    .await?;

                match record {
                    Some(record) => {
                        warn!(campaign_id, subscriber_id = subscriber.id, "send_record insert race, re-fetching");
                        Ok(record.result.is_pending().then_some(record))
                    }
                    None => Err(err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{ActiveModelTrait, ActiveValue::Set, EntityTrait};

    use crate::test_support::{insert_campaign, insert_subscriber, setup_db};

    fn new_dispatcher(db: DatabaseConnection, queue: Arc<WorkQueue<(render::RenderedMessage, i32)>>) -> Dispatcher {
        Dispatcher::new(db, queue, Arc::new(SegmentRegistry::new()), "https://public.test".into(), Duration::from_millis(20))
    }

    #[test]
    fn random_tracking_id_is_twelve_url_safe_characters() {
        let id = random_tracking_id();
        assert_eq!(id.len(), TRACKING_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    /// S1 — basic send: two Subscribed subscribers each get exactly one
    /// rendered, per-recipient message and a Pending SendRecord.
    #[tokio::test]
    async fn basic_send_enqueues_one_message_per_subscriber_s1() {
        let db = setup_db().await;
        insert_subscriber(&db, "a@x", entity::subscriber::SubscriberStatus::Subscribed).await;
        insert_subscriber(&db, "b@x", entity::subscriber::SubscriberStatus::Subscribed).await;
        let campaign = insert_campaign(&db, "Hello {{ email }}").await;

        let queue = Arc::new(WorkQueue::new(4));
        let dispatcher = new_dispatcher(db.clone(), queue.clone());
        let shutdown = ShutdownSignal::new();

        let finished = dispatcher.run(&campaign, &shutdown).await.unwrap();
        assert!(finished);

        let mut bodies = Vec::new();
        for _ in 0..2 {
            let (message, _record_id) = queue.get(Duration::from_millis(20), &shutdown).await.expect("message enqueued");
            bodies.push(message.text_body.unwrap());
        }
        bodies.sort();
        assert_eq!(bodies, vec!["Hello a@x".to_string(), "Hello b@x".to_string()]);

        let records = send_record::Entity::find().all(&db).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.result.is_pending()));
    }

    /// S2 — skip ineligible subscribers: only the Subscribed one gets a
    /// SendRecord; Unsubscribed/Bounced/Complained are skipped entirely.
    #[tokio::test]
    async fn skips_non_subscribed_subscribers_s2() {
        let db = setup_db().await;
        insert_subscriber(&db, "a@x", entity::subscriber::SubscriberStatus::Subscribed).await;
        insert_subscriber(&db, "b@x", entity::subscriber::SubscriberStatus::Unsubscribed).await;
        insert_subscriber(&db, "c@x", entity::subscriber::SubscriberStatus::Bounced).await;
        insert_subscriber(&db, "d@x", entity::subscriber::SubscriberStatus::Complained).await;
        let campaign = insert_campaign(&db, "Hello {{ email }}").await;

        let queue = Arc::new(WorkQueue::new(4));
        let dispatcher = new_dispatcher(db.clone(), queue.clone());
        let shutdown = ShutdownSignal::new();

        dispatcher.run(&campaign, &shutdown).await.unwrap();

        let records = send_record::Entity::find().all(&db).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].email, "a@x");
    }

    /// S3 — idempotent resend: once every SendRecord for a campaign is
    /// non-Pending, a second dispatcher run enqueues nothing more.
    #[tokio::test]
    async fn idempotent_resend_enqueues_nothing_once_resolved_s3() {
        let db = setup_db().await;
        insert_subscriber(&db, "a@x", entity::subscriber::SubscriberStatus::Subscribed).await;
        let campaign = insert_campaign(&db, "Hello {{ email }}").await;

        let queue = Arc::new(WorkQueue::new(4));
        let dispatcher = new_dispatcher(db.clone(), queue.clone());
        let shutdown = ShutdownSignal::new();

        dispatcher.run(&campaign, &shutdown).await.unwrap();
        let (_, record_id) = queue.get(Duration::from_millis(20), &shutdown).await.expect("first run enqueues one message");

        let record = send_record::Entity::find_by_id(record_id).one(&db).await.unwrap().unwrap();
        let mut active: send_record::ActiveModel = record.into();
        active.result = Set(SendResult::Unknown);
        active.update(&db).await.unwrap();

        let finished = dispatcher.run(&campaign, &shutdown).await.unwrap();
        assert!(finished);
        assert_eq!(queue.len().await, 0);

        let records = send_record::Entity::find().all(&db).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    /// §8 property 1: at most one SendRecord per (campaign, subscriber)
    /// even if `get_or_create_record` is asked twice for the same pair.
    #[tokio::test]
    async fn get_or_create_record_is_idempotent_per_subscriber() {
        let db = setup_db().await;
        let subscriber = insert_subscriber(&db, "a@x", entity::subscriber::SubscriberStatus::Subscribed).await;
        let campaign = insert_campaign(&db, "Hello {{ email }}").await;

        let queue = Arc::new(WorkQueue::new(4));
        let dispatcher = new_dispatcher(db.clone(), queue);

        let first = dispatcher.get_or_create_record(campaign.id, &subscriber).await.unwrap();
        let second = dispatcher.get_or_create_record(campaign.id, &subscriber).await.unwrap();

        assert_eq!(first.unwrap().id, second.unwrap().id);

        let records = send_record::Entity::find().all(&db).await.unwrap();
        assert_eq!(records.len(), 1);
    }
}
