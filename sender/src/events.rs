use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, QuerySelect,
    TransactionTrait,
};
use serde::Deserialize;
use tracing::warn;

use entity::send_record::{self, SendResult};

use crate::reputation::{self, BouncePolicy, ReputationEvent};

/// Normalised webhook payload (§4.10). Provider-specific JSON is
/// translated into this shape before it ever reaches the ingestor —
/// the ingestor itself knows nothing about SES/SNS/SMTP-bounce wire
/// formats. `Deserialize` is derived directly since this normalised
/// shape IS the wire contract the webhook route accepts (§9 non-goal:
/// provider-specific payload schemas are out of scope).
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEvent {
    pub event_type: EventType,
    pub message_id: Option<String>,
    pub recipient: String,
    pub provider: String,
    #[serde(default)]
    pub raw_payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    Delivered,
    Rejected,
    Failed,
    Bounced { is_permanent: bool },
    Complained,
    Unsubscribed,
    Opened,
    Clicked,
}

/// Ingests one normalised webhook event (C10), wrapped in a row-level
/// lock on the target SendRecord so a racing sender-worker transition
/// can't be lost or duplicated (§5 "Webhooks and senders may race").
pub async fn ingest(db: &DatabaseConnection, policy: &BouncePolicy, event: InboundEvent) -> Result<(), sea_orm::DbErr> {
    let txn = db.begin().await?;

    let record = find_or_create_record(&txn, &event).await?;
    apply_send_record_update(&txn, &record, event.event_type).await?;

    txn.commit().await?;

    if let Some(reputation_event) = reputation_event_for(event.event_type) {
        reputation::apply(db, policy, &event.recipient, reputation_event).await?;
    }

    Ok(())
}

fn reputation_event_for(event_type: EventType) -> Option<ReputationEvent> {
    match event_type {
        EventType::Bounced { is_permanent: true } => Some(ReputationEvent::Bounce),
        EventType::Complained => Some(ReputationEvent::Complained),
        EventType::Unsubscribed => Some(ReputationEvent::Unsubscribed),
        _ => None,
    }
}

/// Looks the SendRecord up by `esp_message_id`; if none matches (or no
/// `message_id` was given), creates a synthetic record with
/// `campaign = null` so a late-bouncing address still has history for
/// the reputation policy's scan (§4.10, §9 OQ retained-synthetic-record
/// decision).
async fn find_or_create_record<C: ConnectionTrait>(db: &C, event: &InboundEvent) -> Result<send_record::Model, sea_orm::DbErr> {
    if let Some(message_id) = &event.message_id {
        if let Some(record) = send_record::Entity::find()
            .filter(send_record::Column::EspMessageId.eq(message_id.clone()))
            .lock_exclusive()
            .one(db)
            .await?
        {
            return Ok(record);
        }
    }

    warn!(recipient = event.recipient, provider = event.provider, "webhook event with no matching send_record, synthesizing one");

    let synthetic = send_record::ActiveModel {
        campaign_id: Set(None),
        subscriber_id: Set(None),
        email: Set(event.recipient.clone()),
        datetime: Set(Utc::now()),
        result: Set(SendResult::Unknown),
        esp_message_id: Set(event.message_id.clone()),
        tracking_id: Set(None),
        open_count: Set(0),
        click_count: Set(0),
        ..Default::default()
    };

    synthetic.insert(db).await
}

/// §4.10's event_type -> SendRecord.result mapping. `result` transitions
/// are monotonic per §8 property 2; a record already past the target
/// rank is left untouched (a late `delivered` after a `bounced` must not
/// regress the record back to `Ok`).
async fn apply_send_record_update<C: ConnectionTrait>(db: &C, record: &send_record::Model, event_type: EventType) -> Result<(), sea_orm::DbErr> {
    let mut active: send_record::ActiveModel = record.clone().into();
    let mut dirty = false;

    match event_type {
        EventType::Delivered => set_result_if_advancing(&mut active, record.result, SendResult::Ok, &mut dirty),
        EventType::Rejected => set_result_if_advancing(&mut active, record.result, SendResult::Rejected, &mut dirty),
        EventType::Failed => set_result_if_advancing(&mut active, record.result, SendResult::Error, &mut dirty),
        EventType::Bounced { is_permanent: true } => set_result_if_advancing(&mut active, record.result, SendResult::Bounced, &mut dirty),
        EventType::Bounced { is_permanent: false } => set_result_if_advancing(&mut active, record.result, SendResult::Blocked, &mut dirty),
        EventType::Complained => set_result_if_advancing(&mut active, record.result, SendResult::Complained, &mut dirty),
        EventType::Unsubscribed => set_result_if_advancing(&mut active, record.result, SendResult::Unsubscribed, &mut dirty),
        EventType::Opened => {
            active.open_count = Set(record.open_count + 1);
            dirty = true;
        }
        EventType::Clicked => {
            active.click_count = Set(record.click_count + 1);
            dirty = true;
        }
    }

    if dirty {
        active.update(db).await?;
    }

    Ok(())
}

/// Rank 2 covers every terminal variant (Ok, Rejected, Bounced, ...), so a
/// plain `target.rank() >= current.rank()` check can't by itself stop one
/// terminal value from clobbering another once `current` is already rank
/// 2. But §4.7's diagram carves out one specific terminal->terminal move:
/// `Ok` may still be refined to `Bounced`/`Complained` by a later webhook
/// ("webhooks may still refine them"). Every other rank-2 value is frozen.
fn set_result_if_advancing(active: &mut send_record::ActiveModel, current: SendResult, target: SendResult, dirty: &mut bool) {
    let advances = if current.rank() < 2 {
        target.rank() >= current.rank()
    } else {
        current == SendResult::Ok && matches!(target, SendResult::Bounced | SendResult::Complained)
    };

    if advances {
        active.result = Set(target);
        *dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reputation_event_only_fires_for_hard_bounces_and_explicit_status_events() {
        assert_eq!(reputation_event_for(EventType::Bounced { is_permanent: true }), Some(ReputationEvent::Bounce));
        assert_eq!(reputation_event_for(EventType::Bounced { is_permanent: false }), None);
        assert_eq!(reputation_event_for(EventType::Complained), Some(ReputationEvent::Complained));
        assert_eq!(reputation_event_for(EventType::Unsubscribed), Some(ReputationEvent::Unsubscribed));
        assert_eq!(reputation_event_for(EventType::Opened), None);
        assert_eq!(reputation_event_for(EventType::Delivered), None);
    }

    #[test]
    fn set_result_if_advancing_refuses_to_regress_a_terminal_record() {
        let mut active = send_record::ActiveModel { ..Default::default() };
        let mut dirty = false;

        set_result_if_advancing(&mut active, SendResult::Bounced, SendResult::Ok, &mut dirty);
        assert!(!dirty);

        set_result_if_advancing(&mut active, SendResult::Unknown, SendResult::Bounced, &mut dirty);
        assert!(dirty);
    }

    /// §4.7's diagram carve-out: a delivered (`Ok`) record can still be
    /// refined by a later hard bounce or complaint webhook.
    #[test]
    fn set_result_if_advancing_refines_ok_into_bounced_or_complained() {
        let mut active = send_record::ActiveModel { ..Default::default() };
        let mut dirty = false;

        set_result_if_advancing(&mut active, SendResult::Ok, SendResult::Bounced, &mut dirty);
        assert!(dirty);

        dirty = false;
        set_result_if_advancing(&mut active, SendResult::Ok, SendResult::Complained, &mut dirty);
        assert!(dirty);

        // But an `Ok` record never regresses to a lower-ranked or
        // differently-terminal result outside that carve-out.
        dirty = false;
        set_result_if_advancing(&mut active, SendResult::Ok, SendResult::Rejected, &mut dirty);
        assert!(!dirty);
    }

    use crate::test_support::{insert_campaign, insert_subscriber, setup_db};

    fn delivered_event(message_id: &str, recipient: &str) -> InboundEvent {
        InboundEvent {
            event_type: EventType::Delivered,
            message_id: Some(message_id.into()),
            recipient: recipient.into(),
            provider: "smtp".into(),
            raw_payload: serde_json::json!({}),
        }
    }

    /// A `delivered` event against a matching SendRecord flips it to
    /// `Ok` and never touches subscriber reputation.
    #[tokio::test]
    async fn ingest_advances_a_matching_send_record_to_ok() {
        let db = setup_db().await;
        let subscriber = insert_subscriber(&db, "a@x", entity::subscriber::SubscriberStatus::Subscribed).await;
        let campaign = insert_campaign(&db, "Hello").await;

        let record = send_record::ActiveModel {
            campaign_id: Set(Some(campaign.id)),
            subscriber_id: Set(Some(subscriber.id)),
            email: Set("a@x".into()),
            datetime: Set(Utc::now()),
            result: Set(SendResult::Unknown),
            esp_message_id: Set(Some("msg-1".into())),
            tracking_id: Set(None),
            open_count: Set(0),
            click_count: Set(0),
            ..Default::default()
        }
        .insert(&db)
        .await
        .unwrap();

        ingest(&db, &BouncePolicy::default(), delivered_event("msg-1", "a@x")).await.unwrap();

        let updated = send_record::Entity::find_by_id(record.id).one(&db).await.unwrap().unwrap();
        assert_eq!(updated.result, SendResult::Ok);

        let subscriber = entity::subscriber::Entity::find_by_id(subscriber.id).one(&db).await.unwrap().unwrap();
        assert_eq!(subscriber.status, entity::subscriber::SubscriberStatus::Subscribed);
    }

    /// An unmatched `message_id` synthesizes a SendRecord rather than
    /// erroring, so a late bounce for a never-tracked address still
    /// leaves history for the reputation policy.
    #[tokio::test]
    async fn ingest_synthesizes_a_record_when_no_send_record_matches() {
        let db = setup_db().await;

        let event = InboundEvent {
            event_type: EventType::Bounced { is_permanent: true },
            message_id: Some("unknown-msg".into()),
            recipient: "ghost@x".into(),
            provider: "smtp".into(),
            raw_payload: serde_json::json!({}),
        };

        ingest(&db, &BouncePolicy::default(), event).await.unwrap();

        let records = send_record::Entity::find().filter(send_record::Column::Email.eq("ghost@x")).all(&db).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].result, SendResult::Bounced);
        assert_eq!(records[0].campaign_id, None);
    }

    /// A permanent bounce event triggers the reputation cascade end to
    /// end: first contact with no healthy history bounces the subscriber.
    #[tokio::test]
    async fn ingest_triggers_reputation_cascade_for_permanent_bounces() {
        let db = setup_db().await;
        insert_subscriber(&db, "a@x", entity::subscriber::SubscriberStatus::Subscribed).await;

        let event = InboundEvent {
            event_type: EventType::Bounced { is_permanent: true },
            message_id: None,
            recipient: "a@x".into(),
            provider: "smtp".into(),
            raw_payload: serde_json::json!({}),
        };

        ingest(&db, &BouncePolicy::default(), event).await.unwrap();

        let subscriber = entity::subscriber::Entity::find()
            .filter(entity::subscriber::Column::Email.eq("a@x"))
            .one(&db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(subscriber.status, entity::subscriber::SubscriberStatus::Bounced);
    }

    /// §8 property 2: a late `delivered` after a terminal `bounced`
    /// must not regress the record back to `Ok`.
    #[tokio::test]
    async fn ingest_never_regresses_a_terminal_record() {
        let db = setup_db().await;

        let record = send_record::ActiveModel {
            campaign_id: Set(None),
            subscriber_id: Set(None),
            email: Set("a@x".into()),
            datetime: Set(Utc::now()),
            result: Set(SendResult::Bounced),
            esp_message_id: Set(Some("msg-2".into())),
            tracking_id: Set(None),
            open_count: Set(0),
            click_count: Set(0),
            ..Default::default()
        }
        .insert(&db)
        .await
        .unwrap();

        ingest(&db, &BouncePolicy::default(), delivered_event("msg-2", "a@x")).await.unwrap();

        let updated = send_record::Entity::find_by_id(record.id).one(&db).await.unwrap().unwrap();
        assert_eq!(updated.result, SendResult::Bounced);
    }
}
