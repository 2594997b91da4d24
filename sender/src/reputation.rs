use chrono::{Duration as ChronoDuration, Utc};
use sea_orm::{ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};

use entity::send_record::{self, SendResult};
use entity::subscriber::{self, SubscriberStatus};

/// The event kinds the reputation policy reacts to (§4.11). Distinct
/// from [`SendResult`]: this is the policy's own input vocabulary, not
/// the SendRecord state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationEvent {
    Bounce,
    Complained,
    Unsubscribed,
}

#[derive(Debug, Clone, Copy)]
pub struct BouncePolicy {
    pub consecutive: u32,
    pub duration_days: i64,
    pub limit: u32,
}

impl Default for BouncePolicy {
    fn default() -> Self {
        BouncePolicy { consecutive: 1, duration_days: 7, limit: 3 }
    }
}

/// Applies §4.11 for a single `(email, event)` pair. `Complained`/
/// `Unsubscribed` set subscriber status directly; `Bounce` runs the
/// ordered cascade over SendRecord history.
pub async fn apply(db: &DatabaseConnection, policy: &BouncePolicy, email: &str, event: ReputationEvent) -> Result<(), sea_orm::DbErr> {
    match event {
        ReputationEvent::Complained => set_status(db, email, SubscriberStatus::Complained).await,
        ReputationEvent::Unsubscribed => set_status(db, email, SubscriberStatus::Unsubscribed).await,
        ReputationEvent::Bounce => apply_bounce_cascade(db, policy, email).await,
    }
}

async fn set_status(db: &DatabaseConnection, email: &str, status: SubscriberStatus) -> Result<(), sea_orm::DbErr> {
    let Some(subscriber) = subscriber::Entity::find().filter(subscriber::Column::Email.eq(email)).one(db).await? else {
        return Ok(());
    };

    let mut active: subscriber::ActiveModel = subscriber.into();
    active.status = Set(status);
    active.update(db).await?;

    Ok(())
}

/// §4.11's ordered cascade:
///
/// 1. No `{Ok, Unknown}` record anywhere -> Bounced (fail closed on
///    first contact).
/// 2. A `{Ok, Unknown}` within `duration_days` AND bounce count within
///    `duration_days` <= `limit` -> unchanged.
/// 3. Among the most recent `consecutive + 1` records, at least one
///    `{Ok, Unknown}` -> unchanged.
/// 4. Otherwise -> Bounced.
async fn apply_bounce_cascade(db: &DatabaseConnection, policy: &BouncePolicy, email: &str) -> Result<(), sea_orm::DbErr> {
    let history = send_record::Entity::find()
        .filter(send_record::Column::Email.eq(email))
        .order_by_desc(send_record::Column::Datetime)
        .all(db)
        .await?;

    let is_healthy = |r: &send_record::Model| matches!(r.result, SendResult::Ok | SendResult::Unknown);

    if !history.iter().any(is_healthy) {
        return set_status(db, email, SubscriberStatus::Bounced).await;
    }

    let cutoff = Utc::now() - ChronoDuration::days(policy.duration_days);

    let recent_healthy = history.iter().any(|r| r.datetime >= cutoff && is_healthy(r));
    let recent_bounce_count = history.iter().filter(|r| r.datetime >= cutoff && r.result == SendResult::Bounced).count() as u32;

    if recent_healthy && recent_bounce_count <= policy.limit {
        return Ok(());
    }

    let window = (policy.consecutive as usize) + 1;
    if history.iter().take(window).any(is_healthy) {
        return Ok(());
    }

    set_status(db, email, SubscriberStatus::Bounced).await
}
