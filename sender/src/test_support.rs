//! In-memory SQLite fixtures shared by the dispatcher, reputation and
//! event-ingestion tests. Mirrors `oferchen-arena`'s
//! `Schema::create_table_from_entity` pattern for spinning up a real
//! (if ephemeral) database instead of hand-rolled mocks.
#![cfg(test)]

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, Schema};
use serde_json::json;

use entity::campaign;
use entity::subscriber;

pub async fn setup_db() -> DatabaseConnection {
    let db = Database::connect("sqlite::memory:").await.expect("in-memory sqlite connects");
    let schema = Schema::new(DatabaseBackend::Sqlite);

    for stmt in [
        schema.create_table_from_entity(subscriber::Entity).if_not_exists().to_owned(),
        schema.create_table_from_entity(campaign::Entity).if_not_exists().to_owned(),
        schema.create_table_from_entity(entity::send_record::Entity).if_not_exists().to_owned(),
    ] {
        db.execute(db.get_database_backend().build(&stmt)).await.expect("create table");
    }

    db
}

pub async fn insert_subscriber(db: &DatabaseConnection, email: &str, status: subscriber::SubscriberStatus) -> subscriber::Model {
    subscriber::ActiveModel {
        email: Set(email.to_string()),
        status: Set(status),
        attributes: Set(json!({})),
        created: Set(Utc::now()),
        updated: Set(Utc::now()),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("insert subscriber")
}

pub async fn insert_send_record(
    db: &DatabaseConnection,
    email: &str,
    result: entity::send_record::SendResult,
    datetime: chrono::DateTime<Utc>,
) -> entity::send_record::Model {
    entity::send_record::ActiveModel {
        campaign_id: Set(None),
        subscriber_id: Set(None),
        email: Set(email.to_string()),
        datetime: Set(datetime),
        result: Set(result),
        esp_message_id: Set(None),
        tracking_id: Set(None),
        open_count: Set(0),
        click_count: Set(0),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("insert send_record")
}

pub async fn insert_campaign(db: &DatabaseConnection, text_body: &str) -> campaign::Model {
    campaign::ActiveModel {
        name: Set("welcome".into()),
        utm_name: Set("c1".into()),
        from_name: Set("Acme".into()),
        from_email: Set("hello@acme.test".into()),
        reply_to_name: Set("".into()),
        reply_to_email: Set("".into()),
        subject: Set("Hi".into()),
        html_body: Set("".into()),
        text_body: Set(text_body.into()),
        segment_id: Set(None),
        status: Set(campaign::CampaignStatus::Sending),
        start_date: Set(None),
        end_date: Set(None),
        first_sent: Set(None),
        signature_key: Set(b"0123456789abcdefghij".to_vec()),
        created: Set(Utc::now()),
        updated: Set(Utc::now()),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("insert campaign")
}
