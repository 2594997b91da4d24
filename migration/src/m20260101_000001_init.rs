use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();

        let statement = r#"
        create table "subscriber" (
            "id" serial primary key,
            "email" varchar(255) not null,
            "status" smallint not null,
            "attributes" jsonb not null default '{}',
            "created" timestamptz(0) not null default now(),
            "updated" timestamptz(0) not null default now()
        );

        alter table
            "subscriber"
        add
            constraint "subscriber_email_unique" unique ("email");

        create table "campaign" (
            "id" serial primary key,
            "name" varchar(255) not null,
            "utm_name" varchar(255) not null default '',
            "from_name" varchar(255) not null default '',
            "from_email" varchar(255) not null,
            "reply_to_name" varchar(255) not null default '',
            "reply_to_email" varchar(255) not null default '',
            "subject" varchar(255) not null default '',
            "html_body" text not null default '',
            "text_body" text not null default '',
            "segment_id" varchar(255) null,
            "status" smallint not null default 0,
            "start_date" timestamptz(0) null,
            "end_date" timestamptz(0) null,
            "first_sent" timestamptz(0) null,
            "signature_key" bytea not null,
            "created" timestamptz(0) not null default now(),
            "updated" timestamptz(0) not null default now()
        );

        create table "send_record" (
            "id" serial primary key,
            "campaign_id" int null references "campaign" ("id") on delete cascade,
            "subscriber_id" int null references "subscriber" ("id") on delete set null,
            "email" varchar(255) not null,
            "datetime" timestamptz(0) not null default now(),
            "result" varchar(2) not null default 'P',
            "esp_message_id" varchar(255) null,
            "tracking_id" varchar(12) null,
            "open_count" int not null default 0,
            "click_count" int not null default 0
        );

        alter table
            "send_record"
        add
            constraint "send_record_campaign_subscriber_unique" unique ("campaign_id", "subscriber_id");

        alter table
            "send_record"
        add
            constraint "send_record_esp_message_id_unique" unique ("esp_message_id");

        alter table
            "send_record"
        add
            constraint "send_record_tracking_id_unique" unique ("tracking_id");

        create index "send_record_email_datetime_idx" on "send_record" ("email", "datetime");

        create index "send_record_subscriber_datetime_idx" on "send_record" ("subscriber_id", "datetime");
        "#;

        db.execute_unprepared(statement).await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Alias::new("send_record")).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Alias::new("campaign")).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Alias::new("subscriber")).to_owned())
            .await?;

        Ok(())
    }
}
