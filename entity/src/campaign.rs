use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::Condition;
use serde::{Deserialize, Serialize};

/// Mirrors `nuntius.models.mixins.CampaignStatusType`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "i16", db_type = "SmallInteger")]
pub enum CampaignStatus {
    #[sea_orm(num_value = 0)]
    Waiting,
    #[sea_orm(num_value = 1)]
    Sending,
    #[sea_orm(num_value = 2)]
    Sent,
    #[sea_orm(num_value = 3)]
    Error,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "campaign")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub name: String,
    pub utm_name: String,
    pub from_name: String,
    pub from_email: String,
    pub reply_to_name: String,
    pub reply_to_email: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
    /// Name of the [`Segment`](../sender/segment/trait.Segment.html)
    /// resolved via the sender's segment registry; `None` defaults to
    /// "all subscribers" (see §3 Campaign, §9 design notes).
    pub segment_id: Option<String>,
    pub status: CampaignStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub first_sent: Option<DateTime<Utc>>,
    #[sea_orm(column_type = "Binary(BlobSize::Blob(Some(20)))")]
    pub signature_key: Vec<u8>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::send_record::Entity")]
    SendRecord,
}

impl Related<super::send_record::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SendRecord.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// `From` header per §4.5 step 6: `"{from_name} <{from_email}>"` if a
    /// name is set, else the bare address.
    pub fn from_header(&self) -> String {
        if self.from_name.is_empty() {
            self.from_email.clone()
        } else {
            format!("{} <{}>", self.from_name, self.from_email)
        }
    }

    /// `Reply-To` header per §4.5 step 6, `None` when no reply-to address
    /// is configured.
    pub fn reply_to_header(&self) -> Option<String> {
        if self.reply_to_email.is_empty() {
            return None;
        }

        if self.reply_to_name.is_empty() {
            Some(self.reply_to_email.clone())
        } else {
            Some(format!("{} <{}>", self.reply_to_name, self.reply_to_email))
        }
    }
}

impl Entity {
    /// Mirrors `AbstractCampaignQuerySet.outbox`: campaigns the supervisor
    /// considers active — `status < Sent` and within `[start_date,
    /// end_date]` (either bound may be unset).
    pub fn outbox(now: DateTime<Utc>) -> Select<Entity> {
        Entity::find()
            .filter(Column::Status.lt(CampaignStatus::Sent))
            .filter(
                Condition::any()
                    .add(Column::StartDate.is_null())
                    .add(Column::StartDate.lte(now)),
            )
            .filter(
                Condition::any()
                    .add(Column::EndDate.is_null())
                    .add(Column::EndDate.gte(now)),
            )
    }
}

/// The per-campaign counts the admin surface displays (§7: "campaigns
/// display counts…computed from SendRecord aggregates"). Mirrors the
/// `get_*_count` family on `nuntius.models.email_campaigns.Campaign`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CampaignStats {
    pub sent: u64,
    pub ok: u64,
    pub bounced: u64,
    pub complained: u64,
    pub blocked: u64,
    pub opens: u64,
    pub clicks: u64,
    pub unique_opens: u64,
    pub unique_clicks: u64,
}

impl Model {
    /// Computes [`CampaignStats`] for this campaign from its SendRecord
    /// rows. `sent` counts every record past `Pending`; `opens`/`clicks`
    /// sum the per-record counters, `unique_opens`/`unique_clicks` count
    /// records with at least one hit.
    pub async fn stats<C: sea_orm::ConnectionTrait>(&self, db: &C) -> Result<CampaignStats, DbErr> {
        use super::send_record::{self, SendResult};

        let records = send_record::Entity::find().filter(send_record::Column::CampaignId.eq(self.id)).all(db).await?;

        let mut stats = CampaignStats::default();

        for record in &records {
            if record.result != SendResult::Pending {
                stats.sent += 1;
            }
            match record.result {
                SendResult::Ok => stats.ok += 1,
                SendResult::Bounced => stats.bounced += 1,
                SendResult::Complained => stats.complained += 1,
                SendResult::Blocked => stats.blocked += 1,
                _ => {}
            }

            stats.opens += record.open_count.max(0) as u64;
            stats.clicks += record.click_count.max(0) as u64;
            if record.open_count > 0 {
                stats.unique_opens += 1;
            }
            if record.click_count > 0 {
                stats.unique_clicks += 1;
            }
        }

        Ok(stats)
    }
}
