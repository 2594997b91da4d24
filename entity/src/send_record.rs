use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Mirrors `nuntius.models.email_campaigns.CampaignSentStatusType`.
///
/// The two-letter `db_type` values (`P`, `?`, `RE`, `OK`, ...) match the
/// original's `CHAR(2)` column so a direct data migration would not need
/// to remap values.
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(Some(2))")]
pub enum SendResult {
    #[sea_orm(string_value = "P")]
    Pending,
    #[sea_orm(string_value = "?")]
    Unknown,
    #[sea_orm(string_value = "RE")]
    Rejected,
    #[sea_orm(string_value = "OK")]
    Ok,
    #[sea_orm(string_value = "BC")]
    Bounced,
    #[sea_orm(string_value = "C")]
    Complained,
    #[sea_orm(string_value = "U")]
    Unsubscribed,
    #[sea_orm(string_value = "BL")]
    Blocked,
    #[sea_orm(string_value = "E")]
    Error,
}

impl SendResult {
    /// Position in the partial order of §8 property 2:
    /// `{Pending} < {Unknown,Blocked} < {everything else}`.
    ///
    /// Used by callers that want to assert a transition never moves
    /// backwards; the state machine itself (§4.7) never calls this, it
    /// only ever matches on concrete variants.
    pub fn rank(self) -> u8 {
        match self {
            SendResult::Pending => 0,
            SendResult::Unknown | SendResult::Blocked => 1,
            _ => 2,
        }
    }

    pub fn is_pending(self) -> bool {
        matches!(self, SendResult::Pending)
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "send_record")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub campaign_id: Option<i32>,
    pub subscriber_id: Option<i32>,
    pub email: String,
    pub datetime: DateTime<Utc>,
    pub result: SendResult,
    #[sea_orm(unique)]
    pub esp_message_id: Option<String>,
    #[sea_orm(unique)]
    pub tracking_id: Option<String>,
    pub open_count: i32,
    pub click_count: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::campaign::Entity",
        from = "Column::CampaignId",
        to = "super::campaign::Column::Id",
        on_update = "NoAction",
        on_delete = "Cascade"
    )]
    Campaign,
    #[sea_orm(
        belongs_to = "super::subscriber::Entity",
        from = "Column::SubscriberId",
        to = "super::subscriber::Column::Id",
        on_update = "NoAction",
        on_delete = "SetNull"
    )]
    Subscriber,
}

impl Related<super::campaign::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Campaign.def()
    }
}

impl Related<super::subscriber::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Subscriber.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
