use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mirrors `nuntius.models.AbstractSubscriber.STATUS_*`.
///
/// Mutated only by the reputation policy ([`crate::send_record`] history
/// scan) or by the external subscriber-facing unsubscribe flow; never by
/// the sender workers directly.
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "i16", db_type = "SmallInteger")]
pub enum SubscriberStatus {
    #[sea_orm(num_value = 1)]
    Subscribed,
    #[sea_orm(num_value = 2)]
    Unsubscribed,
    #[sea_orm(num_value = 3)]
    Bounced,
    #[sea_orm(num_value = 4)]
    Complained,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "subscriber")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub email: String,
    pub status: SubscriberStatus,
    /// Free-form key->string map used as template variables by the
    /// message renderer (§4.5 step 1). Stored as jsonb.
    #[sea_orm(column_type = "Json")]
    pub attributes: Json,
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
    /// The variable context a [`crate::campaign::Model`] template is
    /// rendered against: the attribute map, deserialized to strings.
    ///
    /// Non-string JSON values are stringified rather than dropped, so a
    /// numeric or boolean attribute still substitutes into `{{ name }}`.
    pub fn template_context(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();

        if let Some(map) = self.attributes.as_object() {
            for (k, v) in map {
                let value = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                out.insert(k.clone(), value);
            }
        }

        out.insert("email".to_string(), self.email.clone());
        out
    }
}
