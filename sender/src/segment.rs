use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use entity::subscriber;
use sea_orm::{DatabaseConnection, EntityTrait, PaginatorTrait, QueryOrder};

/// A named, enumerable subset of subscribers (§3 Segment, §9 design
/// notes). `fetch_page` must be a lazy, restartable sequence — the
/// dispatcher (C6) pages through it rather than materialising the whole
/// segment into memory up front, so a large segment never costs more
/// than one page of rows at a time.
#[async_trait]
pub trait Segment: Send + Sync {
    async fn fetch_page(&self, db: &DatabaseConnection, page: u64, page_size: u64) -> Result<Vec<subscriber::Model>, sea_orm::DbErr>;
    async fn count(&self, db: &DatabaseConnection) -> Result<u64, sea_orm::DbErr>;
}

/// Default segment a campaign with no `segment_id` resolves to: every
/// subscriber row, regardless of status (eligibility by `Subscribed`
/// status is filtered by the dispatcher, not the segment, per §4.6
/// step 3b).
pub struct AllSubscribers;

#[async_trait]
impl Segment for AllSubscribers {
    async fn fetch_page(&self, db: &DatabaseConnection, page: u64, page_size: u64) -> Result<Vec<subscriber::Model>, sea_orm::DbErr> {
        subscriber::Entity::find().order_by_asc(subscriber::Column::Id).paginate(db, page_size).fetch_page(page).await
    }

    async fn count(&self, db: &DatabaseConnection) -> Result<u64, sea_orm::DbErr> {
        subscriber::Entity::find().count(db).await
    }
}

/// Resolves `campaign.segment_id` to a [`Segment`] implementation.
/// Stands in for the configurable `NUNTIUS_SUBSCRIBER_MODEL` content-type
/// lookup in the source (§9): here a plain name -> constructor map
/// populated at boot, rather than a dynamic class path.
pub struct SegmentRegistry {
    segments: HashMap<String, Arc<dyn Segment>>,
}

impl SegmentRegistry {
    pub fn new() -> Self {
        SegmentRegistry { segments: HashMap::new() }
    }

    pub fn register(&mut self, name: impl Into<String>, segment: Arc<dyn Segment>) {
        self.segments.insert(name.into(), segment);
    }

    pub fn resolve(&self, segment_id: Option<&str>) -> Arc<dyn Segment> {
        match segment_id.and_then(|name| self.segments.get(name)) {
            Some(segment) => segment.clone(),
            None => Arc::new(AllSubscribers),
        }
    }
}

impl Default for SegmentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
