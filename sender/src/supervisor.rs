use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, DatabaseConnection, EntityTrait};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use entity::campaign::{self, CampaignStatus};

use crate::connection::TransportFactory;
use crate::dispatcher::Dispatcher;
use crate::queue::WorkQueue;
use crate::rate_limiter::RateLimiter;
use crate::rate_meter::RateMeter;
use crate::render::RenderedMessage;
use crate::segment::SegmentRegistry;
use crate::shutdown::ShutdownSignal;
use crate::worker::{ErrorEvent, Worker};

struct RunningDispatcher {
    shutdown: ShutdownSignal,
    handle: JoinHandle<Result<bool, sea_orm::DbErr>>,
}

/// Cheaply-clonable handles a `USR1` signal handler can read without
/// taking the supervisor's own `&mut self` loop (§4.8 step 4).
#[derive(Clone)]
pub struct StatsHandle {
    queue: Arc<WorkQueue<(RenderedMessage, i32)>>,
    rate_limiter: Arc<RateLimiter>,
    rate_meter: Arc<RateMeter>,
    dispatcher_count: Arc<AtomicUsize>,
    worker_count: Arc<AtomicUsize>,
}

impl StatsHandle {
    pub async fn snapshot(&self) -> SupervisorStats {
        SupervisorStats {
            queue_len: self.queue.len().await,
            queue_capacity: self.queue.capacity(),
            running_dispatchers: self.dispatcher_count.load(Ordering::Relaxed),
            running_workers: self.worker_count.load(Ordering::Relaxed),
            rate_bucket_capacity: self.rate_limiter.capacity(),
            rate_bucket_tokens: self.rate_limiter.peek().await,
            observed_rate: self.rate_meter.current_rate().await,
        }
    }
}

/// Control loop that owns the worker pool, watches `Campaign::outbox()`,
/// and reacts to signals (C8). One per process.
pub struct Supervisor {
    db: DatabaseConnection,
    queue: Arc<WorkQueue<(RenderedMessage, i32)>>,
    rate_limiter: Arc<RateLimiter>,
    rate_meter: Arc<RateMeter>,
    segments: Arc<SegmentRegistry>,
    transport_factory: Arc<dyn TransportFactory>,
    max_messages_per_connection: u32,
    public_url: String,
    poll_interval: Duration,
    max_concurrent_senders: usize,
    dispatchers: HashMap<i32, RunningDispatcher>,
    workers: Vec<JoinHandle<()>>,
    error_tx: mpsc::UnboundedSender<ErrorEvent>,
    error_rx: mpsc::UnboundedReceiver<ErrorEvent>,
    dispatcher_count: Arc<AtomicUsize>,
    worker_count: Arc<AtomicUsize>,
}

impl Supervisor {
    pub fn new(
        db: DatabaseConnection,
        transport_factory: Arc<dyn TransportFactory>,
        max_messages_per_connection: u32,
        segments: Arc<SegmentRegistry>,
        max_concurrent_senders: usize,
        max_sending_rate: f64,
        public_url: String,
        poll_interval: Duration,
    ) -> Self {
        let queue = Arc::new(WorkQueue::new(2 * max_concurrent_senders));
        let rate_limiter = Arc::new(RateLimiter::new(max_sending_rate, max_sending_rate));
        let rate_meter = Arc::new(RateMeter::new(0.5, 10.0));
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        Supervisor {
            db,
            queue,
            rate_limiter,
            rate_meter,
            segments,
            transport_factory,
            max_messages_per_connection,
            public_url,
            poll_interval,
            max_concurrent_senders,
            dispatchers: HashMap::new(),
            workers: Vec::new(),
            error_tx,
            error_rx,
            dispatcher_count: Arc::new(AtomicUsize::new(0)),
            worker_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn stats_handle(&self) -> StatsHandle {
        StatsHandle {
            queue: self.queue.clone(),
            rate_limiter: self.rate_limiter.clone(),
            rate_meter: self.rate_meter.clone(),
            dispatcher_count: self.dispatcher_count.clone(),
            worker_count: self.worker_count.clone(),
        }
    }

    /// Runs until `global_shutdown` fires, then drains every dispatcher
    /// and worker before returning (§4.8, §5 "Cancellation and
    /// timeouts").
    pub async fn run(&mut self, global_shutdown: ShutdownSignal) {
        self.ensure_worker_pool(&global_shutdown);

        loop {
            if global_shutdown.is_set() {
                info!("supervisor shutting down, signalling all dispatchers");
                for dispatcher in self.dispatchers.values() {
                    dispatcher.shutdown.set();
                }
                break;
            }

            self.ensure_worker_pool(&global_shutdown);

            if let Err(err) = self.watch_campaigns().await {
                error!(%err, "campaign watch failed this tick");
            }

            self.drain_error_channel().await;
            self.reap_finished_dispatchers().await;

            tokio::time::sleep(self.poll_interval).await;
        }

        for (_, dispatcher) in self.dispatchers.drain() {
            let _ = dispatcher.handle.await;
        }
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
    }

    fn ensure_worker_pool(&mut self, global_shutdown: &ShutdownSignal) {
        self.workers.retain(|handle| !handle.is_finished());

        while self.workers.len() < self.max_concurrent_senders {
            let worker = Worker {
                db: self.db.clone(),
                queue: self.queue.clone(),
                rate_limiter: self.rate_limiter.clone(),
                rate_meter: self.rate_meter.clone(),
                transport_factory: self.transport_factory.clone(),
                max_messages_per_connection: self.max_messages_per_connection,
                error_tx: self.error_tx.clone(),
                poll_interval: self.poll_interval,
            };
            let shutdown = global_shutdown.clone();

            self.workers.push(tokio::spawn(async move { worker.run(shutdown).await }));
        }

        self.worker_count.store(self.workers.iter().filter(|h| !h.is_finished()).count(), Ordering::Relaxed);
    }

    async fn watch_campaigns(&mut self) -> Result<(), sea_orm::DbErr> {
        let now = Utc::now();
        let outbox = campaign::Entity::outbox(now).all(&self.db).await?;

        for campaign in outbox {
            match campaign.status {
                CampaignStatus::Sending => {
                    if !self.dispatchers.contains_key(&campaign.id) {
                        self.spawn_dispatcher(campaign);
                    }
                }
                CampaignStatus::Waiting => {
                    if let Some(dispatcher) = self.dispatchers.get(&campaign.id) {
                        dispatcher.shutdown.set();
                    }
                }
                CampaignStatus::Sent | CampaignStatus::Error => {}
            }
        }

        Ok(())
    }

    fn spawn_dispatcher(&mut self, campaign: campaign::Model) {
        let shutdown = ShutdownSignal::new();
        let dispatcher = Dispatcher::new(self.db.clone(), self.queue.clone(), self.segments.clone(), self.public_url.clone(), self.poll_interval);

        let db = self.db.clone();
        let campaign_id = campaign.id;
        let task_shutdown = shutdown.clone();

        let handle = tokio::spawn(async move {
            let finished = dispatcher.run(&campaign, &task_shutdown).await?;

            if finished {
                let first_sent_unset = campaign.first_sent.is_none();
                let mut active: campaign::ActiveModel = campaign.into();
                active.status = Set(CampaignStatus::Sent);
                if first_sent_unset {
                    active.first_sent = Set(Some(Utc::now()));
                }
                active.update(&db).await?;
                info!(campaign_id, "campaign dispatch complete");
            } else {
                info!(campaign_id, "dispatcher stopped early, campaign left Sending for a later resume");
            }

            Ok(finished)
        });

        self.dispatchers.insert(campaign_id, RunningDispatcher { shutdown, handle });
        self.dispatcher_count.store(self.dispatchers.len(), Ordering::Relaxed);
    }

    async fn drain_error_channel(&mut self) {
        while let Ok(campaign_id) = self.error_rx.try_recv() {
            warn!(campaign_id, "sender reported an unexpected error, marking campaign Error");

            if let Err(err) = self.mark_campaign_error(campaign_id).await {
                error!(campaign_id, %err, "failed to mark campaign Error");
            }

            if let Some(dispatcher) = self.dispatchers.get(&campaign_id) {
                dispatcher.shutdown.set();
            }
        }
    }

    async fn mark_campaign_error(&self, campaign_id: i32) -> Result<(), sea_orm::DbErr> {
        let Some(campaign) = campaign::Entity::find_by_id(campaign_id).one(&self.db).await? else {
            return Ok(());
        };

        let mut active: campaign::ActiveModel = campaign.into();
        active.status = Set(CampaignStatus::Error);
        active.update(&self.db).await?;

        Ok(())
    }

    async fn reap_finished_dispatchers(&mut self) {
        let finished: Vec<i32> = self.dispatchers.iter().filter(|(_, d)| d.handle.is_finished()).map(|(id, _)| *id).collect();

        for campaign_id in finished {
            if let Some(dispatcher) = self.dispatchers.remove(&campaign_id) {
                match dispatcher.handle.await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => error!(campaign_id, %err, "dispatcher exited with a database error"),
                    Err(err) => error!(campaign_id, %err, "dispatcher task panicked"),
                }
            }
        }

        self.dispatcher_count.store(self.dispatchers.len(), Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorStats {
    pub queue_len: usize,
    pub queue_capacity: usize,
    pub running_dispatchers: usize,
    pub running_workers: usize,
    pub rate_bucket_capacity: f64,
    pub rate_bucket_tokens: f64,
    pub observed_rate: f64,
}
