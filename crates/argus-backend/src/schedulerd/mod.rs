//! Check scheduling: per-check timers with leadership rebalance.
//!
//! Every check configuration owns one scheduler task on exactly one
//! backend member. Ownership is leader-per-check: a stable hash of
//! `(namespace, name)` over the sorted member list picks the owner, so
//! membership changes rebalance deterministically — losing ownership
//! stops the ticker cleanly, gaining it starts at the next aligned
//! instant, never retroactively.
//!
//! Interval schedulers align firing instants to `epoch mod interval == 0`
//! so distinct backends converge on the same schedule after a rebalance;
//! cron schedulers follow the expression's next UTC instant strictly
//! after now. Each tick publishes a [`CheckRequest`] snapshot to every
//! `(namespace, subscription)` topic, with single-delivery semantics for
//! round-robin checks. Ad-hoc requests popped from the work queue publish
//! immediately, outside the schedule.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant as TokioInstant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use argus_core::bus::{MessageBus, SubscriptionTopic};
use argus_core::check::{CheckConfig, CheckRequest};
use argus_core::queue::Queue;
use argus_core::store::{
    CheckConfigStore, EntityStore, SelectionPredicate, Store, WatchEventKind,
};

use crate::daemon::{Daemon, DaemonError};
use crate::metrics::BackendMetrics;
use crate::pipelined::filter::Expression;

/// How often the ad-hoc queue is polled.
const ADHOC_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Page size for proxy entity listing.
const ENTITY_PAGE_SIZE: u64 = 250;

/// Wall-clock budget for one proxy selector evaluation.
const SELECTOR_DEADLINE: Duration = Duration::from_millis(100);

/// Creates a single-member membership channel for dev mode; clusters
/// replace the sender side with their member watch.
#[must_use]
pub fn single_member(id: &str) -> (watch::Sender<Vec<String>>, watch::Receiver<Vec<String>>) {
    watch::channel(vec![id.to_string()])
}

/// The member owning a check's scheduler, or `None` without members.
///
/// Deterministic across processes: members are sorted and the SHA-256 of
/// `namespace/name` selects among them, so every backend computes the
/// same owner from the same member list.
#[must_use]
pub fn owner_of<'a>(namespace: &str, name: &str, members: &'a [String]) -> Option<&'a str> {
    if members.is_empty() {
        return None;
    }
    let mut sorted: Vec<&String> = members.iter().collect();
    sorted.sort();
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update(b"/");
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let value = u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
    #[allow(clippy::cast_possible_truncation)] // modulo member count
    Some(sorted[(value % sorted.len() as u64) as usize].as_str())
}

/// Delay until the next `epoch mod interval == 0` instant, in
/// `(0, interval]` seconds.
#[must_use]
pub fn aligned_start_delay(interval_secs: u32, now_unix: i64) -> Duration {
    let interval = i64::from(interval_secs.max(1));
    let rem = now_unix.rem_euclid(interval);
    #[allow(clippy::cast_sign_loss)] // rem < interval, so the difference is positive
    Duration::from_secs((interval - rem) as u64)
}

/// Delay until the cron expression's next firing strictly after `now`.
#[must_use]
pub fn next_cron_delay(schedule: &cron::Schedule, now: DateTime<Utc>) -> Option<Duration> {
    schedule
        .after(&now)
        .next()
        .and_then(|next| (next - now).to_std().ok())
}

/// State kept per known check configuration.
struct Entry {
    config: CheckConfig,
    running: Option<CancellationToken>,
}

/// Shared handles for scheduler tasks.
struct SchedulerContext {
    store: Arc<dyn Store>,
    bus: Arc<MessageBus>,
    metrics: BackendMetrics,
}

/// The check scheduling daemon.
pub struct Schedulerd {
    member_id: String,
    members: watch::Receiver<Vec<String>>,
    queue: Arc<dyn Queue>,
    ctx: Arc<SchedulerContext>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Schedulerd {
    /// Creates the daemon; no tasks run until [`Daemon::start`].
    #[must_use]
    pub fn new(
        member_id: String,
        members: watch::Receiver<Vec<String>>,
        store: Arc<dyn Store>,
        queue: Arc<dyn Queue>,
        bus: Arc<MessageBus>,
        metrics: BackendMetrics,
    ) -> Self {
        Self {
            member_id,
            members,
            queue,
            ctx: Arc::new(SchedulerContext {
                store,
                bus,
                metrics,
            }),
            cancel: CancellationToken::new(),
            task: None,
        }
    }
}

#[async_trait]
impl Daemon for Schedulerd {
    fn name(&self) -> &'static str {
        "schedulerd"
    }

    async fn start(&mut self) -> Result<(), DaemonError> {
        let control = Control {
            member_id: self.member_id.clone(),
            members: self.members.clone(),
            queue: Arc::clone(&self.queue),
            ctx: Arc::clone(&self.ctx),
            entries: HashMap::new(),
        };
        let cancel = self.cancel.clone();
        self.task = Some(tokio::spawn(control.run(cancel)));
        info!(member = %self.member_id, "schedulerd started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), DaemonError> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!("schedulerd stopped");
        Ok(())
    }
}

struct Control {
    member_id: String,
    members: watch::Receiver<Vec<String>>,
    queue: Arc<dyn Queue>,
    ctx: Arc<SchedulerContext>,
    entries: HashMap<(String, String), Entry>,
}

impl Control {
    async fn run(mut self, cancel: CancellationToken) {
        let mut config_watch = self.ctx.store.watch_check_configs();
        self.resync(&cancel).await;
        let mut adhoc_ticker = tokio::time::interval(ADHOC_POLL_INTERVAL);
        adhoc_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = config_watch.recv() => match event {
                    Ok(event) => {
                        let key = (
                            event.check.metadata.namespace.clone(),
                            event.check.metadata.name.clone(),
                        );
                        match event.kind {
                            WatchEventKind::Put => {
                                let entry = self.entries.entry(key.clone()).or_insert(Entry {
                                    config: event.check.clone(),
                                    running: None,
                                });
                                let changed = entry.config != event.check;
                                entry.config = event.check;
                                self.reconcile(&key, changed, &cancel);
                            }
                            WatchEventKind::Delete => {
                                if let Some(entry) = self.entries.remove(&key) {
                                    stop_entry(&key, entry);
                                }
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "config watch lagged, resyncing");
                        self.resync(&cancel).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                changed = self.members.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    debug!("membership changed, rebalancing schedulers");
                    let keys: Vec<(String, String)> = self.entries.keys().cloned().collect();
                    for key in keys {
                        self.reconcile(&key, false, &cancel);
                    }
                }
                _ = adhoc_ticker.tick() => {
                    self.drain_adhoc().await;
                }
                () = cancel.cancelled() => break,
            }
        }

        for (key, entry) in self.entries.drain() {
            stop_entry(&key, entry);
        }
        debug!("scheduler control loop exited");
    }

    /// Reloads every configuration and reconciles from scratch.
    async fn resync(&mut self, cancel: &CancellationToken) {
        match self.ctx.store.all_check_configs().await {
            Ok(configs) => {
                let mut fresh: HashMap<(String, String), CheckConfig> = configs
                    .into_iter()
                    .map(|c| {
                        (
                            (c.metadata.namespace.clone(), c.metadata.name.clone()),
                            c,
                        )
                    })
                    .collect();

                // Stop schedulers whose configs vanished.
                let gone: Vec<(String, String)> = self
                    .entries
                    .keys()
                    .filter(|k| !fresh.contains_key(*k))
                    .cloned()
                    .collect();
                for key in gone {
                    if let Some(entry) = self.entries.remove(&key) {
                        stop_entry(&key, entry);
                    }
                }

                let keys: Vec<(String, String)> = fresh.keys().cloned().collect();
                for key in keys {
                    let config = fresh.remove(&key).expect("key just listed");
                    let entry = self.entries.entry(key.clone()).or_insert(Entry {
                        config: config.clone(),
                        running: None,
                    });
                    let changed = entry.config != config;
                    entry.config = config;
                    self.reconcile(&key, changed, cancel);
                }
            }
            Err(err) => warn!(error = %err, "check config resync failed"),
        }
    }

    /// Starts or stops one check's scheduler according to ownership,
    /// the publish flag, and config validity.
    fn reconcile(&mut self, key: &(String, String), config_changed: bool, cancel: &CancellationToken) {
        let members = self.members.borrow().clone();
        let ctx = Arc::clone(&self.ctx);
        let owned = owner_of(&key.0, &key.1, &members) == Some(self.member_id.as_str());
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        let valid = entry.config.validate().is_ok();
        if !valid {
            debug!(check = %entry.config.metadata, "skipping invalid check config");
        }
        let should_run = owned && valid && entry.config.publish;
        let was_running = entry.running.is_some();

        if was_running && !should_run {
            debug!(namespace = %key.0, check = %key.1, "stopping check scheduler");
            if let Some(token) = entry.running.take() {
                token.cancel();
            }
        } else if should_run && (!was_running || config_changed) {
            if let Some(token) = entry.running.take() {
                token.cancel();
            }
            let child = cancel.child_token();
            entry.running = Some(child.clone());
            tokio::spawn(run_check_scheduler(entry.config.clone(), ctx, child));
        }
    }

    /// Pops pending ad-hoc requests and publishes them immediately.
    async fn drain_adhoc(&self) {
        loop {
            match self.queue.dequeue().await {
                Ok(Some(req)) => {
                    match self
                        .ctx
                        .store
                        .get_check_config(&req.namespace, &req.check)
                        .await
                    {
                        Ok(Some(config)) => {
                            debug!(check = %config.metadata, "publishing ad-hoc check request");
                            publish_check_request(&config, &self.ctx, "adhoc").await;
                        }
                        Ok(None) => {
                            debug!(namespace = %req.namespace, check = %req.check, "ad-hoc check not found");
                        }
                        Err(err) => warn!(error = %err, "ad-hoc check lookup failed"),
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "ad-hoc queue poll failed");
                    break;
                }
            }
        }
    }
}

fn stop_entry(key: &(String, String), entry: Entry) {
    if let Some(token) = entry.running {
        debug!(namespace = %key.0, check = %key.1, "stopping check scheduler");
        token.cancel();
    }
}

/// One check's timer loop. Interval checks tick at aligned instants;
/// cron checks follow the expression.
async fn run_check_scheduler(
    config: CheckConfig,
    ctx: Arc<SchedulerContext>,
    cancel: CancellationToken,
) {
    debug!(check = %config.metadata, "check scheduler started");
    if config.interval > 0 {
        let period = Duration::from_secs(u64::from(config.interval));
        let delay = aligned_start_delay(config.interval, Utc::now().timestamp());
        let mut ticker = tokio::time::interval_at(TokioInstant::now() + delay, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => publish_check_request(&config, &ctx, "interval").await,
                () = cancel.cancelled() => break,
            }
        }
    } else {
        let Ok(schedule) = config.cron.parse::<cron::Schedule>() else {
            warn!(check = %config.metadata, "cron expression failed to parse");
            return;
        };
        loop {
            let Some(delay) = next_cron_delay(&schedule, Utc::now()) else {
                debug!(check = %config.metadata, "cron schedule exhausted");
                break;
            };
            tokio::select! {
                () = tokio::time::sleep(delay) => publish_check_request(&config, &ctx, "cron").await,
                () = cancel.cancelled() => break,
            }
        }
    }
    debug!(check = %config.metadata, "check scheduler stopped");
}

/// Builds request snapshots (expanding proxy selectors) and publishes
/// them on every subscription topic. An empty subscription set publishes
/// nothing and is not an error.
async fn publish_check_request(config: &CheckConfig, ctx: &SchedulerContext, schedule: &str) {
    let issued = Utc::now().timestamp();
    let namespace = config.metadata.namespace.clone();

    let requests: Vec<CheckRequest> = if config.proxy_requests.is_some() {
        matching_proxy_entities(ctx.store.as_ref(), config)
            .await
            .into_iter()
            .map(|entity_name| CheckRequest {
                config: config.clone(),
                issued,
                proxy_entity_name: entity_name,
            })
            .collect()
    } else {
        vec![CheckRequest {
            config: config.clone(),
            issued,
            proxy_entity_name: config.proxy_entity_name.clone(),
        }]
    };

    ctx.metrics.scheduler_tick(schedule);

    for request in requests {
        let request = Arc::new(request);
        for subscription in &config.subscriptions {
            let topic = ctx
                .bus
                .subscription_topic(&SubscriptionTopic::new(&namespace, subscription));
            if config.round_robin {
                if !topic.publish_round_robin(Arc::clone(&request)) {
                    // Best-effort miss; the next tick retries.
                    debug!(check = %config.metadata, subscription, "no live subscriber");
                }
            } else {
                topic.publish(Arc::clone(&request));
            }
        }
    }
}

/// Names of entities matching every proxy selector expression.
async fn matching_proxy_entities(store: &dyn Store, config: &CheckConfig) -> Vec<String> {
    let Some(proxy) = &config.proxy_requests else {
        return Vec::new();
    };
    let mut selectors = Vec::new();
    for source in &proxy.entity_attributes {
        match Expression::parse(source) {
            Ok(expr) => selectors.push(expr),
            Err(err) => {
                warn!(check = %config.metadata, error = %err, "bad proxy selector");
                return Vec::new();
            }
        }
    }

    let namespace = &config.metadata.namespace;
    let mut matched = Vec::new();
    let mut pred = SelectionPredicate::with_limit(ENTITY_PAGE_SIZE);
    loop {
        let page = match store.list_entities(namespace, &mut pred).await {
            Ok(page) => page,
            Err(err) => {
                warn!(error = %err, "proxy entity listing failed");
                break;
            }
        };
        let short = (page.len() as u64) < ENTITY_PAGE_SIZE;
        for entity in page {
            let Ok(doc) = serde_json::to_value(&entity) else {
                continue;
            };
            let deadline = std::time::Instant::now() + SELECTOR_DEADLINE;
            let all_match = selectors
                .iter()
                .all(|expr| expr.evaluate_as("entity", &doc, deadline).unwrap_or(false));
            if all_match {
                matched.push(entity.metadata.name.clone());
            }
        }
        if pred.continue_token.is_empty() || short {
            break;
        }
    }
    matched
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_core::entity::{Entity, EntityClass};
    use argus_core::meta::ObjectMeta;
    use argus_core::queue::AdhocRequest;
    use argus_core::store::{CheckConfigStore, EntityStore};
    use std::str::FromStr;

    use crate::metrics::MetricsRegistry;
    use crate::store::{MemoryQueue, MemoryStore};

    fn check(name: &str, interval: u32, subscriptions: &[&str]) -> CheckConfig {
        CheckConfig {
            metadata: ObjectMeta::namespaced("default", name),
            command: "true".to_string(),
            interval,
            subscriptions: subscriptions.iter().map(|s| (*s).to_string()).collect(),
            ..CheckConfig::default()
        }
    }

    fn schedulerd(
        member: &str,
        members: watch::Receiver<Vec<String>>,
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        bus: Arc<MessageBus>,
    ) -> Schedulerd {
        Schedulerd::new(
            member.to_string(),
            members,
            store,
            queue,
            bus,
            MetricsRegistry::new().unwrap().backend_metrics(),
        )
    }

    #[test]
    fn ownership_is_deterministic_and_total() {
        let members = vec!["b".to_string(), "a".to_string(), "c".to_string()];
        let first = owner_of("default", "disk", &members).unwrap();
        let second = owner_of("default", "disk", &members).unwrap();
        assert_eq!(first, second);
        assert!(members.iter().any(|m| m == first));

        // Order of the member list does not change the outcome.
        let shuffled = vec!["c".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(owner_of("default", "disk", &shuffled).unwrap(), first);

        assert!(owner_of("default", "disk", &[]).is_none());
    }

    #[test]
    fn single_member_owns_everything() {
        let members = vec!["only".to_string()];
        for name in ["a", "b", "c", "d"] {
            assert_eq!(owner_of("default", name, &members), Some("only"));
        }
    }

    #[test]
    fn aligned_delay_lands_on_interval_boundaries() {
        assert_eq!(aligned_start_delay(10, 100), Duration::from_secs(10));
        assert_eq!(aligned_start_delay(10, 103), Duration::from_secs(7));
        assert_eq!(aligned_start_delay(10, 109), Duration::from_secs(1));
        // Two backends at different instants converge on the same grid.
        let a = 1700000003 + i64::try_from(aligned_start_delay(10, 1700000003).as_secs()).unwrap();
        let b = 1700000007 + i64::try_from(aligned_start_delay(10, 1700000007).as_secs()).unwrap();
        assert_eq!(a % 10, 0);
        assert_eq!(b % 10, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn cron_delay_is_strictly_future() {
        let schedule = cron::Schedule::from_str("0 * * * * * *").unwrap();
        let now = DateTime::parse_from_rfc3339("2026-08-02T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        // Exactly on a firing instant: the next one is a full minute out.
        let delay = next_cron_delay(&schedule, now).unwrap();
        assert_eq!(delay, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_check_fans_out_to_all_subscribers() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let bus = Arc::new(MessageBus::new(64));
        let (_members_tx, members_rx) = single_member("backend-1");

        let topic = bus.subscription_topic(&SubscriptionTopic::new("default", "linux"));
        let mut agent1 = topic.subscribe();
        let mut agent2 = topic.subscribe();

        let mut daemon = schedulerd("backend-1", members_rx, Arc::clone(&store), queue, bus);
        daemon.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        store
            .update_check_config(&check("mem", 10, &["linux"]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let got1 = std::iter::from_fn(|| agent1.try_recv()).count();
        let got2 = std::iter::from_fn(|| agent2.try_recv()).count();
        assert_eq!(got1, 3);
        assert_eq!(got2, 3);

        daemon.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn round_robin_check_delivers_once_per_tick() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let bus = Arc::new(MessageBus::new(64));
        let (_members_tx, members_rx) = single_member("backend-1");

        let topic = bus.subscription_topic(&SubscriptionTopic::new("default", "linux"));
        let mut agent1 = topic.subscribe();
        let mut agent2 = topic.subscribe();

        let mut daemon = schedulerd("backend-1", members_rx, Arc::clone(&store), queue, bus);
        daemon.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut rr = check("mem", 10, &["linux"]);
        rr.round_robin = true;
        store.update_check_config(&rr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let got1 = std::iter::from_fn(|| agent1.try_recv()).count();
        let got2 = std::iter::from_fn(|| agent2.try_recv()).count();
        assert_eq!(got1 + got2, 3);

        daemon.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unpublished_checks_never_fire() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let bus = Arc::new(MessageBus::new(64));
        let (_members_tx, members_rx) = single_member("backend-1");

        let topic = bus.subscription_topic(&SubscriptionTopic::new("default", "linux"));
        let mut agent = topic.subscribe();

        let mut daemon = schedulerd("backend-1", members_rx, Arc::clone(&store), queue, bus);
        daemon.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut unpublished = check("mem", 10, &["linux"]);
        unpublished.publish = false;
        store.update_check_config(&unpublished).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(agent.try_recv().is_none());
        daemon.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn empty_subscription_set_publishes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let bus = Arc::new(MessageBus::new(64));
        let (_members_tx, members_rx) = single_member("backend-1");

        let mut daemon = schedulerd("backend-1", members_rx, Arc::clone(&store), queue, bus);
        daemon.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        store
            .update_check_config(&check("mem", 10, &[]))
            .await
            .unwrap();
        // Firing with no subscriptions is a quiet no-op.
        tokio::time::sleep(Duration::from_secs(20)).await;
        daemon.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn losing_ownership_stops_the_ticker() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let bus = Arc::new(MessageBus::new(64));
        let (members_tx, members_rx) = single_member("backend-1");

        let topic = bus.subscription_topic(&SubscriptionTopic::new("default", "linux"));
        let mut agent = topic.subscribe();

        let mut daemon = schedulerd("backend-1", members_rx, Arc::clone(&store), queue, bus);
        daemon.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        store
            .update_check_config(&check("mem", 10, &["linux"]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(std::iter::from_fn(|| agent.try_recv()).count() >= 1);

        // A new member that hashes as the owner takes over; this backend
        // must stop firing. "backend-1" no longer in the member list
        // guarantees loss regardless of hashing.
        members_tx.send(vec!["backend-2".to_string()]).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        while agent.try_recv().is_some() {}

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(agent.try_recv().is_none());

        daemon.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn adhoc_requests_publish_outside_the_schedule() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let bus = Arc::new(MessageBus::new(64));
        let (_members_tx, members_rx) = single_member("backend-1");

        let topic = bus.subscription_topic(&SubscriptionTopic::new("default", "linux"));
        let mut agent = topic.subscribe();

        // publish=false keeps the interval scheduler quiet; only the
        // ad-hoc path may deliver.
        let mut cfg = check("mem", 3600, &["linux"]);
        cfg.publish = false;
        store.update_check_config(&cfg).await.unwrap();

        let mut daemon = schedulerd(
            "backend-1",
            members_rx,
            Arc::clone(&store),
            Arc::clone(&queue),
            bus,
        );
        daemon.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue
            .enqueue(AdhocRequest {
                namespace: "default".to_string(),
                check: "mem".to_string(),
                creator: "ops".to_string(),
                reason: "incident follow-up".to_string(),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        let req = agent.try_recv().expect("ad-hoc request delivered");
        assert_eq!(req.config.metadata.name, "mem");

        daemon.stop().await.unwrap();
    }

    #[tokio::test]
    async fn proxy_selectors_pick_matching_entities() {
        let store = Arc::new(MemoryStore::new());
        for (name, device) in [("rtr01", "router"), ("sw01", "switch"), ("rtr02", "router")] {
            let mut entity = Entity {
                metadata: ObjectMeta::namespaced("default", name),
                entity_class: EntityClass::Proxy,
                ..Entity::default()
            };
            entity
                .metadata
                .labels
                .insert("device".to_string(), device.to_string());
            store.update_entity(&entity).await.unwrap();
        }

        let mut cfg = check("snmp", 60, &["proxy-pollers"]);
        cfg.proxy_requests = Some(argus_core::check::ProxyRequests {
            entity_attributes: vec!["entity.metadata.labels.device == 'router'".to_string()],
        });

        let mut matched = matching_proxy_entities(store.as_ref(), &cfg).await;
        matched.sort();
        assert_eq!(matched, vec!["rtr01".to_string(), "rtr02".to_string()]);
    }
}
