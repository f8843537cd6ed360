//! Keeps the local Kafka consumers in line with this node's assignment row

use super::assignment::{topics_by_broker, NodeAssignment};
use super::kafka::{ConsumerFactory, TopicConsumer};
use super::leader::sleep_or_cancel;
use crate::error::AccessResult;
use crate::keys;
use crate::kv::{KvStore, SharedKv};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Live consumers by broker. Written only by the manager, read by the poller.
pub type ConsumerSet = Arc<RwLock<BTreeMap<String, Arc<dyn TopicConsumer>>>>;

/// Last assignment row seen by this node, read by the handler
pub type AssignmentView = Arc<parking_lot::RwLock<NodeAssignment>>;

/// Changes needed to reach the desired broker -> topics map
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub create: BTreeMap<String, BTreeSet<String>>,
    pub update: BTreeMap<String, BTreeSet<String>>,
    pub close: BTreeSet<String>,
}

impl ReconcilePlan {
    pub fn diff(
        current: &BTreeMap<String, BTreeSet<String>>,
        desired: &BTreeMap<String, BTreeSet<String>>,
    ) -> Self {
        let mut plan = Self::default();
        for (broker, topics) in desired {
            if topics.is_empty() {
                continue;
            }
            match current.get(broker) {
                None => {
                    plan.create.insert(broker.clone(), topics.clone());
                }
                Some(subscribed) if subscribed != topics => {
                    plan.update.insert(broker.clone(), topics.clone());
                }
                Some(_) => {}
            }
        }
        for broker in current.keys() {
            if desired.get(broker).map_or(true, BTreeSet::is_empty) {
                plan.close.insert(broker.clone());
            }
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.close.is_empty()
    }
}

pub struct ConsumerManager {
    node_id: String,
    group_id: String,
    kv: SharedKv,
    factory: Arc<dyn ConsumerFactory>,
    consumers: ConsumerSet,
    assignment: AssignmentView,
    interval: Duration,
}

impl ConsumerManager {
    pub fn new(
        node_id: impl Into<String>,
        group_id: impl Into<String>,
        kv: SharedKv,
        factory: Arc<dyn ConsumerFactory>,
        consumers: ConsumerSet,
        assignment: AssignmentView,
        interval: Duration,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            group_id: group_id.into(),
            kv,
            factory,
            consumers,
            assignment,
            interval,
        }
    }

    /// This node's row, or `None` when no assignment is published at all.
    ///
    /// A published hash without a field for this node means "nothing to
    /// consume"; a missing hash keeps the last-seen row.
    async fn load_row(&self) -> AccessResult<Option<NodeAssignment>> {
        let rows = self.kv.hgetall(keys::HOST_TOPIC_KEY).await?;
        if rows.is_empty() {
            return Ok(None);
        }
        match rows.get(&self.node_id) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(Some(NodeAssignment::new())),
        }
    }

    async fn current_subscriptions(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.consumers
            .read()
            .await
            .iter()
            .map(|(broker, consumer)| (broker.clone(), consumer.subscription()))
            .collect()
    }

    pub async fn reconcile(&self) -> AccessResult<ReconcilePlan> {
        let row = match self.load_row().await? {
            Some(row) => {
                *self.assignment.write() = row.clone();
                row
            }
            None => {
                debug!(node_id = %self.node_id, "no assignment published, keeping last-seen");
                self.assignment.read().clone()
            }
        };

        let desired = topics_by_broker(&row);
        let plan = ReconcilePlan::diff(&self.current_subscriptions().await, &desired);
        if plan.is_empty() {
            return Ok(plan);
        }

        let mut consumers = self.consumers.write().await;
        for (broker, topics) in &plan.create {
            match self.factory.create(broker, &self.group_id, topics).await {
                Ok(consumer) => {
                    consumers.insert(broker.clone(), consumer);
                }
                Err(e) => warn!(broker = %broker, "create kafka consumer failed, retry next cycle: {}", e),
            }
        }
        for (broker, topics) in &plan.update {
            if let Some(consumer) = consumers.get(broker) {
                if let Err(e) = consumer.subscribe(topics) {
                    warn!(broker = %broker, "re-subscribe failed: {}", e);
                }
            }
        }
        for broker in &plan.close {
            if let Some(consumer) = consumers.remove(broker) {
                consumer.close();
            }
        }
        info!(
            create = plan.create.len(),
            update = plan.update.len(),
            close = plan.close.len(),
            "kafka consumers reconciled"
        );
        Ok(plan)
    }

    /// Close every live consumer
    pub async fn close_all(&self) {
        let mut consumers = self.consumers.write().await;
        for (broker, consumer) in std::mem::take(&mut *consumers) {
            debug!(broker = %broker, "closing kafka consumer");
            consumer.close();
        }
    }

    pub async fn run(&self, token: CancellationToken, once: bool) {
        loop {
            if let Err(e) = self.reconcile().await {
                e.log("real-time consumer manager");
            }
            if once || !sleep_or_cancel(&token, self.interval).await {
                break;
            }
        }
        if token.is_cancelled() {
            self.close_all().await;
        }
        info!("real_time consumer manager get stop signal");
    }
}
