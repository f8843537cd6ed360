//! Moves polled Kafka batches onto the bounded work queue

use super::consumer_manager::ConsumerSet;
use super::kafka::KafkaRecord;
use super::leader::sleep_or_cancel;
use crate::error::{AccessError, AccessResult};
use crate::metrics::AccessMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One poll result of one broker
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub broker: String,
    pub records: Vec<KafkaRecord>,
}

/// Bounded queue between the poller and the handler
pub fn work_queue(capacity: usize) -> (mpsc::Sender<WorkItem>, mpsc::Receiver<WorkItem>) {
    mpsc::channel(capacity.max(1))
}

pub struct Poller {
    consumers: ConsumerSet,
    tx: mpsc::Sender<WorkItem>,
    timeout: Duration,
    max_records: usize,
    idle_sleep: Duration,
    metrics: Arc<AccessMetrics>,
}

impl Poller {
    pub fn new(
        consumers: ConsumerSet,
        tx: mpsc::Sender<WorkItem>,
        timeout: Duration,
        max_records: usize,
        idle_sleep: Duration,
        metrics: Arc<AccessMetrics>,
    ) -> Self {
        Self {
            consumers,
            tx,
            timeout,
            max_records,
            idle_sleep,
            metrics,
        }
    }

    /// Poll every live consumer once; returns the number of records queued.
    ///
    /// Blocks while the work queue is full. Cancellation abandons the pending
    /// batch; Kafka re-delivers uncommitted offsets to the next consumer.
    pub async fn poll_once(&self, token: &CancellationToken) -> AccessResult<usize> {
        let consumers = self.consumers.read().await;
        let mut queued = 0;
        for (broker, consumer) in consumers.iter() {
            let records = match consumer.poll(self.timeout, self.max_records).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(broker = %broker, "kafka poll failed: {}", e);
                    continue;
                }
            };
            if records.is_empty() {
                continue;
            }

            let count = records.len();
            let item = WorkItem {
                broker: broker.clone(),
                records,
            };
            tokio::select! {
                _ = token.cancelled() => {
                    return Err(AccessError::Shutdown("poller cancelled".to_string()));
                }
                sent = self.tx.send(item) => sent?,
            }
            debug!(broker = %broker, count, "queued kafka records");
            AccessMetrics::add(&self.metrics.points_pulled, count);
            queued += count;
        }
        Ok(queued)
    }

    pub async fn run(&self, token: CancellationToken, once: bool) {
        loop {
            if token.is_cancelled() {
                break;
            }
            match self.poll_once(&token).await {
                Ok(0) => {
                    if once || !sleep_or_cancel(&token, self.idle_sleep).await {
                        break;
                    }
                }
                Ok(_) => {
                    if once {
                        break;
                    }
                }
                Err(AccessError::Shutdown(_)) => break,
                Err(e) => e.log("real-time poller"),
            }
        }
        info!("real_time poller get stop signal");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::kafka::{ConsumerFactory, MemoryKafka};
    use std::collections::BTreeSet;

    #[tokio::test]
    async fn test_poll_once_queues_per_broker() {
        let kafka = MemoryKafka::new();
        let consumers = ConsumerSet::default();
        let topics = BTreeSet::from(["t".to_string()]);
        for broker in ["k1", "k2"] {
            let consumer = kafka.create(broker, "g", &topics).await.unwrap();
            consumers.write().await.insert(broker.to_string(), consumer);
        }
        kafka.produce("k1", "t", "a");
        kafka.produce("k1", "t", "b");

        let (tx, mut rx) = work_queue(4);
        let metrics = Arc::new(AccessMetrics::new());
        let poller = Poller::new(
            consumers,
            tx,
            Duration::from_millis(1),
            5000,
            Duration::from_millis(1),
            Arc::clone(&metrics),
        );
        let token = CancellationToken::new();
        assert_eq!(poller.poll_once(&token).await.unwrap(), 2);
        let item = rx.try_recv().unwrap();
        assert_eq!(item.broker, "k1");
        assert_eq!(item.records.len(), 2);
        assert!(rx.try_recv().is_err());
        assert_eq!(poller.poll_once(&token).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_released_by_cancel() {
        let kafka = MemoryKafka::new();
        let consumers = ConsumerSet::default();
        let topics = BTreeSet::from(["t".to_string()]);
        let consumer = kafka.create("k1", "g", &topics).await.unwrap();
        consumers.write().await.insert("k1".to_string(), consumer);

        let (tx, _rx) = work_queue(1);
        let poller = Poller::new(
            consumers,
            tx,
            Duration::from_millis(1),
            1,
            Duration::from_millis(1),
            Arc::new(AccessMetrics::new()),
        );
        let token = CancellationToken::new();
        kafka.produce("k1", "t", "a");
        kafka.produce("k1", "t", "b");
        assert_eq!(poller.poll_once(&token).await.unwrap(), 1);

        token.cancel();
        assert!(matches!(
            poller.poll_once(&token).await,
            Err(AccessError::Shutdown(_))
        ));
    }
}
