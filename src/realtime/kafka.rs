//! Kafka consumer abstraction
//!
//! The real-time loops only need a handful of operations from a consumer:
//! subscribe to a topic set, poll a bounded batch and close. [`ConsumerFactory`]
//! creates them per broker and enumerates topic partitions for the leader.
//! The rdkafka implementation lives behind the `kafka` feature; [`MemoryKafka`]
//! is an in-process broker for tests and dry runs.

use crate::error::{AccessError, AccessResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One consumed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub value: Vec<u8>,
}

/// A consumer bound to one broker
#[async_trait]
pub trait TopicConsumer: Send + Sync {
    /// Bootstrap server (`domain:port`)
    fn broker(&self) -> &str;

    fn subscription(&self) -> BTreeSet<String>;

    /// Replace the subscription without recreating the consumer
    fn subscribe(&self, topics: &BTreeSet<String>) -> AccessResult<()>;

    /// Up to `max_records` records, waiting at most `timeout`
    async fn poll(&self, timeout: Duration, max_records: usize) -> AccessResult<Vec<KafkaRecord>>;

    fn close(&self);
}

#[async_trait]
pub trait ConsumerFactory: Send + Sync {
    async fn create(
        &self,
        broker: &str,
        group_id: &str,
        topics: &BTreeSet<String>,
    ) -> AccessResult<Arc<dyn TopicConsumer>>;

    /// Partition ids of `topic`; empty when the topic is unknown
    async fn partitions(&self, broker: &str, topic: &str) -> AccessResult<Vec<i32>>;
}

#[cfg(feature = "kafka")]
pub use self::rd::{RdKafkaConsumer, RdKafkaFactory};

#[cfg(feature = "kafka")]
mod rd {
    use super::*;
    use crate::config::KafkaConsumerConfig;
    use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
    use rdkafka::{ClientConfig, Message};
    use tokio::time::Instant;
    use tracing::{debug, warn};

    /// Extra librdkafka properties accepted from configuration
    const ALLOWED_KAFKA_PROPS: &[&str] = &[
        "compression.type",
        "compression.level",
        "fetch.min.bytes",
        "fetch.max.wait.ms",
        "fetch.max.bytes",
        "max.partition.fetch.bytes",
        "request.timeout.ms",
        "metadata.max.age.ms",
        "receive.buffer.bytes",
        "send.buffer.bytes",
        "queued.min.messages",
        "queued.max.messages.kbytes",
        "fetch.error.backoff.ms",
        "fetch.message.max.bytes",
        "reconnect.backoff.ms",
        "reconnect.backoff.max.ms",
        "connections.max.idle.ms",
        "socket.keepalive.enable",
        "statistics.interval.ms",
    ];

    fn kafka_error(e: rdkafka::error::KafkaError) -> AccessError {
        AccessError::Kafka(e.to_string())
    }

    /// Creates rdkafka consumers from [`KafkaConsumerConfig`]
    #[derive(Clone)]
    pub struct RdKafkaFactory {
        config: KafkaConsumerConfig,
    }

    impl RdKafkaFactory {
        pub fn new(config: KafkaConsumerConfig) -> Self {
            Self { config }
        }

        fn client_config(&self, broker: &str, group_id: &str) -> AccessResult<ClientConfig> {
            let config = &self.config;
            let mut client_config = ClientConfig::new();
            client_config
                .set("bootstrap.servers", broker)
                .set("group.id", group_id)
                .set("enable.auto.commit", config.enable_auto_commit.to_string())
                .set("auto.commit.interval.ms", config.auto_commit_interval_ms.to_string())
                .set("session.timeout.ms", config.session_timeout_ms.to_string())
                .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string())
                .set("auto.offset.reset", &config.auto_offset_reset);

            for (key, value) in &config.kafka_properties {
                if !ALLOWED_KAFKA_PROPS.contains(&key.as_str()) {
                    return Err(AccessError::Config(format!(
                        "Kafka property '{}' is not allowed. Allowed properties: {:?}",
                        key, ALLOWED_KAFKA_PROPS
                    )));
                }
                client_config.set(key, value);
            }
            Ok(client_config)
        }
    }

    #[async_trait]
    impl ConsumerFactory for RdKafkaFactory {
        async fn create(
            &self,
            broker: &str,
            group_id: &str,
            topics: &BTreeSet<String>,
        ) -> AccessResult<Arc<dyn TopicConsumer>> {
            let consumer: StreamConsumer = self
                .client_config(broker, group_id)?
                .create()
                .map_err(kafka_error)?;
            let consumer = RdKafkaConsumer {
                broker: broker.to_string(),
                consumer,
                topics: Mutex::new(BTreeSet::new()),
            };
            consumer.subscribe(topics)?;
            debug!(broker, group_id, topics = topics.len(), "Kafka consumer created");
            Ok(Arc::new(consumer))
        }

        async fn partitions(&self, broker: &str, topic: &str) -> AccessResult<Vec<i32>> {
            let client_config = self.client_config(broker, "metric-access-metadata")?;
            let timeout = self.config.connection_timeout;
            let topic = topic.to_string();
            tokio::task::spawn_blocking(move || {
                let consumer: BaseConsumer = client_config.create().map_err(kafka_error)?;
                let metadata = consumer
                    .fetch_metadata(Some(&topic), timeout)
                    .map_err(kafka_error)?;
                Ok(metadata
                    .topics()
                    .iter()
                    .filter(|t| t.name() == topic)
                    .flat_map(|t| t.partitions().iter().map(|p| p.id()))
                    .collect())
            })
            .await
            .map_err(|e| AccessError::Internal(format!("metadata task failed: {}", e)))?
        }
    }

    pub struct RdKafkaConsumer {
        broker: String,
        consumer: StreamConsumer,
        topics: Mutex<BTreeSet<String>>,
    }

    #[async_trait]
    impl TopicConsumer for RdKafkaConsumer {
        fn broker(&self) -> &str {
            &self.broker
        }

        fn subscription(&self) -> BTreeSet<String> {
            self.topics.lock().clone()
        }

        fn subscribe(&self, topics: &BTreeSet<String>) -> AccessResult<()> {
            if topics.is_empty() {
                self.consumer.unsubscribe();
            } else {
                let names: Vec<&str> = topics.iter().map(String::as_str).collect();
                self.consumer.subscribe(&names).map_err(kafka_error)?;
            }
            *self.topics.lock() = topics.clone();
            Ok(())
        }

        async fn poll(&self, timeout: Duration, max_records: usize) -> AccessResult<Vec<KafkaRecord>> {
            let deadline = Instant::now() + timeout;
            let mut records = Vec::new();
            while records.len() < max_records {
                let message = match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                    Ok(Ok(message)) => message,
                    Ok(Err(e)) if records.is_empty() => return Err(kafka_error(e)),
                    Ok(Err(e)) => {
                        warn!(broker = %self.broker, "Kafka poll error: {}", e);
                        break;
                    }
                    Err(_) => break,
                };
                records.push(KafkaRecord {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                    value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                });
            }
            Ok(records)
        }

        fn close(&self) {
            self.consumer.unsubscribe();
            self.topics.lock().clear();
        }
    }

}

#[derive(Default)]
struct MemoryKafkaState {
    partitions: HashMap<(String, String), Vec<i32>>,
    pending: HashMap<(String, String), VecDeque<KafkaRecord>>,
    offsets: HashMap<(String, String), i64>,
    unreachable: HashSet<String>,
}

/// In-process brokers.
///
/// Records produced to a topic are delivered once, to whichever consumer on
/// that broker polls the topic first.
#[derive(Clone, Default)]
pub struct MemoryKafka {
    state: Arc<Mutex<MemoryKafkaState>>,
    created: Arc<AtomicUsize>,
}

impl MemoryKafka {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_topic(&self, broker: &str, topic: &str, partitions: i32) {
        self.state
            .lock()
            .partitions
            .insert((broker.to_string(), topic.to_string()), (0..partitions).collect());
    }

    pub fn produce(&self, broker: &str, topic: &str, value: impl Into<Vec<u8>>) {
        let mut state = self.state.lock();
        let key = (broker.to_string(), topic.to_string());
        let offset = state.offsets.entry(key.clone()).or_insert(0);
        let record = KafkaRecord {
            topic: topic.to_string(),
            partition: 0,
            offset: *offset,
            value: value.into(),
        };
        *offset += 1;
        state.pending.entry(key).or_default().push_back(record);
    }

    /// Make connections and metadata calls to `broker` fail
    pub fn set_unreachable(&self, broker: &str, unreachable: bool) {
        let mut state = self.state.lock();
        if unreachable {
            state.unreachable.insert(broker.to_string());
        } else {
            state.unreachable.remove(broker);
        }
    }

    /// Number of consumers created so far
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    fn check_reachable(&self, broker: &str) -> AccessResult<()> {
        if self.state.lock().unreachable.contains(broker) {
            return Err(AccessError::Kafka(format!("no brokers available: {}", broker)));
        }
        Ok(())
    }
}

#[async_trait]
impl ConsumerFactory for MemoryKafka {
    async fn create(
        &self,
        broker: &str,
        _group_id: &str,
        topics: &BTreeSet<String>,
    ) -> AccessResult<Arc<dyn TopicConsumer>> {
        self.check_reachable(broker)?;
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(MemoryConsumer {
            broker: broker.to_string(),
            kafka: self.clone(),
            topics: Mutex::new(topics.clone()),
            closed: AtomicBool::new(false),
        }))
    }

    async fn partitions(&self, broker: &str, topic: &str) -> AccessResult<Vec<i32>> {
        self.check_reachable(broker)?;
        Ok(self
            .state
            .lock()
            .partitions
            .get(&(broker.to_string(), topic.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

/// Consumer over [`MemoryKafka`]
pub struct MemoryConsumer {
    broker: String,
    kafka: MemoryKafka,
    topics: Mutex<BTreeSet<String>>,
    closed: AtomicBool,
}

impl MemoryConsumer {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TopicConsumer for MemoryConsumer {
    fn broker(&self) -> &str {
        &self.broker
    }

    fn subscription(&self) -> BTreeSet<String> {
        self.topics.lock().clone()
    }

    fn subscribe(&self, topics: &BTreeSet<String>) -> AccessResult<()> {
        *self.topics.lock() = topics.clone();
        Ok(())
    }

    async fn poll(&self, _timeout: Duration, max_records: usize) -> AccessResult<Vec<KafkaRecord>> {
        if self.is_closed() {
            return Err(AccessError::Kafka("consumer closed".to_string()));
        }
        let topics = self.subscription();
        let mut state = self.kafka.state.lock();
        let mut records = Vec::new();
        for topic in topics {
            let Some(queue) = state.pending.get_mut(&(self.broker.clone(), topic)) else {
                continue;
            };
            while records.len() < max_records {
                match queue.pop_front() {
                    Some(record) => records.push(record),
                    None => break,
                }
            }
        }
        Ok(records)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}
