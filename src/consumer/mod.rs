use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use kafka_protocol::error::ResponseError;
use log::debug;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{BrokerConnection, ClientError, Cluster, OffsetAt};
use crate::config::ConsumerConfig;
use crate::mapper::{Mapper, Resolver};

mod broker;
mod offset_tracker;
mod partition;

pub use broker::BrokerConsumer;
pub use offset_tracker::OffsetTracker;

use partition::PartitionPump;

/// One ordered subsequence of a topic; the unit of consumption.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// A Kafka message as delivered to the user.
#[derive(Debug, Clone)]
pub struct Message {
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub high_water_mark: i64,
}

/// Where to start consuming a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    Oldest,
    Newest,
    At(i64),
}

#[derive(Debug, Clone, Error)]
pub enum ConsumerErrorKind {
    #[error("transport error: {0}")]
    Transport(Arc<ClientError>),
    #[error("response did not contain the requested block")]
    IncompleteResponse,
    #[error("kafka error: {0:?}")]
    Kafka(ResponseError),
    #[error("offset out of range")]
    OffsetOutOfRange,
    #[error("message larger than the configured maximum fetch size")]
    MessageTooLarge,
}

/// An error observed while consuming one partition.
#[derive(Debug, Clone, Error)]
#[error("error while consuming {topic}/{partition}: {kind}")]
pub struct ConsumerError {
    pub topic: String,
    pub partition: i32,
    pub kind: ConsumerErrorKind,
}

/// The errors still pending on a partition consumer when it was closed.
#[derive(Debug, Error)]
#[error("{} errors while consuming", .0.len())]
pub struct ConsumerErrors(pub Vec<ConsumerError>);

#[derive(Debug, Error)]
pub enum Error {
    #[error("already consuming {0}")]
    AlreadyConsumed(TopicPartition),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("{0} partition consumers still open")]
    StillConsuming(usize),
}

/// Resolves a partition to its leader's connection and spawns fetch
/// executors; the two callbacks the mapper composes.
struct ConsumerResolver<C: Cluster> {
    client: Arc<C>,
    config: ConsumerConfig,
}

impl<C: Cluster> Resolver for ConsumerResolver<C> {
    type Key = TopicPartition;
    type Broker = Arc<C::Conn>;
    type Executor = BrokerConsumer<C::Conn>;

    async fn resolve_broker(&self, tp: &TopicPartition) -> anyhow::Result<Arc<C::Conn>> {
        let conn = self.client.leader(&tp.topic, tp.partition).await?;
        Ok(conn)
    }

    fn broker_id(&self, conn: &Arc<C::Conn>) -> i32 {
        conn.id()
    }

    async fn spawn_executor(&self, conn: Arc<C::Conn>) -> BrokerConsumer<C::Conn> {
        BrokerConsumer::spawn(conn, self.config.clone())
    }
}

struct ConsumerInner<C: Cluster> {
    client: Arc<C>,
    config: ConsumerConfig,
    mapper: Mapper<ConsumerResolver<C>>,
    // Guards the one-consumer-per-partition invariant. Taken only on
    // consume_partition and on handle close.
    children: std::sync::Mutex<HashMap<TopicPartition, CancellationToken>>,
}

/// Manages partition consumers against one cluster. Call `close` after all
/// partition consumer handles have been closed.
pub struct Consumer<C: Cluster> {
    inner: Arc<ConsumerInner<C>>,
}

impl<C: Cluster> Consumer<C> {
    pub async fn new(client: Arc<C>, config: ConsumerConfig) -> anyhow::Result<Self> {
        let resolver = Arc::new(ConsumerResolver {
            client: client.clone(),
            config: config.clone(),
        });
        let mapper = Mapper::spawn(resolver).await?;
        Ok(Self {
            inner: Arc::new(ConsumerInner {
                client,
                config,
                mapper,
                children: std::sync::Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Starts consuming the given partition. The requested offset is
    /// clamped into the partition's current range; the concrete starting
    /// offset is returned alongside the handle.
    pub async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        offset: StartOffset,
    ) -> Result<(PartitionConsumer<C>, i64), Error> {
        let concrete_offset = self.choose_starting_offset(topic, partition, offset).await?;
        let tp = TopicPartition::new(topic, partition);

        let mut children = self.inner.children.lock().unwrap();
        if children.contains_key(&tp) {
            return Err(Error::AlreadyConsumed(tp));
        }

        let (assignment_tx, assignment_rx) = mpsc::channel(1);
        let (messages_tx, messages_rx) = mpsc::channel(self.inner.config.channel_buffer_size);
        let (errors_tx, errors_rx) = mpsc::channel(self.inner.config.channel_buffer_size);
        let closing = CancellationToken::new();

        let pump = PartitionPump {
            tp: tp.clone(),
            config: self.inner.config.clone(),
            assignment_rx,
            messages_tx,
            errors_tx,
            closing: closing.clone(),
            reassign: {
                let inner = self.inner.clone();
                let tp = tp.clone();
                Box::new(move || inner.mapper.worker_reassign(tp.clone()))
            },
            offset: concrete_offset,
            fetch_size: self.inner.config.fetch_default_bytes,
            lag: 0,
        };
        let pump_task = tokio::spawn(pump.run());

        children.insert(tp.clone(), closing.clone());
        self.inner.mapper.worker_spawned(tp.clone(), assignment_tx);
        debug!("consuming {} from offset {}", tp, concrete_offset);

        Ok((
            PartitionConsumer {
                tp,
                messages: messages_rx,
                errors: errors_rx,
                closing,
                pump_task: Some(pump_task),
                consumer: self.inner.clone(),
            },
            concrete_offset,
        ))
    }

    /// Maps a requested starting offset onto the partition's current
    /// range. The range may move between this probe and the first fetch;
    /// the first fetch surfaces that as an out-of-range error.
    async fn choose_starting_offset(
        &self,
        topic: &str,
        partition: i32,
        offset: StartOffset,
    ) -> Result<i64, Error> {
        let newest = self
            .inner
            .client
            .get_offset(topic, partition, OffsetAt::Newest)
            .await?;
        let oldest = self
            .inner
            .client
            .get_offset(topic, partition, OffsetAt::Oldest)
            .await?;

        Ok(match offset {
            StartOffset::Newest => newest,
            StartOffset::Oldest => oldest,
            StartOffset::At(requested) if requested > newest => newest,
            StartOffset::At(requested) if requested < oldest => oldest,
            StartOffset::At(requested) => requested,
        })
    }

    /// Shuts the consumer down. All partition consumer handles must have
    /// been closed first.
    pub async fn close(&self) -> Result<(), Error> {
        let open = self.inner.children.lock().unwrap().len();
        if open > 0 {
            return Err(Error::StillConsuming(open));
        }
        self.inner.mapper.stop().await;
        Ok(())
    }
}

/// A handle on one consumed partition. Messages arrive on `recv` in
/// strictly increasing offset order. Close the handle to stop the pump; an
/// unclosed handle leaks its pump task.
pub struct PartitionConsumer<C: Cluster> {
    tp: TopicPartition,
    messages: mpsc::Receiver<Message>,
    errors: mpsc::Receiver<ConsumerError>,
    closing: CancellationToken,
    pump_task: Option<JoinHandle<()>>,
    consumer: Arc<ConsumerInner<C>>,
}

impl<C: Cluster> std::fmt::Debug for PartitionConsumer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionConsumer")
            .field("tp", &self.tp)
            .finish()
    }
}

impl<C: Cluster> PartitionConsumer<C> {
    pub fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    /// Receives the next message; `None` once the pump has terminated and
    /// the channel has drained.
    pub async fn recv(&mut self) -> Option<Message> {
        self.messages.recv().await
    }

    pub fn messages(&mut self) -> &mut mpsc::Receiver<Message> {
        &mut self.messages
    }

    /// Errors are only delivered here when the consumer is configured with
    /// `return_errors`; otherwise they are logged and dropped.
    pub fn errors(&mut self) -> &mut mpsc::Receiver<ConsumerError> {
        &mut self.errors
    }

    /// Stops the pump, waits for it to exit, and drains any errors still
    /// pending, returning them batched.
    pub async fn close(mut self) -> Result<(), ConsumerErrors> {
        self.closing.cancel();
        if let Some(task) = self.pump_task.take() {
            let _ = task.await;
        }

        let mut pending = Vec::new();
        while let Some(error) = self.errors.recv().await {
            pending.push(error);
        }

        self.consumer.children.lock().unwrap().remove(&self.tp);
        self.consumer.mapper.worker_stopped(self.tp.clone());

        if pending.is_empty() {
            Ok(())
        } else {
            Err(ConsumerErrors(pending))
        }
    }
}
