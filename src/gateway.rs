use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};

use crate::client::{ClientError, Cluster, OffsetAt};
use crate::consumer::{
    self, Consumer, Message, OffsetTracker, PartitionConsumer, StartOffset, TopicPartition,
};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("timed out waiting for a message on {0}")]
    RequestTimeout(TopicPartition),
    #[error("too many requests pending on {0}")]
    TooManyRequests(TopicPartition),
    #[error("unknown topic or partition {0}")]
    UnknownTopicOrPartition(TopicPartition),
    #[error("not consuming {0}")]
    NotConsuming(TopicPartition),
    #[error("consumption of {tp} stopped: {reason}")]
    ConsumptionStopped { tp: TopicPartition, reason: String },
    #[error(transparent)]
    Consumer(consumer::Error),
}

/// The committed-offset view of one partition, shaped for the offsets API.
pub struct OffsetsView {
    pub begin: i64,
    pub end: i64,
    pub offset: i64,
    pub lag: i64,
    pub metadata: String,
    pub sparse_acks: String,
}

struct PartitionEntry<C: Cluster> {
    // None once the pump has terminated and the handle was closed.
    handle: Mutex<Option<PartitionConsumer<C>>>,
    tracker: std::sync::Mutex<OffsetTracker>,
    pending: Arc<Semaphore>,
}

/// Front of the consumer subsystem: lazily spawns a partition consumer per
/// consumed partition, hands out messages with a bounded wait, and tracks
/// acknowledgements per partition.
pub struct Gateway<C: Cluster> {
    client: Arc<C>,
    consumer: Consumer<C>,
    partitions: Mutex<HashMap<TopicPartition, Arc<PartitionEntry<C>>>>,
    request_timeout: Duration,
    max_pending: usize,
}

impl<C: Cluster> Gateway<C> {
    pub fn new(
        client: Arc<C>,
        consumer: Consumer<C>,
        request_timeout: Duration,
        max_pending: usize,
    ) -> Self {
        Self {
            client,
            consumer,
            partitions: Mutex::new(HashMap::new()),
            request_timeout,
            max_pending,
        }
    }

    /// Waits for the next message on the partition, spawning the consumer
    /// on first touch. `offset` only matters on that first touch.
    pub async fn consume(
        &self,
        topic: &str,
        partition: i32,
        offset: Option<StartOffset>,
    ) -> Result<Message, GatewayError> {
        let tp = TopicPartition::new(topic, partition);
        let entry = self.entry(&tp, offset).await?;

        let _permit = entry
            .pending
            .clone()
            .try_acquire_owned()
            .map_err(|_| GatewayError::TooManyRequests(tp.clone()))?;

        let received = tokio::time::timeout(self.request_timeout, async {
            let mut guard = entry.handle.lock().await;
            let received = match guard.as_mut() {
                Some(consumer) => consumer.recv().await,
                None => return Err(None),
            };
            match received {
                Some(message) => Ok(message),
                // Pump terminated underneath us (offset out of range).
                None => Err(guard.take()),
            }
        })
        .await;

        match received {
            Err(_) => Err(GatewayError::RequestTimeout(tp)),
            Ok(Ok(message)) => Ok(message),
            Ok(Err(stopped_handle)) => {
                // Only evict the entry we were serving; a concurrent
                // request may have replaced it already.
                {
                    let mut partitions = self.partitions.lock().await;
                    if let Some(current) = partitions.get(&tp) {
                        if Arc::ptr_eq(current, &entry) {
                            partitions.remove(&tp);
                        }
                    }
                }
                let reason = match stopped_handle {
                    Some(handle) => match handle.close().await {
                        Ok(()) => "consumer closed".to_string(),
                        Err(errors) => errors.to_string(),
                    },
                    None => "consumer closed".to_string(),
                };
                warn!("dropped partition consumer for {}: {}", tp, reason);
                Err(GatewayError::ConsumptionStopped { tp, reason })
            }
        }
    }

    /// Acknowledges one consumed offset on a partition's tracker.
    pub async fn ack(&self, topic: &str, partition: i32, offset: i64) -> Result<(), GatewayError> {
        let tp = TopicPartition::new(topic, partition);
        let partitions = self.partitions.lock().await;
        let entry = partitions
            .get(&tp)
            .ok_or_else(|| GatewayError::NotConsuming(tp.clone()))?;
        entry.tracker.lock().unwrap().ack(offset);
        Ok(())
    }

    /// The partition's current offset range plus its committable state, if
    /// it is being consumed.
    pub async fn offsets(&self, topic: &str, partition: i32) -> Result<OffsetsView, GatewayError> {
        let tp = TopicPartition::new(topic, partition);
        let end = self.get_offset(&tp, OffsetAt::Newest).await?;
        let begin = self.get_offset(&tp, OffsetAt::Oldest).await?;

        let committable = {
            let partitions = self.partitions.lock().await;
            partitions
                .get(&tp)
                .map(|entry| {
                    let tracker = entry.tracker.lock().unwrap();
                    let (offset, metadata) = tracker.committable();
                    (offset, metadata, tracker.sparse_acks_str())
                })
        };

        Ok(match committable {
            Some((offset, metadata, sparse_acks)) => OffsetsView {
                begin,
                end,
                offset,
                lag: end - offset,
                metadata,
                sparse_acks,
            },
            None => OffsetsView {
                begin,
                end,
                offset: -1,
                lag: 0,
                metadata: String::new(),
                sparse_acks: String::new(),
            },
        })
    }

    /// Closes every partition consumer and then the root consumer.
    pub async fn close(&self) {
        let entries: Vec<_> = self.partitions.lock().await.drain().collect();
        for (tp, entry) in entries {
            if let Some(handle) = entry.handle.lock().await.take() {
                if let Err(errors) = handle.close().await {
                    info!("{} closed with pending errors: {}", tp, errors);
                }
            }
        }
        if let Err(e) = self.consumer.close().await {
            warn!("consumer close failed: {}", e);
        }
    }

    async fn entry(
        &self,
        tp: &TopicPartition,
        offset: Option<StartOffset>,
    ) -> Result<Arc<PartitionEntry<C>>, GatewayError> {
        let mut partitions = self.partitions.lock().await;
        if let Some(entry) = partitions.get(tp) {
            return Ok(entry.clone());
        }

        let (handle, concrete_offset) = self
            .consumer
            .consume_partition(&tp.topic, tp.partition, offset.unwrap_or(StartOffset::Oldest))
            .await
            .map_err(|e| self.map_consumer_error(tp, e))?;
        info!("started consuming {} at offset {}", tp, concrete_offset);

        let entry = Arc::new(PartitionEntry {
            handle: Mutex::new(Some(handle)),
            tracker: std::sync::Mutex::new(OffsetTracker::new(concrete_offset)),
            pending: Arc::new(Semaphore::new(self.max_pending)),
        });
        partitions.insert(tp.clone(), entry.clone());
        Ok(entry)
    }

    async fn get_offset(&self, tp: &TopicPartition, at: OffsetAt) -> Result<i64, GatewayError> {
        self.client
            .get_offset(&tp.topic, tp.partition, at)
            .await
            .map_err(|e| self.map_consumer_error(tp, consumer::Error::Client(e)))
    }

    fn map_consumer_error(&self, tp: &TopicPartition, e: consumer::Error) -> GatewayError {
        match e {
            consumer::Error::Client(ClientError::UnknownTopicOrPartition(..)) => {
                GatewayError::UnknownTopicOrPartition(tp.clone())
            }
            other => GatewayError::Consumer(other),
        }
    }
}
