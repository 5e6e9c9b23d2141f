use std::sync::Arc;
use std::time::Instant;

use kafka_protocol::messages::fetch_request::{FetchPartition, FetchTopic};
use kafka_protocol::messages::{FetchRequest as WireFetchRequest, FetchResponse, TopicName};
use kafka_protocol::protocol::StrBytes;
use log::{debug, info};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::BrokerConnection;
use crate::config::ConsumerConfig;
use crate::mapper;

use super::ConsumerErrorKind;

/// One partition consumer's ask: fetch from `offset`, at most `max_bytes`,
/// answer on `reply_to`.
pub(crate) struct FetchRequest {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub max_bytes: i32,
    pub lag: i64,
    pub reply_to: mpsc::Sender<FetchResult>,
}

/// The response is shared by reference across every requester in the batch;
/// each partition consumer extracts its own block.
pub(crate) type FetchResult = Result<Arc<FetchResponse>, ConsumerErrorKind>;

/// Aggregates fetch requests from all partition consumers bound to one
/// broker into single batched fetches, and fans responses back out.
///
/// Two tasks: a batcher that accumulates requests while the previous batch
/// is in flight, and an executor that drives the connection. The channel
/// between them has capacity one and is only offered a batch when the
/// accumulator is non-empty, so there is no fixed batching window.
pub struct BrokerConsumer<C: BrokerConnection> {
    conn: Arc<C>,
    requests_tx: mpsc::Sender<FetchRequest>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: BrokerConnection> BrokerConsumer<C> {
    pub(crate) fn spawn(conn: Arc<C>, config: ConsumerConfig) -> Self {
        let (requests_tx, requests_rx) = mpsc::channel(1);
        let (batches_tx, batches_rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();

        let batcher = tokio::spawn(batch_requests(requests_rx, batches_tx, shutdown.clone()));
        let executor = tokio::spawn(execute_batches(conn.clone(), batches_rx, config));

        Self {
            conn,
            requests_tx,
            shutdown,
            tasks: Mutex::new(vec![batcher, executor]),
        }
    }

    /// Intake for partition consumers. A send error means the executor has
    /// been stopped and the sender should request reassignment.
    pub(crate) fn requests(&self) -> mpsc::Sender<FetchRequest> {
        self.requests_tx.clone()
    }
}

impl<C: BrokerConnection> mapper::Executor for BrokerConsumer<C> {
    fn broker_id(&self) -> i32 {
        self.conn.id()
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }
    }
}

/// Collects fetch requests into a batch while the executor is busy with the
/// previous one, and hands the batch over the moment the executor is free.
async fn batch_requests(
    mut requests_rx: mpsc::Receiver<FetchRequest>,
    batches_tx: mpsc::Sender<Vec<FetchRequest>>,
    shutdown: CancellationToken,
) {
    let mut batch: Vec<FetchRequest> = Vec::new();
    loop {
        tokio::select! {
            maybe = requests_rx.recv() => match maybe {
                Some(request) => batch.push(request),
                None => break,
            },
            permit = batches_tx.reserve(), if !batch.is_empty() => match permit {
                Ok(permit) => permit.send(std::mem::take(&mut batch)),
                Err(_) => return,
            },
            _ = shutdown.cancelled() => break,
        }
    }
    // Drain whatever is still queued so no requester is left hanging, then
    // drop batches_tx to let the executor run down.
    requests_rx.close();
    while let Ok(request) = requests_rx.try_recv() {
        batch.push(request);
    }
    if !batch.is_empty() {
        let _ = batches_tx.send(batch).await;
    }
}

async fn execute_batches<C: BrokerConnection>(
    conn: Arc<C>,
    mut batches_rx: mpsc::Receiver<Vec<FetchRequest>>,
    config: ConsumerConfig,
) {
    let mut last_err: Option<(ConsumerErrorKind, Instant)> = None;
    while let Some(batch) = batches_rx.recv().await {
        // Reject fetches for a while after a connection failure to give the
        // cluster time to recuperate.
        if let Some((err, at)) = &last_err {
            if at.elapsed() < config.retry_backoff {
                for request in &batch {
                    let _ = request.reply_to.try_send(Err(err.clone()));
                }
                continue;
            }
        }

        let wire = build_fetch_request(&batch, &config);
        debug!(
            "broker {}: fetching {} blocks, max lag {}",
            conn.id(),
            batch.len(),
            batch.iter().map(|r| r.lag).max().unwrap_or(0)
        );
        match conn.fetch(wire).await {
            Ok(response) => {
                let response = Arc::new(response);
                for request in &batch {
                    let _ = request.reply_to.try_send(Ok(response.clone()));
                }
            }
            Err(e) => {
                info!("broker {}: connection reset: {}", conn.id(), e);
                let kind = ConsumerErrorKind::Transport(Arc::new(e));
                last_err = Some((kind.clone(), Instant::now()));
                conn.close().await;
                for request in &batch {
                    let _ = request.reply_to.try_send(Err(kind.clone()));
                }
            }
        }
    }
}

fn build_fetch_request(batch: &[FetchRequest], config: &ConsumerConfig) -> WireFetchRequest {
    let mut topics: Vec<FetchTopic> = Vec::new();
    for request in batch {
        let partition = FetchPartition::default()
            .with_partition(request.partition)
            .with_fetch_offset(request.offset)
            .with_partition_max_bytes(request.max_bytes);
        match topics.iter_mut().find(|t| &*t.topic.0 == request.topic.as_str()) {
            Some(topic) => topic.partitions.push(partition),
            None => topics.push(
                FetchTopic::default()
                    .with_topic(TopicName(StrBytes::from_string(request.topic.clone())))
                    .with_partitions(vec![partition]),
            ),
        }
    }
    WireFetchRequest::default()
        .with_min_bytes(config.fetch_min_bytes)
        .with_max_wait_ms(config.fetch_max_wait.as_millis() as i32)
        .with_topics(topics)
}
