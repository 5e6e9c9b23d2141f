use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use kafka_protocol::error::ResponseError;
use kafka_protocol::messages::FetchResponse;
use kafka_protocol::records::{Compression, Record, RecordBatchDecoder};
use log::{debug, info};
use tokio::sync::mpsc;
use tokio::time::{sleep, Sleep};
use tokio_util::sync::CancellationToken;

use crate::client::BrokerConnection;
use crate::config::ConsumerConfig;
use crate::mapper::Assignment;

use super::broker::{BrokerConsumer, FetchRequest, FetchResult};
use super::{ConsumerError, ConsumerErrorKind, Message, TopicPartition};

/// The message pump behind one partition consumer handle. Owns the fetch
/// cursor (`offset`, `fetch_size`, `lag`); nothing else ever touches them.
pub(crate) struct PartitionPump<C: BrokerConnection> {
    pub tp: TopicPartition,
    pub config: ConsumerConfig,
    pub assignment_rx: mpsc::Receiver<Assignment<BrokerConsumer<C>>>,
    // Declared before errors_tx: messages must close first on pump exit.
    pub messages_tx: mpsc::Sender<Message>,
    pub errors_tx: mpsc::Sender<ConsumerError>,
    pub closing: CancellationToken,
    pub reassign: Box<dyn Fn() + Send>,
    pub offset: i64,
    pub fetch_size: i32,
    pub lag: i64,
}

impl<C: BrokerConnection> PartitionPump<C> {
    /// Runs the request -> await -> parse -> deliver loop until closed or
    /// the offset goes out of range. Branches are enabled and disabled by
    /// the state flags, one multi-way wait per iteration.
    pub(crate) async fn run(mut self) {
        let (result_tx, mut result_rx) = mpsc::channel::<FetchResult>(1);
        let mut assigned: Option<mpsc::Sender<FetchRequest>> = None;
        let mut want_request = false;
        let mut awaiting_result = false;
        let mut fetched: Vec<Message> = Vec::new();
        let mut next_idx = 0usize;
        let mut last_reassign: Option<Instant> = None;
        let mut retry_timer: Option<Pin<Box<Sleep>>> = None;

        debug!("<{}> pump started at offset {}", self.tp, self.offset);
        'pump: loop {
            // The outbound-request branch is armed only when a request is
            // wanted, an executor is assigned, no fetch is in flight and no
            // fetched messages are still queued for the user.
            let fetch_tx = if want_request && !awaiting_result && next_idx >= fetched.len() {
                assigned.clone()
            } else {
                None
            };

            tokio::select! {
                maybe = self.assignment_rx.recv() => match maybe {
                    None => break 'pump,
                    Some(None) => {
                        assigned = None;
                        want_request = false;
                        self.trigger_or_schedule_reassign(
                            "no broker assigned",
                            &mut last_reassign,
                            &mut retry_timer,
                        );
                    }
                    Some(Some(executor)) => {
                        debug!("<{}> assigned broker {}", self.tp, crate::mapper::Executor::broker_id(&*executor));
                        assigned = Some(executor.requests());
                        retry_timer = None;
                        if !awaiting_result && next_idx >= fetched.len() {
                            want_request = true;
                        }
                    }
                },

                sent = async { fetch_tx.clone().unwrap().reserve_owned().await }, if fetch_tx.is_some() => {
                    match sent {
                        Ok(permit) => {
                            permit.send(FetchRequest {
                                topic: self.tp.topic.clone(),
                                partition: self.tp.partition,
                                offset: self.offset,
                                max_bytes: self.fetch_size,
                                lag: self.lag,
                                reply_to: result_tx.clone(),
                            });
                            want_request = false;
                            awaiting_result = true;
                        }
                        Err(_) => {
                            // The executor stopped between assignment and
                            // send; get a fresh one.
                            assigned = None;
                            want_request = false;
                            self.trigger_or_schedule_reassign(
                                "executor stopped",
                                &mut last_reassign,
                                &mut retry_timer,
                            );
                        }
                    }
                }

                Some(result) = result_rx.recv(), if awaiting_result => {
                    awaiting_result = false;
                    match self.parse_fetch_result(result) {
                        Err(kind) => {
                            info!("<{}> fetch failed: {}", self.tp, kind);
                            let fatal = matches!(kind, ConsumerErrorKind::OffsetOutOfRange);
                            self.report_error(kind);
                            if fatal {
                                // Retrying cannot help; give up.
                                break 'pump;
                            }
                            assigned = None;
                            want_request = false;
                            self.trigger_or_schedule_reassign(
                                "fetch error",
                                &mut last_reassign,
                                &mut retry_timer,
                            );
                        }
                        Ok(messages) if messages.is_empty() => {
                            want_request = true;
                        }
                        Ok(messages) => {
                            fetched = messages;
                            next_idx = 0;
                        }
                    }
                }

                delivery = async { self.messages_tx.clone().reserve_owned().await }, if next_idx < fetched.len() => {
                    match delivery {
                        Ok(permit) => {
                            let message = fetched[next_idx].clone();
                            self.offset = message.offset + 1;
                            permit.send(message);
                            next_idx += 1;
                            if next_idx >= fetched.len() {
                                fetched.clear();
                                next_idx = 0;
                                want_request = true;
                            }
                        }
                        Err(_) => break 'pump,
                    }
                }

                _ = async { retry_timer.as_mut().unwrap().await }, if retry_timer.is_some() => {
                    info!("<{}> reassign triggered by timeout", self.tp);
                    (self.reassign)();
                    last_reassign = Some(Instant::now());
                    retry_timer = Some(Box::pin(sleep(self.config.retry_backoff)));
                }

                _ = self.closing.cancelled() => break 'pump,
            }
        }

        debug!("<{}> pump stopped at offset {}", self.tp, self.offset);
        // Close the user-facing channels in order: messages, then errors.
        // Completion of the pump task is the final `closed` signal.
        drop(self.messages_tx);
        drop(self.errors_tx);
    }

    /// Forwards a reassignment to the mapper unless one was forwarded less
    /// than a backoff ago, and (re)arms the retry timer either way.
    fn trigger_or_schedule_reassign(
        &self,
        reason: &str,
        last_reassign: &mut Option<Instant>,
        retry_timer: &mut Option<Pin<Box<Sleep>>>,
    ) {
        let now = Instant::now();
        if last_reassign.map_or(true, |at| now.duration_since(at) > self.config.retry_backoff) {
            info!("<{}> trigger reassign: {}", self.tp, reason);
            *last_reassign = Some(now);
            (self.reassign)();
        } else {
            info!("<{}> schedule reassign: {}", self.tp, reason);
        }
        *retry_timer = Some(Box::pin(sleep(self.config.retry_backoff)));
    }

    /// Applies the fetch-result rules: propagate errors, adapt the fetch
    /// size on a partial trailing message, drop overlap below the cursor.
    fn parse_fetch_result(
        &mut self,
        result: FetchResult,
    ) -> Result<Vec<Message>, ConsumerErrorKind> {
        let response: Arc<FetchResponse> = result?;

        let block = response
            .responses
            .iter()
            .find(|t| &*t.topic.0 == self.tp.topic.as_str())
            .and_then(|t| {
                t.partitions
                    .iter()
                    .find(|p| p.partition_index == self.tp.partition)
            })
            .ok_or(ConsumerErrorKind::IncompleteResponse)?;

        if let Some(err) = ResponseError::try_from_code(block.error_code) {
            if err == ResponseError::OffsetOutOfRange {
                return Err(ConsumerErrorKind::OffsetOutOfRange);
            }
            return Err(ConsumerErrorKind::Kafka(err));
        }

        let (records, partial_trailing) = decode_record_set(block.records.as_ref());
        if records.is_empty() {
            // Nothing but possibly a trailing cut-off message: either the
            // fetch size is too small to carry it, or the partition is
            // simply empty and we poll again.
            if partial_trailing {
                if self.config.fetch_max_bytes > 0 && self.fetch_size == self.config.fetch_max_bytes
                {
                    info!("<{}> oversized message skipped: offset={}", self.tp, self.offset);
                    self.report_error(ConsumerErrorKind::MessageTooLarge);
                    self.offset += 1;
                } else {
                    self.fetch_size *= 2;
                    if self.config.fetch_max_bytes > 0
                        && self.fetch_size > self.config.fetch_max_bytes
                    {
                        self.fetch_size = self.config.fetch_max_bytes;
                    }
                }
            }
            return Ok(Vec::new());
        }

        // Data came back, so the window is wide enough again.
        self.fetch_size = self.config.fetch_default_bytes;

        let mut messages = Vec::new();
        for record in records {
            // Compressed batches are returned whole and may overlap the
            // cursor; skip anything already delivered.
            if record.offset < self.offset {
                continue;
            }
            self.lag = block.high_watermark - record.offset;
            messages.push(Message {
                key: record.key,
                value: record.value,
                topic: self.tp.topic.clone(),
                partition: self.tp.partition,
                offset: record.offset,
                high_water_mark: block.high_watermark,
            });
        }
        if messages.is_empty() {
            return Err(ConsumerErrorKind::IncompleteResponse);
        }
        Ok(messages)
    }

    fn report_error(&self, kind: ConsumerErrorKind) {
        if !self.config.return_errors {
            return;
        }
        let error = ConsumerError {
            topic: self.tp.topic.clone(),
            partition: self.tp.partition,
            kind,
        };
        // Non-blocking: a full errors channel drops the error, the log
        // line above is the fallback.
        let _ = self.errors_tx.try_send(error);
    }
}

/// Decodes a fetch block's record set. A present-but-undecodable payload is
/// a partial trailing message: the fetch size did not cover one whole
/// message, and the caller reacts by growing it.
fn decode_record_set(records: Option<&Bytes>) -> (Vec<Record>, bool) {
    let Some(bytes) = records else {
        return (Vec::new(), false);
    };
    if bytes.is_empty() {
        return (Vec::new(), false);
    }
    let mut buf = bytes.clone();
    match RecordBatchDecoder::decode::<_, fn(&mut Bytes, Compression) -> anyhow::Result<Bytes>>(
        &mut buf, None,
    ) {
        Ok(records) if !records.is_empty() => (records, false),
        Ok(_) => (Vec::new(), true),
        Err(_) => (Vec::new(), true),
    }
}
