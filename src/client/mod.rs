use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use kafka_protocol::error::ResponseError;
use kafka_protocol::messages::list_offsets_request::{ListOffsetsPartition, ListOffsetsTopic};
use kafka_protocol::messages::metadata_request::MetadataRequestTopic;
use kafka_protocol::messages::{
    ApiKey, BrokerId, FetchRequest, FetchResponse, ListOffsetsRequest, ListOffsetsResponse,
    MetadataRequest, MetadataResponse, TopicName,
};
use kafka_protocol::protocol::StrBytes;
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::Mutex;

mod conn;

pub use conn::BrokerConn;

const METADATA_VERSION: i16 = 1;
const LIST_OFFSETS_VERSION: i16 = 1;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("kafka error: {0:?}")]
    Kafka(ResponseError),
    #[error("unknown topic or partition {0}/{1}")]
    UnknownTopicOrPartition(String, i32),
    #[error("no leader for {0}/{1}")]
    NoLeader(String, i32),
    #[error("not connected to broker {0}")]
    NotConnected(i32),
    #[error("no reachable bootstrap broker")]
    NoBootstrapBroker,
}

/// Which end of a partition's offset range to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetAt {
    Newest,
    Oldest,
}

impl OffsetAt {
    fn timestamp(self) -> i64 {
        match self {
            OffsetAt::Newest => -1,
            OffsetAt::Oldest => -2,
        }
    }
}

/// A live connection to one broker, owned exclusively by whichever fetch
/// executor is bound to it.
pub trait BrokerConnection: Send + Sync + 'static {
    fn id(&self) -> i32;

    fn fetch(
        &self,
        req: FetchRequest,
    ) -> impl Future<Output = Result<FetchResponse, ClientError>> + Send;

    /// Drops the transport. A later leader resolution for this broker
    /// reopens it.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// The two operations the consumer core needs from whatever knows the
/// cluster topology.
pub trait Cluster: Send + Sync + 'static {
    type Conn: BrokerConnection;

    /// Refreshes metadata for the topic and returns a connection to the
    /// current partition leader, opening it if needed.
    fn leader(
        &self,
        topic: &str,
        partition: i32,
    ) -> impl Future<Output = Result<Arc<Self::Conn>, ClientError>> + Send;

    fn get_offset(
        &self,
        topic: &str,
        partition: i32,
        at: OffsetAt,
    ) -> impl Future<Output = Result<i64, ClientError>> + Send;
}

struct ClusterState {
    control: Option<Arc<BrokerConn>>,
    conns: HashMap<i32, Arc<BrokerConn>>,
    broker_addrs: HashMap<i32, String>,
}

/// Kafka cluster client: bootstrap connection handling, per-topic metadata
/// refresh, leader lookup and offset range queries.
pub struct KafkaClient {
    bootstrap: Vec<String>,
    client_id: StrBytes,
    state: Mutex<ClusterState>,
}

impl KafkaClient {
    pub fn new(bootstrap: Vec<String>, client_id: String) -> Self {
        Self {
            bootstrap,
            client_id: StrBytes::from_string(client_id),
            state: Mutex::new(ClusterState {
                control: None,
                conns: HashMap::new(),
                broker_addrs: HashMap::new(),
            }),
        }
    }

    /// Fetches metadata for one topic from any reachable broker.
    async fn refresh_metadata(
        &self,
        state: &mut ClusterState,
        topic: &str,
    ) -> Result<MetadataResponse, ClientError> {
        let request = MetadataRequest::default().with_topics(Some(vec![
            MetadataRequestTopic::default()
                .with_name(Some(TopicName(StrBytes::from_string(topic.to_string())))),
        ]));

        if let Some(control) = state.control.clone() {
            match control
                .request::<_, MetadataResponse>(ApiKey::MetadataKey, METADATA_VERSION, &request)
                .await
            {
                Ok(response) => return self.absorb_brokers(state, response),
                Err(e) => {
                    warn!("metadata refresh on cached broker failed: {}", e);
                    state.control = None;
                }
            }
        }

        for addr in &self.bootstrap {
            let conn = Arc::new(BrokerConn::new(-1, addr.clone(), self.client_id.clone()));
            if let Err(e) = conn.ensure_open().await {
                warn!("bootstrap broker {} unreachable: {}", addr, e);
                continue;
            }
            match conn
                .request::<_, MetadataResponse>(ApiKey::MetadataKey, METADATA_VERSION, &request)
                .await
            {
                Ok(response) => {
                    state.control = Some(conn);
                    return self.absorb_brokers(state, response);
                }
                Err(e) => warn!("metadata request to {} failed: {}", addr, e),
            }
        }
        Err(ClientError::NoBootstrapBroker)
    }

    fn absorb_brokers(
        &self,
        state: &mut ClusterState,
        response: MetadataResponse,
    ) -> Result<MetadataResponse, ClientError> {
        for broker in &response.brokers {
            let id = broker.node_id.0;
            let addr = format!("{}:{}", broker.host, broker.port);
            if state.broker_addrs.get(&id) != Some(&addr) {
                debug!("broker {} is at {}", id, addr);
                state.broker_addrs.insert(id, addr);
                // Address moved: any cached connection is stale.
                state.conns.remove(&id);
            }
        }
        Ok(response)
    }

    fn leader_id(
        response: &MetadataResponse,
        topic: &str,
        partition: i32,
    ) -> Result<i32, ClientError> {
        let topic_meta = response
            .topics
            .iter()
            .find(|t| t.name.as_ref().map(|n| &*n.0) == Some(topic))
            .ok_or_else(|| ClientError::UnknownTopicOrPartition(topic.to_string(), partition))?;
        if let Some(err) = ResponseError::try_from_code(topic_meta.error_code) {
            return Err(match err {
                ResponseError::UnknownTopicOrPartition => {
                    ClientError::UnknownTopicOrPartition(topic.to_string(), partition)
                }
                other => ClientError::Kafka(other),
            });
        }
        let partition_meta = topic_meta
            .partitions
            .iter()
            .find(|p| p.partition_index == partition)
            .ok_or_else(|| ClientError::UnknownTopicOrPartition(topic.to_string(), partition))?;
        if let Some(err) = ResponseError::try_from_code(partition_meta.error_code) {
            if err != ResponseError::ReplicaNotAvailable {
                return Err(ClientError::Kafka(err));
            }
        }
        match partition_meta.leader_id.0 {
            id if id >= 0 => Ok(id),
            _ => Err(ClientError::NoLeader(topic.to_string(), partition)),
        }
    }
}

impl Cluster for KafkaClient {
    type Conn = BrokerConn;

    async fn leader(&self, topic: &str, partition: i32) -> Result<Arc<BrokerConn>, ClientError> {
        let mut state = self.state.lock().await;
        let response = self.refresh_metadata(&mut state, topic).await?;
        let leader = Self::leader_id(&response, topic, partition)?;

        let addr = state
            .broker_addrs
            .get(&leader)
            .cloned()
            .ok_or(ClientError::NoLeader(topic.to_string(), partition))?;
        let conn = state
            .conns
            .entry(leader)
            .or_insert_with(|| Arc::new(BrokerConn::new(leader, addr, self.client_id.clone())))
            .clone();
        conn.ensure_open().await?;
        Ok(conn)
    }

    async fn get_offset(
        &self,
        topic: &str,
        partition: i32,
        at: OffsetAt,
    ) -> Result<i64, ClientError> {
        let conn = self.leader(topic, partition).await?;

        let request = ListOffsetsRequest::default()
            .with_replica_id(BrokerId(-1))
            .with_topics(vec![ListOffsetsTopic::default()
                .with_name(TopicName(StrBytes::from_string(topic.to_string())))
                .with_partitions(vec![ListOffsetsPartition::default()
                    .with_partition_index(partition)
                    .with_timestamp(at.timestamp())])]);
        let response: ListOffsetsResponse = conn
            .request(ApiKey::ListOffsetsKey, LIST_OFFSETS_VERSION, &request)
            .await?;

        let block = response
            .topics
            .iter()
            .find(|t| &*t.name.0 == topic)
            .and_then(|t| t.partitions.iter().find(|p| p.partition_index == partition))
            .ok_or_else(|| ClientError::Protocol("offset response missing block".to_string()))?;
        match ResponseError::try_from_code(block.error_code) {
            Some(ResponseError::UnknownTopicOrPartition) => Err(
                ClientError::UnknownTopicOrPartition(topic.to_string(), partition),
            ),
            Some(err) => Err(ClientError::Kafka(err)),
            None => Ok(block.offset),
        }
    }
}
