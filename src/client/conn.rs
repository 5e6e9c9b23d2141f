use bytes::BytesMut;
use kafka_protocol::messages::{ApiKey, FetchRequest, FetchResponse, RequestHeader, ResponseHeader};
use kafka_protocol::protocol::{Decodable, Encodable, StrBytes};
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::{BrokerConnection, ClientError};

const MAX_MESSAGE_SIZE: i32 = 104_857_600; // 100MB

/// Fetch is pinned to v4: record-batch payloads and high watermarks without
/// the session machinery of later versions.
pub(crate) const FETCH_VERSION: i16 = 4;

struct ConnInner {
    stream: Option<TcpStream>,
    correlation_id: i32,
}

/// A single TCP connection to one broker. At most one request is in flight
/// at a time; the fetch batching layer is what amortises the round-trip.
pub struct BrokerConn {
    id: i32,
    addr: String,
    client_id: StrBytes,
    inner: Mutex<ConnInner>,
}

impl BrokerConn {
    pub fn new(id: i32, addr: String, client_id: StrBytes) -> Self {
        Self {
            id,
            addr,
            client_id,
            inner: Mutex::new(ConnInner {
                stream: None,
                correlation_id: 0,
            }),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Establishes the TCP stream if the connection is currently closed.
    pub async fn ensure_open(&self) -> Result<(), ClientError> {
        let mut inner = self.inner.lock().await;
        if inner.stream.is_none() {
            info!("connecting to broker {} at {}", self.id, self.addr);
            let stream = TcpStream::connect(&self.addr).await?;
            stream.set_nodelay(true)?;
            inner.stream = Some(stream);
        }
        Ok(())
    }

    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.stream.is_some()
    }

    /// Issues one size-prefixed request and reads the matching response.
    /// Any transport error leaves the connection closed.
    pub async fn request<Req, Resp>(
        &self,
        api_key: ApiKey,
        version: i16,
        req: &Req,
    ) -> Result<Resp, ClientError>
    where
        Req: Encodable,
        Resp: Decodable,
    {
        let mut inner = self.inner.lock().await;
        inner.correlation_id += 1;
        let correlation_id = inner.correlation_id;

        let stream = inner
            .stream
            .as_mut()
            .ok_or(ClientError::NotConnected(self.id))?;

        let header = RequestHeader::default()
            .with_request_api_key(api_key as i16)
            .with_request_api_version(version)
            .with_correlation_id(correlation_id)
            .with_client_id(Some(self.client_id.clone()));

        let mut buf = BytesMut::new();
        header
            .encode(&mut buf, api_key.request_header_version(version))
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        req.encode(&mut buf, version)
            .map_err(|e| ClientError::Protocol(e.to_string()))?;

        debug!(
            "broker {}: sending {:?} v{} correlation_id={} ({} bytes)",
            self.id,
            api_key,
            version,
            correlation_id,
            buf.len()
        );

        let result = Self::exchange(stream, &buf).await;
        let mut payload = match result {
            Ok(payload) => payload,
            Err(e) => {
                warn!("broker {}: transport error: {}", self.id, e);
                inner.stream = None;
                return Err(e.into());
            }
        };

        let resp_header =
            ResponseHeader::decode(&mut payload, api_key.response_header_version(version))
                .map_err(|e| ClientError::Protocol(e.to_string()))?;
        if resp_header.correlation_id != correlation_id {
            inner.stream = None;
            return Err(ClientError::Protocol(format!(
                "correlation id mismatch: sent {}, received {}",
                correlation_id, resp_header.correlation_id
            )));
        }

        Resp::decode(&mut payload, version).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    async fn exchange(stream: &mut TcpStream, buf: &[u8]) -> std::io::Result<bytes::Bytes> {
        stream.write_i32(buf.len() as i32).await?;
        stream.write_all(buf).await?;
        stream.flush().await?;

        let size = stream.read_i32().await?;
        if size <= 0 || size > MAX_MESSAGE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid response size: {}", size),
            ));
        }
        let mut payload = BytesMut::with_capacity(size as usize);
        payload.resize(size as usize, 0);
        stream.read_exact(&mut payload).await?;
        Ok(payload.freeze())
    }
}

impl BrokerConnection for BrokerConn {
    fn id(&self) -> i32 {
        self.id
    }

    async fn fetch(&self, req: FetchRequest) -> Result<FetchResponse, ClientError> {
        self.request(ApiKey::FetchKey, FETCH_VERSION, &req).await
    }

    async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.stream.take().is_some() {
            info!("closed connection to broker {}", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kafka_protocol::messages::api_versions_response::ApiVersion;
    use kafka_protocol::messages::{ApiVersionsRequest, ApiVersionsResponse};

    // Drives a real request/response exchange over a loopback socket with a
    // scripted single-shot broker.
    #[tokio::test]
    async fn request_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let size = socket.read_i32().await.unwrap();
            let mut request = BytesMut::with_capacity(size as usize);
            request.resize(size as usize, 0);
            socket.read_exact(&mut request).await.unwrap();
            let mut request = request.freeze();

            let header = RequestHeader::decode(
                &mut request,
                ApiKey::ApiVersionsKey.request_header_version(0),
            )
            .unwrap();
            assert_eq!(header.request_api_key, ApiKey::ApiVersionsKey as i16);

            let response = ApiVersionsResponse::default().with_api_keys(vec![ApiVersion::default()
                .with_api_key(ApiKey::FetchKey as i16)
                .with_min_version(0)
                .with_max_version(13)]);
            let mut buf = BytesMut::new();
            ResponseHeader::default()
                .with_correlation_id(header.correlation_id)
                .encode(&mut buf, ApiKey::ApiVersionsKey.response_header_version(0))
                .unwrap();
            response.encode(&mut buf, 0).unwrap();
            socket.write_i32(buf.len() as i32).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let conn = BrokerConn::new(7, addr.to_string(), StrBytes::from_static_str("test"));
        conn.ensure_open().await.unwrap();
        let resp: ApiVersionsResponse = conn
            .request(ApiKey::ApiVersionsKey, 0, &ApiVersionsRequest::default())
            .await
            .unwrap();
        assert_eq!(resp.api_keys.len(), 1);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn request_on_closed_connection_fails() {
        let conn = BrokerConn::new(1, "127.0.0.1:1".to_string(), StrBytes::from_static_str("test"));
        let err = conn
            .request::<_, FetchResponse>(ApiKey::FetchKey, FETCH_VERSION, &FetchRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected(1)));
    }
}
