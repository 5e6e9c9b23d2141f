use std::future::Future;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::client::Cluster;
use crate::consumer::{Message, StartOffset};
use crate::gateway::{Gateway, GatewayError};

/// API error envelope: `{"error": "..."}` with the status the consume
/// semantics prescribe.
#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Gateway(GatewayError),
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        ApiError::Gateway(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Gateway(e) => {
                let status = match &e {
                    GatewayError::RequestTimeout(_) => StatusCode::REQUEST_TIMEOUT,
                    GatewayError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
                    GatewayError::UnknownTopicOrPartition(_) | GatewayError::NotConsuming(_) => {
                        StatusCode::NOT_FOUND
                    }
                    GatewayError::ConsumptionStopped { .. } | GatewayError::Consumer(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    error!("request failed: {}", e);
                }
                (status, e.to_string())
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Deserialize)]
struct ConsumeParams {
    partition: i32,
    offset: Option<String>,
}

#[derive(Serialize)]
struct ConsumeResponse {
    key: Option<String>,
    value: Option<String>,
    partition: i32,
    offset: i64,
    high_water_mark: i64,
}

impl From<Message> for ConsumeResponse {
    fn from(message: Message) -> Self {
        ConsumeResponse {
            key: message.key.as_deref().map(|k| BASE64.encode(k)),
            value: message.value.as_deref().map(|v| BASE64.encode(v)),
            partition: message.partition,
            offset: message.offset,
            high_water_mark: message.high_water_mark,
        }
    }
}

#[derive(Deserialize)]
struct AckParams {
    partition: i32,
    offset: i64,
}

#[derive(Deserialize)]
struct OffsetsParams {
    partition: i32,
}

#[derive(Serialize)]
struct OffsetsResponse {
    begin: i64,
    end: i64,
    count: i64,
    offset: i64,
    lag: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    metadata: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    sparse_acks: String,
}

fn parse_offset(raw: &str) -> Result<StartOffset, ApiError> {
    match raw {
        "oldest" => Ok(StartOffset::Oldest),
        "newest" => Ok(StartOffset::Newest),
        _ => raw
            .parse::<i64>()
            .map(StartOffset::At)
            .map_err(|_| ApiError::BadRequest(format!("invalid offset: {}", raw))),
    }
}

/// `GET /topics/{topic}/messages?partition=&offset=`
async fn handle_consume<C: Cluster>(
    State(gateway): State<Arc<Gateway<C>>>,
    Path(topic): Path<String>,
    Query(params): Query<ConsumeParams>,
) -> Result<Json<ConsumeResponse>, ApiError> {
    let offset = params.offset.as_deref().map(parse_offset).transpose()?;
    let message = gateway.consume(&topic, params.partition, offset).await?;
    Ok(Json(message.into()))
}

/// `POST /topics/{topic}/acks?partition=&offset=`
async fn handle_ack<C: Cluster>(
    State(gateway): State<Arc<Gateway<C>>>,
    Path(topic): Path<String>,
    Query(params): Query<AckParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    gateway.ack(&topic, params.partition, params.offset).await?;
    Ok(Json(serde_json::json!({})))
}

/// `GET /topics/{topic}/offsets?partition=`
async fn handle_offsets<C: Cluster>(
    State(gateway): State<Arc<Gateway<C>>>,
    Path(topic): Path<String>,
    Query(params): Query<OffsetsParams>,
) -> Result<Json<OffsetsResponse>, ApiError> {
    let view = gateway.offsets(&topic, params.partition).await?;
    Ok(Json(OffsetsResponse {
        begin: view.begin,
        end: view.end,
        count: view.end - view.begin,
        offset: view.offset,
        lag: view.lag,
        metadata: view.metadata,
        sparse_acks: view.sparse_acks,
    }))
}

async fn handle_ping() -> &'static str {
    "pong"
}

pub fn router<C: Cluster>(gateway: Arc<Gateway<C>>) -> Router {
    Router::new()
        .route("/topics/{topic}/messages", get(handle_consume::<C>))
        .route("/topics/{topic}/acks", post(handle_ack::<C>))
        .route("/topics/{topic}/offsets", get(handle_offsets::<C>))
        .route("/_ping", get(handle_ping))
        .with_state(gateway)
}

/// Serves the API over TCP when the address contains a colon, otherwise
/// over a UNIX domain socket at that path.
pub async fn serve<C, F>(addr: &str, gateway: Arc<Gateway<C>>, shutdown: F) -> anyhow::Result<()>
where
    C: Cluster,
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(gateway);
    if addr.contains(':') {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("listening on http://{}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;
    } else {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let _ = std::fs::remove_file(addr);
            let listener = tokio::net::UnixListener::bind(addr)?;
            // The socket is the service's front door; open it up.
            std::fs::set_permissions(addr, std::fs::Permissions::from_mode(0o777))?;
            info!("listening on unix socket {}", addr);
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await?;
        }
        #[cfg(not(unix))]
        anyhow::bail!("unix domain sockets are not supported on this platform");
    }
    Ok(())
}
