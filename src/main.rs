use std::sync::Arc;

use envconfig::Envconfig;
use log::info;

use kafkagate::client::KafkaClient;
use kafkagate::config::Config;
use kafkagate::consumer::Consumer;
use kafkagate::gateway::Gateway;
use kafkagate::server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Config::init_from_env()?;
    info!("starting consume gateway, brokers: {}", config.brokers);

    let client = Arc::new(KafkaClient::new(
        config.broker_list(),
        config.client_id.clone(),
    ));
    let consumer = Consumer::new(client.clone(), config.consumer()).await?;
    let gateway = Arc::new(Gateway::new(
        client,
        consumer,
        config.request_timeout(),
        config.max_pending_requests,
    ));

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    };
    server::serve(&config.listen_addr, gateway.clone(), shutdown).await?;

    gateway.close().await;
    info!("gateway stopped");
    Ok(())
}
