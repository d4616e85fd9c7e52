//! Process entry point: reads the seed credentials from the environment,
//! builds the shared broker state, and spawns one accept loop for the AMQP
//! port and one for the HTTP control port, each handing accepted sockets off
//! to their own task.

use mock_amqp_broker::broker::BrokerState;
use tokio::net::TcpListener;

const AMQP_ADDR: &str = "0.0.0.0:5672";
const HTTP_ADDR: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let default_user = std::env::var("DEFAULT_USER").unwrap_or_else(|_| "guest".to_string());
    let default_password = std::env::var("DEFAULT_PASSWORD").unwrap_or_else(|_| "guest".to_string());
    let broker = BrokerState::new(default_user, default_password);

    let amqp_listener = TcpListener::bind(AMQP_ADDR).await?;
    log::info!("AMQP listening on {AMQP_ADDR}");
    let http_listener = TcpListener::bind(HTTP_ADDR).await?;
    log::info!("HTTP control plane listening on {HTTP_ADDR}");

    let amqp_broker = broker.clone();
    let amqp_task = tokio::spawn(async move {
        loop {
            match amqp_listener.accept().await {
                Ok((stream, peer)) => {
                    log::debug!("accepted AMQP connection from {peer}");
                    let broker = amqp_broker.clone();
                    tokio::spawn(async move {
                        if let Err(err) = mock_amqp_broker::connection::serve(stream, broker).await {
                            log::warn!("AMQP connection from {peer} ended with an error: {err}");
                        }
                    });
                }
                Err(err) => log::warn!("failed to accept AMQP connection: {err}"),
            }
        }
    });

    let http_broker = broker;
    let http_task = tokio::spawn(async move {
        loop {
            match http_listener.accept().await {
                Ok((stream, peer)) => {
                    log::debug!("accepted HTTP connection from {peer}");
                    let broker = http_broker.clone();
                    tokio::spawn(async move {
                        if let Err(err) = mock_amqp_broker::http::serve(stream, broker).await {
                            log::warn!("HTTP connection from {peer} ended with an error: {err}");
                        }
                    });
                }
                Err(err) => log::warn!("failed to accept HTTP connection: {err}"),
            }
        }
    });

    tokio::try_join!(amqp_task, http_task)?;
    Ok(())
}
