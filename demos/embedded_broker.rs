//! Runs the mock broker the same way `main.rs` does, but as a library call
//! from an embedding test harness: build a `BrokerState`, bind both ports,
//! and accept connections until the process is killed.

use mock_amqp_broker::broker::BrokerState;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let broker = BrokerState::new("guest", "guest");

    let amqp_listener = TcpListener::bind("127.0.0.1:5672").await?;
    let http_listener = TcpListener::bind("127.0.0.1:8080").await?;
    println!("AMQP on 127.0.0.1:5672, HTTP control plane on 127.0.0.1:8080");

    let amqp_broker = broker.clone();
    let amqp_task = tokio::spawn(async move {
        loop {
            let (stream, _) = amqp_listener.accept().await.expect("accept failed");
            let broker = amqp_broker.clone();
            tokio::spawn(async move {
                let _ = mock_amqp_broker::connection::serve(stream, broker).await;
            });
        }
    });

    let http_task = tokio::spawn(async move {
        loop {
            let (stream, _) = http_listener.accept().await.expect("accept failed");
            let broker = broker.clone();
            tokio::spawn(async move {
                let _ = mock_amqp_broker::http::serve(stream, broker).await;
            });
        }
    });

    let _ = tokio::join!(amqp_task, http_task);
    Ok(())
}
