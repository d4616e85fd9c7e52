//! Shows the flow a test harness drives purely through `BrokerState`: seed
//! an exchange/queue/binding the way AMQP `exchange.declare` + `queue.declare`
//! + `queue.bind` would, publish a message the way the HTTP
//! `/add-message-on/{exchange}` route would, then wait on the same
//! `wait_message_acknowledged` predicate the HTTP control plane exposes.

use mock_amqp_broker::broker::BrokerState;
use mock_amqp_broker::types::BasicProperties;

#[tokio::main]
async fn main() {
    let broker = BrokerState::new("guest", "guest");

    broker.declare_exchange("orders", "direct");
    broker.declare_queue("orders.incoming");
    broker.bind_queue("orders.incoming", "orders");

    let properties = BasicProperties {
        content_type: Some("application/json".to_string()),
        ..Default::default()
    };
    let tag = broker
        .publish_message("orders", properties, br#"{"order_id": 42}"#.to_vec())
        .expect("exchange exists");
    println!("published with delivery tag {tag}");

    let messages = broker.get_messages_of_queue("orders.incoming").unwrap();
    println!("queue now holds {} message(s): {messages:?}", messages.len());

    broker.message_ack(tag);
    broker
        .wait_message_acknowledged(tag)
        .await
        .expect("ack was recorded synchronously above, so this resolves immediately");
    println!("delivery tag {tag} confirmed acknowledged");
}
