//! A mock AMQP 0-9-1 broker used as a test double for programs that publish
//! or consume messages over AMQP.
//!
//! This crate terminates real AMQP client connections, drives the
//! connection/channel handshake and method exchange well enough to fool
//! mainstream client libraries, records what the client did, and exposes an
//! HTTP control/introspection plane so a test harness can inject messages,
//! read back what was published, and wait (with a timeout) for specific
//! protocol events.
//!
//! # Architecture
//!
//! - **`types`**: the wire vocabulary shared by the other modules, field
//!   values, frame type tags, class/method id tables, content-header
//!   properties.
//! - **`codec`**: the AMQP 0-9-1 frame engine, `read_frame`, the field-type
//!   grammar encoder/decoder, and one builder per outgoing method.
//! - **`broker`**: the single process-wide store of exchanges, queues,
//!   bindings, consumers and delivery-tag bookkeeping, plus the awaitable
//!   `wait_*` predicates.
//! - **`connection`**: the per-TCP-connection AMQP state machine built on
//!   top of `codec` and `broker`.
//! - **`http`**: the sideband HTTP/1.1 introspection and injection surface.
//! - **`error`**: the crate-wide error type and the close/http-status policy
//!   each variant implies.
//!
//! # Quick start
//!
//! ```no_run
//! use mock_amqp_broker::broker::BrokerState;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = BrokerState::new("guest", "guest");
//!
//!     let amqp_listener = TcpListener::bind("0.0.0.0:5672").await?;
//!     let http_listener = TcpListener::bind("0.0.0.0:8080").await?;
//!
//!     loop {
//!         tokio::select! {
//!             Ok((stream, _)) = amqp_listener.accept() => {
//!                 let broker = broker.clone();
//!                 tokio::spawn(async move {
//!                     let _ = mock_amqp_broker::connection::serve(stream, broker).await;
//!                 });
//!             }
//!             Ok((stream, _)) = http_listener.accept() => {
//!                 let broker = broker.clone();
//!                 tokio::spawn(async move {
//!                     let _ = mock_amqp_broker::http::serve(stream, broker).await;
//!                 });
//!             }
//!         }
//!     }
//! }
//! ```

pub mod broker;
pub mod codec;
pub mod connection;
pub mod error;
pub mod http;
pub mod types;

pub use broker::{BrokerState, MessageSink};
pub use error::{AmqpError, AmqpResult};

/// Re-export of the handful of types most callers need.
pub mod prelude {
    pub use crate::broker::{BrokerState, MessageSink};
    pub use crate::error::{AmqpError, AmqpResult};
    pub use crate::types::{BasicProperties, FieldValue};
}
