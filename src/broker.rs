//! Shared broker state: exchanges, queues, bindings, delivery-tag bookkeeping,
//! and the awaitable predicates the HTTP control plane waits on.
//!
//! There is exactly one `BrokerState` per process. It is cloned
//! (cheaply, it's an `Arc` handle) into every accepted AMQP and HTTP
//! connection task. Every mutating method takes the lock, does its work, and
//! returns; the only methods that ever suspend are the `wait_*` predicates,
//! which poll the guarded state at a fixed interval rather than holding the
//! lock across an `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::{json, Value};

use crate::error::{AmqpError, AmqpResult};
use crate::types::BasicProperties;

const DEFAULT_EXCHANGE: &str = "";
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// One message as stored for introspection.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

impl StoredMessage {
    /// Render for the HTTP introspection surface: UTF-8 bodies become
    /// strings, anything else is base64-encoded with a `base64: true` flag.
    pub fn to_json(&self) -> Value {
        use base64::Engine as _;

        let headers = self.properties.to_json_map();
        match std::str::from_utf8(&self.body) {
            Ok(text) => json!({ "headers": headers, "body": text }),
            Err(_) => json!({
                "headers": headers,
                "body": base64::engine::general_purpose::STANDARD.encode(&self.body),
                "base64": true,
            }),
        }
    }
}

/// The thing a registered consumer can be pushed a delivery through.
/// `Connection` implements this over a channel to its own
/// socket-writer task; the broker never holds a raw connection reference.
pub trait MessageSink: Send + Sync {
    fn push(
        &self,
        channel: u16,
        consumer_tag: &str,
        delivery_tag: u32,
        exchange: &str,
        routing_key: &str,
        properties: &BasicProperties,
        body: &[u8],
    );

    /// Non-blocking probe used to reap consumers whose transport died
    /// without the broker hearing about it directly.
    fn is_closed(&self) -> bool;
}

struct Consumer {
    sink: Arc<dyn MessageSink>,
    channel: u16,
}

pub struct Exchange {
    pub exchange_type: String,
    pub messages: Vec<StoredMessage>,
}

pub struct Queue {
    pub messages: Vec<StoredMessage>,
    consumers: HashMap<String, Consumer>,
}

impl Queue {
    fn new() -> Self {
        Queue {
            messages: Vec::new(),
            consumers: HashMap::new(),
        }
    }

    pub fn consumer_count(&self) -> u32 {
        self.consumers.len() as u32
    }
}

struct Inner {
    users: HashMap<String, String>,
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    bindings: HashMap<String, HashSet<String>>,
    acknowledged: HashSet<u32>,
    not_acknowledged: HashSet<u32>,
    requeued: HashSet<u32>,
    authentication_tried_on: HashMap<String, bool>,
}

impl Inner {
    fn new(user: String, password: String) -> Self {
        let mut users = HashMap::new();
        users.insert(user, password);
        let mut exchanges = HashMap::new();
        exchanges.insert(
            DEFAULT_EXCHANGE.to_string(),
            Exchange {
                exchange_type: "direct".to_string(),
                messages: Vec::new(),
            },
        );
        let mut bindings = HashMap::new();
        bindings.insert(DEFAULT_EXCHANGE.to_string(), HashSet::new());
        Inner {
            users,
            exchanges,
            queues: HashMap::new(),
            bindings,
            acknowledged: HashSet::new(),
            not_acknowledged: HashSet::new(),
            requeued: HashSet::new(),
            authentication_tried_on: HashMap::new(),
        }
    }

    fn reset(&mut self) {
        self.exchanges.clear();
        self.exchanges.insert(
            DEFAULT_EXCHANGE.to_string(),
            Exchange {
                exchange_type: "direct".to_string(),
                messages: Vec::new(),
            },
        );
        self.queues.clear();
        self.bindings.clear();
        self.bindings
            .insert(DEFAULT_EXCHANGE.to_string(), HashSet::new());
        self.acknowledged.clear();
        self.not_acknowledged.clear();
        self.requeued.clear();
        self.authentication_tried_on.clear();
    }

    fn random_delivery_tag(&self) -> u32 {
        rand::thread_rng().gen_range(1..=u32::MAX / 2)
    }

    /// Deliver to exactly one live consumer of `queue`, garbage-collecting
    /// any dead ones found along the way. Falls back to buffering the
    /// message in the queue's own log when nobody is listening.
    fn dispatch_to_queue(
        &mut self,
        queue_name: &str,
        delivery_tag: u32,
        exchange: &str,
        routing_key: &str,
        properties: &BasicProperties,
        body: &[u8],
    ) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        let dead: Vec<String> = queue
            .consumers
            .iter()
            .filter(|(_, c)| c.sink.is_closed())
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in dead {
            queue.consumers.remove(&tag);
        }
        if let Some((tag, consumer)) = queue.consumers.iter().next() {
            consumer.sink.push(
                consumer.channel,
                tag,
                delivery_tag,
                exchange,
                routing_key,
                properties,
                body,
            );
        } else {
            queue.messages.push(StoredMessage {
                properties: properties.clone(),
                body: body.to_vec(),
            });
        }
    }
}

/// Shared handle to the single process-wide broker store.
#[derive(Clone)]
pub struct BrokerState {
    inner: Arc<Mutex<Inner>>,
}

impl BrokerState {
    pub fn new(default_user: impl Into<String>, default_password: impl Into<String>) -> Self {
        BrokerState {
            inner: Arc::new(Mutex::new(Inner::new(default_user.into(), default_password.into()))),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn check_credentials(&self, username: &str, password: &[u8]) -> bool {
        let mut inner = self.lock();
        let ok = inner
            .users
            .get(username)
            .map(|expected| expected.as_bytes() == password)
            .unwrap_or(false);
        inner.authentication_tried_on.insert(username.to_string(), ok);
        ok
    }

    pub fn declare_exchange(&self, name: &str, exchange_type: &str) -> bool {
        let mut inner = self.lock();
        if let Some(existing) = inner.exchanges.get(name) {
            return existing.exchange_type == exchange_type;
        }
        inner.exchanges.insert(
            name.to_string(),
            Exchange {
                exchange_type: exchange_type.to_string(),
                messages: Vec::new(),
            },
        );
        inner.bindings.entry(name.to_string()).or_default();
        true
    }

    /// Returns `(message_count, consumer_count)`; both are informational
    /// only, `queue.declare-ok` always reports zero regardless.
    pub fn declare_queue(&self, name: &str) -> (u32, u32) {
        let mut inner = self.lock();
        if !inner.queues.contains_key(name) {
            inner.queues.insert(name.to_string(), Queue::new());
            inner
                .bindings
                .entry(DEFAULT_EXCHANGE.to_string())
                .or_default()
                .insert(name.to_string());
        }
        let queue = &inner.queues[name];
        (queue.messages.len() as u32, queue.consumer_count())
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn bind_queue(&self, queue: &str, exchange: &str) -> bool {
        let mut inner = self.lock();
        if !inner.queues.contains_key(queue) || !inner.exchanges.contains_key(exchange) {
            return false;
        }
        inner
            .bindings
            .entry(exchange.to_string())
            .or_default()
            .insert(queue.to_string());
        true
    }

    pub fn register_consumer(
        &self,
        sink: Arc<dyn MessageSink>,
        consumer_tag: &str,
        queue: &str,
        channel: u16,
    ) -> bool {
        let mut inner = self.lock();
        let Some(q) = inner.queues.get_mut(queue) else {
            return false;
        };
        q.consumers
            .insert(consumer_tag.to_string(), Consumer { sink, channel });
        true
    }

    pub fn unregister_consumer(&self, queue: &str, consumer_tag: &str) {
        let mut inner = self.lock();
        if let Some(q) = inner.queues.get_mut(queue) {
            q.consumers.remove(consumer_tag);
        }
    }

    /// Append-only store used by the inbound AMQP publish path: writes to
    /// the exchange log and every bound queue's log, without attempting
    /// consumer dispatch.
    pub fn store_message(&self, exchange: &str, properties: BasicProperties, body: Vec<u8>) -> bool {
        let mut inner = self.lock();
        if !inner.exchanges.contains_key(exchange) {
            return false;
        }
        let bound: Vec<String> = inner
            .bindings
            .get(exchange)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        let msg = StoredMessage {
            properties,
            body,
        };
        inner
            .exchanges
            .get_mut(exchange)
            .unwrap()
            .messages
            .push(msg.clone());
        for queue_name in bound {
            if let Some(q) = inner.queues.get_mut(&queue_name) {
                q.messages.push(msg.clone());
            }
        }
        true
    }

    /// Publish-and-dispatch path used by the HTTP injection routes: appends
    /// to the exchange log, then delivers to one live consumer per bound
    /// queue (buffering in the queue log if none is listening).
    pub fn publish_message(
        &self,
        exchange: &str,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> Option<u32> {
        let mut inner = self.lock();
        if !inner.exchanges.contains_key(exchange) {
            return None;
        }
        let tag = inner.random_delivery_tag();
        inner.exchanges.get_mut(exchange).unwrap().messages.push(StoredMessage {
            properties: properties.clone(),
            body: body.clone(),
        });
        let bound: Vec<String> = inner
            .bindings
            .get(exchange)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        for queue_name in bound {
            inner.dispatch_to_queue(&queue_name, tag, exchange, "", &properties, &body);
        }
        Some(tag)
    }

    /// Same as `publish_message` but bypasses exchange routing entirely,
    /// targeting one queue directly.
    pub fn publish_message_in_queue(
        &self,
        queue: &str,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> Option<u32> {
        let mut inner = self.lock();
        if !inner.queues.contains_key(queue) {
            return None;
        }
        let tag = inner.random_delivery_tag();
        inner.dispatch_to_queue(queue, tag, DEFAULT_EXCHANGE, "", &properties, &body);
        Some(tag)
    }

    pub fn get_messages_of_queue(&self, queue: &str) -> Option<Vec<Value>> {
        let inner = self.lock();
        inner
            .queues
            .get(queue)
            .map(|q| q.messages.iter().map(StoredMessage::to_json).collect())
    }

    pub fn get_messages_of_exchange(&self, exchange: &str) -> Option<Vec<Value>> {
        let inner = self.lock();
        inner
            .exchanges
            .get(exchange)
            .map(|e| e.messages.iter().map(StoredMessage::to_json).collect())
    }

    pub fn delete_messages_of_queue(&self, queue: &str) -> bool {
        let mut inner = self.lock();
        match inner.queues.get_mut(queue) {
            Some(q) => {
                q.messages.clear();
                true
            }
            None => false,
        }
    }

    pub fn delete_messages_of_exchange(&self, exchange: &str) -> bool {
        let mut inner = self.lock();
        match inner.exchanges.get_mut(exchange) {
            Some(e) => {
                e.messages.clear();
                true
            }
            None => false,
        }
    }

    pub fn message_ack(&self, tag: u32) {
        self.lock().acknowledged.insert(tag);
    }

    pub fn message_nack(&self, tag: u32, requeue: bool) {
        let mut inner = self.lock();
        if requeue {
            inner.requeued.insert(tag);
        } else {
            inner.not_acknowledged.insert(tag);
        }
    }

    /// Re-initialises exchanges, queues, bindings, and delivery-tag sets to
    /// their empty state. Users are seeded once from configuration and are
    /// left intact so a harness can keep authenticating after a flush.
    pub fn reset(&self) {
        self.lock().reset();
    }

    pub fn to_json(&self) -> Value {
        let inner = self.lock();
        let exchanges: serde_json::Map<String, Value> = inner
            .exchanges
            .iter()
            .map(|(name, ex)| {
                (
                    name.clone(),
                    json!({
                        "type": ex.exchange_type,
                        "messages": ex.messages.iter().map(StoredMessage::to_json).collect::<Vec<_>>(),
                    }),
                )
            })
            .collect();
        let queues: serde_json::Map<String, Value> = inner
            .queues
            .iter()
            .map(|(name, q)| {
                (
                    name.clone(),
                    json!({
                        "messages": q.messages.iter().map(StoredMessage::to_json).collect::<Vec<_>>(),
                        "consumers": q.consumers.keys().cloned().collect::<Vec<_>>(),
                    }),
                )
            })
            .collect();
        let bindings: serde_json::Map<String, Value> = inner
            .bindings
            .iter()
            .map(|(ex, queues)| (ex.clone(), json!(queues.iter().cloned().collect::<Vec<_>>())))
            .collect();
        json!({
            "exchanges": exchanges,
            "queues": queues,
            "bindings": bindings,
            "acknowledged": inner.acknowledged.iter().collect::<Vec<_>>(),
            "not_acknowledged": inner.not_acknowledged.iter().collect::<Vec<_>>(),
            "requeued": inner.requeued.iter().collect::<Vec<_>>(),
        })
    }

    async fn wait_until(&self, mut predicate: impl FnMut(&Self) -> bool) -> AmqpResult<()> {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            if predicate(self) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(AmqpError::WaitTimeout);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Waits for an authentication attempt on `username`; resolves to
    /// whether it succeeded, or times out if none was ever made.
    pub async fn wait_authentication_performed_on(&self, username: &str) -> AmqpResult<bool> {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            if let Some(result) = self.lock().authentication_tried_on.get(username).copied() {
                return Ok(result);
            }
            if Instant::now() >= deadline {
                return Err(AmqpError::WaitTimeout);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    pub async fn wait_message_acknowledged(&self, tag: u32) -> AmqpResult<()> {
        self.wait_until(|state| state.lock().acknowledged.contains(&tag)).await
    }

    pub async fn wait_message_not_acknowledged(&self, tag: u32) -> AmqpResult<()> {
        self.wait_until(|state| state.lock().not_acknowledged.contains(&tag)).await
    }

    pub async fn wait_message_requeued(&self, tag: u32) -> AmqpResult<()> {
        self.wait_until(|state| state.lock().requeued.contains(&tag)).await
    }

    pub async fn wait_queue_bound(&self, queue: &str, exchange: &str) -> AmqpResult<()> {
        self.wait_until(|state| {
            state
                .lock()
                .bindings
                .get(exchange)
                .map(|qs| qs.contains(queue))
                .unwrap_or(false)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecordingSink {
        closed: AtomicBool,
        pushed: Mutex<Vec<(u32, Vec<u8>)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(RecordingSink {
                closed: AtomicBool::new(false),
                pushed: Mutex::new(Vec::new()),
            })
        }
    }

    impl MessageSink for RecordingSink {
        fn push(
            &self,
            _channel: u16,
            _consumer_tag: &str,
            delivery_tag: u32,
            _exchange: &str,
            _routing_key: &str,
            _properties: &BasicProperties,
            body: &[u8],
        ) {
            self.pushed.lock().unwrap().push((delivery_tag, body.to_vec()));
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn broker() -> BrokerState {
        BrokerState::new("guest", "guest")
    }

    #[test]
    fn default_exchange_exists_and_credentials_check() {
        let state = broker();
        assert!(state.check_credentials("guest", b"guest"));
        assert!(!state.check_credentials("guest", b"wrong"));
        assert_eq!(state.get_messages_of_exchange("").unwrap().len(), 0);
    }

    #[test]
    fn declare_queue_binds_to_default_exchange() {
        let state = broker();
        state.declare_queue("q");
        assert!(state.bind_queue("q", ""));
        let inner = state.lock();
        assert!(inner.bindings[""].contains("q"));
    }

    #[test]
    fn redeclare_exchange_with_same_type_succeeds_different_type_fails() {
        let state = broker();
        assert!(state.declare_exchange("ex", "direct"));
        assert!(state.declare_exchange("ex", "direct"));
        assert!(!state.declare_exchange("ex", "fanout"));
    }

    #[test]
    fn store_message_fans_out_to_bound_queues() {
        let state = broker();
        state.declare_exchange("ex", "direct");
        state.declare_queue("q");
        state.bind_queue("q", "ex");
        assert!(state.store_message("ex", BasicProperties::default(), b"hello".to_vec()));
        assert_eq!(state.get_messages_of_exchange("ex").unwrap().len(), 1);
        assert_eq!(state.get_messages_of_queue("q").unwrap().len(), 1);
    }

    #[test]
    fn publish_message_dispatches_to_live_consumer_instead_of_buffering() {
        let state = broker();
        state.declare_exchange("ex", "direct");
        state.declare_queue("q");
        state.bind_queue("q", "ex");
        let sink = RecordingSink::new();
        assert!(state.register_consumer(sink.clone(), "c1", "q", 1));
        let tag = state
            .publish_message("ex", BasicProperties::default(), b"world".to_vec())
            .unwrap();
        assert_eq!(sink.pushed.lock().unwrap()[0].0, tag);
        // delivered straight to the consumer, not buffered in the queue log
        assert_eq!(state.get_messages_of_queue("q").unwrap().len(), 0);
    }

    #[test]
    fn publish_message_buffers_when_no_consumer() {
        let state = broker();
        state.declare_exchange("ex", "direct");
        state.declare_queue("q");
        state.bind_queue("q", "ex");
        state.publish_message("ex", BasicProperties::default(), b"world".to_vec());
        assert_eq!(state.get_messages_of_queue("q").unwrap().len(), 1);
    }

    #[test]
    fn publish_to_unknown_exchange_returns_none() {
        let state = broker();
        assert!(state.publish_message("nope", BasicProperties::default(), vec![]).is_none());
    }

    #[test]
    fn ack_nack_requeue_are_disjoint_sets() {
        let state = broker();
        state.message_ack(1);
        state.message_nack(2, false);
        state.message_nack(3, true);
        let inner = state.lock();
        assert!(inner.acknowledged.contains(&1));
        assert!(inner.not_acknowledged.contains(&2));
        assert!(inner.requeued.contains(&3));
    }

    #[tokio::test]
    async fn wait_message_acknowledged_resolves_once_true() {
        let state = broker();
        state.message_ack(42);
        state.wait_message_acknowledged(42).await.unwrap();
    }

    #[tokio::test]
    async fn wait_authentication_performed_on_reports_failure() {
        let state = broker();
        state.check_credentials("guest", b"bad");
        let result = state.wait_authentication_performed_on("guest").await.unwrap();
        assert!(!result);
    }

    #[test]
    fn reset_clears_dynamic_state_but_keeps_users() {
        let state = broker();
        state.declare_exchange("ex", "direct");
        state.declare_queue("q");
        state.message_ack(1);
        state.reset();
        assert!(state.get_messages_of_exchange("ex").is_none());
        assert!(state.get_messages_of_queue("q").is_none());
        assert!(state.check_credentials("guest", b"guest"));
    }
}
